//! Resilient broker client
//!
//! One connection per process, a publisher channel, and per-consumer channels
//! created on demand so publishing and consuming never block each other. The
//! supervisor task owns all reconnect logic: consumers observe the `watch`
//! signal and re-subscribe when it flips back to connected. A small local
//! breaker caps connect storms after repeated failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::topology;
use crate::config::BrokerSettings;
use crate::domain_types::CorrelationId;
use crate::error::GatewayError;
use crate::resilience::backoff_delay;

struct Live {
    connection: Connection,
    publisher: Channel,
}

#[derive(Debug, Clone)]
struct OwnedQueue {
    name: String,
    exchange: String,
    routing_key: String,
}

/// The shared broker client.
pub struct BrokerClient {
    settings: BrokerSettings,
    owner: String,
    live: RwLock<Option<Live>>,
    connected_tx: watch::Sender<bool>,
    connect_failures: AtomicU32,
    cooldown_until: Mutex<Option<Instant>>,
    owned_queues: Mutex<Vec<OwnedQueue>>,
}

impl BrokerClient {
    /// Builds a disconnected client owned by the named process.
    #[must_use]
    pub fn new(settings: BrokerSettings, owner: impl Into<String>) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            owner: owner.into(),
            live: RwLock::new(None),
            connected_tx,
            connect_failures: AtomicU32::new(0),
            cooldown_until: Mutex::new(None),
            owned_queues: Mutex::new(Vec::new()),
        })
    }

    /// Whether the connection is currently believed healthy.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// A receiver for the connected/disconnected signal consumers watch.
    #[must_use]
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Establishes the connection, declares exchanges and owned queues.
    ///
    /// Makes up to `connect_attempts` tries. The local breaker short-circuits
    /// the whole call while its cooldown is running.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BrokerUnavailable`] when every attempt failed
    /// or the local breaker refused.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        {
            let mut cooldown = self.cooldown_until.lock().await;
            if let Some(until) = *cooldown {
                if Instant::now() < until {
                    return Err(GatewayError::BrokerUnavailable(
                        "broker connect breaker is cooling down".to_string(),
                    ));
                }
                *cooldown = None;
                info!("broker connect breaker cooldown elapsed, attempting again");
            }
        }

        let mut last_error = String::new();
        for attempt in 1..=self.settings.connect_attempts {
            match self.try_connect().await {
                Ok(live) => {
                    self.install(live).await?;
                    self.connect_failures.store(0, Ordering::Relaxed);
                    info!(owner = %self.owner, attempt, "connected to broker");
                    return Ok(());
                }
                Err(err) => {
                    warn!(owner = %self.owner, attempt, error = %err, "broker connect attempt failed");
                    last_error = err.to_string();
                    if attempt < self.settings.connect_attempts {
                        tokio::time::sleep(self.settings.reconnect_base_delay).await;
                    }
                }
            }
        }

        let failures = self.connect_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.settings.connect_failure_threshold.into_inner() {
            let mut cooldown = self.cooldown_until.lock().await;
            *cooldown = Some(Instant::now() + self.settings.connect_cooldown);
            self.connect_failures.store(0, Ordering::Relaxed);
            error!(
                owner = %self.owner,
                failures,
                cooldown_secs = self.settings.connect_cooldown.as_secs(),
                "broker connect breaker tripped"
            );
        }
        Err(GatewayError::BrokerUnavailable(last_error))
    }

    async fn try_connect(&self) -> Result<Live, lapin::Error> {
        let uri = apply_heartbeat(&self.settings.url, self.settings.heartbeat_secs);

        let mut client_properties = FieldTable::default();
        client_properties.insert(
            "service_name".into(),
            AMQPValue::LongString(self.owner.as_str().into()),
        );
        client_properties.insert(
            "connection_time".into(),
            AMQPValue::LongString(Utc::now().to_rfc3339().as_str().into()),
        );

        let options = ConnectionProperties {
            client_properties,
            ..ConnectionProperties::default()
        }
        .with_executor(tokio_executor_trait::Tokio::current());
        #[cfg(unix)]
        let options = options.with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(&uri, options).await?;
        let publisher = connection.create_channel().await?;
        Ok(Live {
            connection,
            publisher,
        })
    }

    async fn install(&self, live: Live) -> Result<(), GatewayError> {
        topology::declare_exchanges(&live.publisher)
            .await
            .map_err(broker_err)?;
        for queue in self.owned_queues.lock().await.iter() {
            topology::declare_bound_queue(
                &live.publisher,
                &queue.name,
                &queue.exchange,
                &queue.routing_key,
            )
            .await
            .map_err(broker_err)?;
        }
        *self.live.write().await = Some(live);
        let _ = self.connected_tx.send(true);
        Ok(())
    }

    /// Declares a durable queue now and re-declares it after every reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BrokerUnavailable`] when the declaration fails
    /// while connected; a disconnected client only records the registration.
    pub async fn declare_owned_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), GatewayError> {
        {
            let mut owned = self.owned_queues.lock().await;
            if !owned.iter().any(|q| q.name == queue) {
                owned.push(OwnedQueue {
                    name: queue.to_string(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
        }
        let live = self.live.read().await;
        if let Some(live) = live.as_ref() {
            topology::declare_bound_queue(&live.publisher, queue, exchange, routing_key)
                .await
                .map_err(broker_err)?;
        }
        Ok(())
    }

    /// Publishes a JSON body.
    ///
    /// Fails immediately while disconnected; outages never queue publishes.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BrokerUnavailable`] when no channel is open or
    /// the publish is rejected.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        correlation_id: Option<&CorrelationId>,
        headers: &[(&str, String)],
    ) -> Result<(), GatewayError> {
        let live = self.live.read().await;
        let Some(live) = live.as_ref() else {
            return Err(GatewayError::BrokerUnavailable(
                "not connected to broker".to_string(),
            ));
        };

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into());
        if let Some(id) = correlation_id {
            properties = properties.with_correlation_id(id.as_str().into());
        }
        if !headers.is_empty() {
            let mut table = FieldTable::default();
            for (key, value) in headers {
                table.insert((*key).into(), AMQPValue::LongString(value.as_str().into()));
            }
            properties = properties.with_headers(table);
        }

        let confirm = live
            .publisher
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await;
        match confirm {
            Ok(confirmation) => {
                confirmation.await.map_err(|err| {
                    self.mark_disconnected();
                    broker_err(err)
                })?;
                debug!(exchange, routing_key, bytes = body.len(), "published");
                Ok(())
            }
            Err(err) => {
                self.mark_disconnected();
                Err(broker_err(err))
            }
        }
    }

    /// Publishes a notification on the events topic exchange.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`BrokerClient::publish`].
    pub async fn publish_event(
        &self,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), GatewayError> {
        self.publish(
            topology::SERVICE_EVENTS_EXCHANGE,
            routing_key,
            body,
            None,
            &[("service_name", self.owner.clone())],
        )
        .await
    }

    /// Opens a dedicated consumer channel on a queue.
    ///
    /// The channel carries the configured prefetch so in-flight work per
    /// consumer stays bounded. Deliveries require an explicit ack.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BrokerUnavailable`] when disconnected or the
    /// subscription fails.
    pub async fn create_consumer(&self, queue: &str) -> Result<Consumer, GatewayError> {
        let live = self.live.read().await;
        let Some(live) = live.as_ref() else {
            return Err(GatewayError::BrokerUnavailable(
                "not connected to broker".to_string(),
            ));
        };

        let channel = live.connection.create_channel().await.map_err(broker_err)?;
        channel
            .basic_qos(self.settings.prefetch.as_u16(), BasicQosOptions::default())
            .await
            .map_err(broker_err)?;
        let consumer = channel
            .basic_consume(
                queue,
                &format!("{}-{queue}", self.owner),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;
        info!(queue, owner = %self.owner, "consumer subscribed");
        Ok(consumer)
    }

    /// Round-trip probe: declare and delete a temporary exclusive queue.
    pub async fn health_check(&self) -> bool {
        let live = self.live.read().await;
        let Some(live) = live.as_ref() else {
            return false;
        };
        if !live.connection.status().connected() {
            return false;
        }
        let probe = async {
            let queue = live
                .publisher
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            live.publisher
                .queue_delete(queue.name().as_str(), QueueDeleteOptions::default())
                .await?;
            Ok::<_, lapin::Error>(())
        };
        match probe.await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "broker health probe failed");
                false
            }
        }
    }

    /// Idempotent close: channels, then the connection.
    pub async fn close(&self) {
        let Some(live) = self.live.write().await.take() else {
            return;
        };
        let _ = self.connected_tx.send(false);
        if let Err(err) = live.publisher.close(200, "closing").await {
            debug!(error = %err, "publisher channel close");
        }
        if let Err(err) = live.connection.close(200, "closing").await {
            debug!(error = %err, "connection close");
        }
        info!(owner = %self.owner, "disconnected from broker");
    }

    /// Spawns the reconnect supervisor.
    ///
    /// While the connection is healthy the task idles; when it drops, the
    /// task reconnects with jittered exponential backoff and re-installs the
    /// topology. Consumers re-subscribe off the `watch` signal.
    pub fn spawn_supervisor(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                if client.connection_alive().await {
                    attempt = 0;
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }

                client.mark_disconnected();
                match client.connect().await {
                    Ok(()) => {
                        attempt = 0;
                    }
                    Err(err) => {
                        let delay = backoff_delay(
                            client.settings.reconnect_base_delay,
                            client.settings.reconnect_max_delay,
                            2.0,
                            true,
                            attempt,
                        );
                        attempt = attempt.saturating_add(1);
                        warn!(
                            error = %err,
                            retry_in_ms = delay.as_millis() as u64,
                            "broker unreachable, backing off"
                        );
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        })
    }

    async fn connection_alive(&self) -> bool {
        let live = self.live.read().await;
        live.as_ref()
            .is_some_and(|l| l.connection.status().connected())
    }

    fn mark_disconnected(&self) {
        if *self.connected_tx.borrow() {
            warn!(owner = %self.owner, "broker connection lost");
        }
        let _ = self.connected_tx.send(false);
    }
}

fn broker_err(err: lapin::Error) -> GatewayError {
    GatewayError::BrokerUnavailable(err.to_string())
}

/// Applies the configured heartbeat to an AMQP URI query string.
fn apply_heartbeat(url: &str, heartbeat_secs: u16) -> String {
    if url.contains("heartbeat=") {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}heartbeat={heartbeat_secs}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_appended_once() {
        assert_eq!(
            apply_heartbeat("amqp://localhost:5672/%2f", 60),
            "amqp://localhost:5672/%2f?heartbeat=60"
        );
        assert_eq!(
            apply_heartbeat("amqp://localhost:5672/%2f?frame_max=8192", 30),
            "amqp://localhost:5672/%2f?frame_max=8192&heartbeat=30"
        );
        assert_eq!(
            apply_heartbeat("amqp://localhost/?heartbeat=15", 60),
            "amqp://localhost/?heartbeat=15"
        );
    }

    #[tokio::test]
    async fn publish_fails_fast_while_disconnected() {
        let client = BrokerClient::new(BrokerSettings::default(), "core");
        let result = client
            .publish("service_requests", "gps.requests", b"{}", None, &[])
            .await;
        assert!(matches!(result, Err(GatewayError::BrokerUnavailable(_))));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn health_check_is_false_while_disconnected() {
        let client = BrokerClient::new(BrokerSettings::default(), "core");
        assert!(!client.health_check().await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = BrokerClient::new(BrokerSettings::default(), "core");
        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn owned_queues_are_recorded_while_disconnected() {
        let client = BrokerClient::new(BrokerSettings::default(), "gps");
        client
            .declare_owned_queue("gps.requests", "service_requests", "gps.requests")
            .await
            .unwrap();
        // No connection: registration succeeds and is replayed on connect.
        assert!(!client.is_connected());
    }
}
