//! Service request consumer
//!
//! The library every service block runs: subscribe to the block's request
//! queue, suppress duplicate deliveries, validate the envelope, dispatch to a
//! registered handler, and always publish a reply before acking. Delivery is
//! at-least-once; the dedup window absorbs replays for the life of the
//! process, and cross-restart idempotency stays the handler's business.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::BasicAckOptions;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::broker::topology::{
    CORE_RESPONSE_ROUTING_KEY, SERVICE_REQUESTS_EXCHANGE, SERVICE_RESPONSES_EXCHANGE,
};
use crate::config::DedupSettings;
use crate::dedup::{DedupStats, DedupWindow};
use crate::domain_types::{CorrelationId, ServiceName};
use crate::envelope::{Method, RequestEnvelope, ResponseEnvelope, UserContext};
use crate::router::normalize_path;

/// Failure a handler can report; its kind name becomes the wire `type`.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The addressed entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate or conflicting state.
    #[error("{0}")]
    Conflict(String),

    /// The request payload is unusable.
    #[error("{0}")]
    Validation(String),

    /// A domain-specific failure surfaced under its own type name.
    #[error("{message}")]
    Custom {
        /// Wire `type` for this failure.
        kind: String,
        /// Human-readable description.
        message: String,
    },

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    /// The wire `type` name for this failure.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::Validation(_) => "ValidationError",
            Self::Custom { kind, .. } => kind,
            Self::Internal(_) => "Internal",
        }
    }
}

/// The validated request a handler receives.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    /// HTTP method of the original call.
    pub method: Method,
    /// Full normalised endpoint, e.g. `api/trips/42`.
    pub endpoint: String,
    /// Request payload.
    pub data: Value,
    /// Caller identity as validated by the core.
    pub user_context: UserContext,
}

/// One business-logic entry point, registered per `(base_endpoint, method)`.
#[async_trait]
pub trait EndpointHandler: Send + Sync {
    /// Handles one request and returns the reply payload.
    async fn handle(&self, request: HandlerRequest) -> Result<Value, HandlerError>;
}

/// Consumes a service block's request queue and replies on behalf of its
/// registered handlers.
pub struct ServiceConsumer {
    service: ServiceName,
    broker: Arc<BrokerClient>,
    handlers: HashMap<(String, Method), Arc<dyn EndpointHandler>>,
    dedup: DedupWindow,
    processed: AtomicU64,
}

impl ServiceConsumer {
    /// Builds a consumer with no handlers registered yet.
    #[must_use]
    pub fn new(service: ServiceName, broker: Arc<BrokerClient>, dedup: &DedupSettings) -> Self {
        Self {
            service,
            broker,
            handlers: HashMap::new(),
            dedup: DedupWindow::new(dedup),
            processed: AtomicU64::new(0),
        }
    }

    /// Registers a handler for a base endpoint and method.
    ///
    /// The base endpoint is the first two path segments of the full
    /// endpoint (`api/trips/42` dispatches to `api/trips`).
    #[must_use]
    pub fn with_handler(
        mut self,
        base_endpoint: &str,
        method: Method,
        handler: Arc<dyn EndpointHandler>,
    ) -> Self {
        self.handlers
            .insert((normalize_path(base_endpoint), method), handler);
        self
    }

    /// Dedup statistics for the service's own health reporting.
    #[must_use]
    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    /// Runs the consume loop until shutdown.
    ///
    /// Re-subscribes whenever the broker client reports the connection back;
    /// it never reconnects on its own.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let queue = self.service.request_queue();
        let mut connected = self.broker.subscribe_connected();

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            while !*connected.borrow() {
                tokio::select! {
                    changed = connected.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    () = shutdown.cancelled() => return,
                }
            }

            if let Err(err) = self
                .broker
                .declare_owned_queue(&queue, SERVICE_REQUESTS_EXCHANGE, &queue)
                .await
            {
                warn!(service = %self.service, error = %err, "queue declaration failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
            let mut consumer = match self.broker.create_consumer(&queue).await {
                Ok(consumer) => consumer,
                Err(err) => {
                    warn!(service = %self.service, error = %err, "subscribe failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            info!(service = %self.service, queue, "service consumer started");

            loop {
                tokio::select! {
                    delivery = consumer.next() => match delivery {
                        Some(Ok(delivery)) => {
                            if let Some(reply) = self.process(&delivery.data).await {
                                self.send_reply(&reply).await;
                            }
                            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                                warn!(service = %self.service, error = %err, "ack failed");
                            }
                        }
                        Some(Err(err)) => {
                            warn!(service = %self.service, error = %err, "delivery stream error");
                            break;
                        }
                        None => break,
                    },
                    () = shutdown.cancelled() => return,
                }
            }
            debug!(service = %self.service, "consumer stream ended, waiting for reconnect");
        }
    }

    /// Processes one raw delivery and returns the reply to publish.
    ///
    /// Returns `None` only when no reply is possible (unparsable body with
    /// no recoverable correlation id) or wanted (duplicate delivery); the
    /// caller acks regardless.
    pub async fn process(&self, body: &[u8]) -> Option<ResponseEnvelope> {
        let raw: Value = match serde_json::from_slice(body) {
            Ok(raw) => raw,
            Err(err) => {
                error!(service = %self.service, error = %err, "unparsable request body, dropping");
                return None;
            }
        };

        let envelope: RequestEnvelope = match serde_json::from_value(raw.clone()) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Reply if the producer at least gave us an id to reply to.
                let correlation_id = raw
                    .get("correlation_id")
                    .and_then(Value::as_str)
                    .and_then(|s| CorrelationId::try_new(s).ok());
                return match correlation_id {
                    Some(id) => {
                        warn!(service = %self.service, correlation_id = %id, error = %err, "malformed request envelope");
                        Some(ResponseEnvelope::failure(
                            id,
                            "BadRequest",
                            format!("malformed request envelope: {err}"),
                        ))
                    }
                    None => {
                        error!(service = %self.service, error = %err, "malformed request without correlation id, dropping");
                        None
                    }
                };
            }
        };

        let correlation_id = envelope.correlation_id.clone();
        if self.dedup.contains(&correlation_id) {
            warn!(service = %self.service, correlation_id = %correlation_id, "duplicate request ignored");
            return None;
        }

        if let Err(err) = envelope.validate() {
            let _ = self.dedup.insert(&correlation_id);
            return Some(ResponseEnvelope::failure(
                correlation_id,
                "ValidationError",
                err.to_string(),
            ));
        }

        debug!(
            service = %self.service,
            correlation_id = %correlation_id,
            method = %envelope.method,
            endpoint = %envelope.endpoint,
            "processing request"
        );

        let reply = self.invoke(&envelope).await;
        let _ = self.dedup.insert(&correlation_id);
        self.processed.fetch_add(1, Ordering::Relaxed);
        Some(reply)
    }

    async fn invoke(&self, envelope: &RequestEnvelope) -> ResponseEnvelope {
        let endpoint = normalize_path(&envelope.endpoint);
        let correlation_id = envelope.correlation_id.clone();

        if envelope.method == Method::Get && (endpoint.is_empty() || endpoint == "health") {
            return ResponseEnvelope::success(correlation_id, self.health_payload());
        }

        let base = base_endpoint(&endpoint);
        let Some(handler) = self.handlers.get(&(base.clone(), envelope.method)) else {
            return ResponseEnvelope::failure(
                correlation_id,
                "NotFound",
                format!("no handler for {} {endpoint}", envelope.method),
            );
        };

        let request = HandlerRequest {
            method: envelope.method,
            endpoint,
            data: envelope.data.clone(),
            user_context: envelope.user_context.clone(),
        };
        match handler.handle(request).await {
            Ok(data) => ResponseEnvelope::success(correlation_id, data),
            Err(err) => {
                warn!(
                    service = %self.service,
                    correlation_id = %correlation_id,
                    kind = err.kind_name(),
                    error = %err,
                    "handler failed"
                );
                ResponseEnvelope::failure(correlation_id, err.kind_name(), err.to_string())
            }
        }
    }

    fn health_payload(&self) -> Value {
        json!({
            "status": "healthy",
            "service": self.service.as_str(),
            "requests_processed": self.processed.load(Ordering::Relaxed),
        })
    }

    async fn send_reply(&self, reply: &ResponseEnvelope) {
        let body = match serde_json::to_vec(reply) {
            Ok(body) => body,
            Err(err) => {
                error!(service = %self.service, error = %err, "reply serialisation failed");
                return;
            }
        };
        if let Err(err) = self
            .broker
            .publish(
                SERVICE_RESPONSES_EXCHANGE,
                CORE_RESPONSE_ROUTING_KEY,
                &body,
                Some(&reply.correlation_id),
                &[("service_name", self.service.as_str().to_string())],
            )
            .await
        {
            error!(
                service = %self.service,
                correlation_id = %reply.correlation_id,
                error = %err,
                "reply publish failed"
            );
        }
    }
}

/// First two path segments of a normalised endpoint.
#[must_use]
pub fn base_endpoint(endpoint: &str) -> String {
    endpoint.split('/').take(2).collect::<Vec<_>>().join("/")
}
