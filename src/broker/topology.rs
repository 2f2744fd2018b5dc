//! Broker topology owned by the core
//!
//! Three durable exchanges and the queues bound to them. Declarations are
//! idempotent on the broker side, so they run on every (re)connect.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};

use crate::domain_types::ServiceName;

/// Direct exchange carrying request envelopes to service queues.
pub const SERVICE_REQUESTS_EXCHANGE: &str = "service_requests";
/// Direct exchange carrying reply envelopes back to the core.
pub const SERVICE_RESPONSES_EXCHANGE: &str = "service_responses";
/// Topic exchange for pub/sub notifications; not on the request path.
pub const SERVICE_EVENTS_EXCHANGE: &str = "service_events";
/// The core's reply queue and its routing key.
pub const CORE_RESPONSE_QUEUE: &str = "core.responses";
/// Routing key services publish replies under.
pub const CORE_RESPONSE_ROUTING_KEY: &str = "core.responses";

fn durable() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

/// Declares the three shared exchanges.
///
/// # Errors
///
/// Propagates the broker error unchanged.
pub async fn declare_exchanges(channel: &Channel) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            SERVICE_REQUESTS_EXCHANGE,
            ExchangeKind::Direct,
            durable(),
            FieldTable::default(),
        )
        .await?;
    channel
        .exchange_declare(
            SERVICE_RESPONSES_EXCHANGE,
            ExchangeKind::Direct,
            durable(),
            FieldTable::default(),
        )
        .await?;
    channel
        .exchange_declare(
            SERVICE_EVENTS_EXCHANGE,
            ExchangeKind::Topic,
            durable(),
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

/// Declares a durable queue and binds it to an exchange.
///
/// # Errors
///
/// Propagates the broker error unchanged.
pub async fn declare_bound_queue(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<(), lapin::Error> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

/// Declares one service block's request queue.
///
/// # Errors
///
/// Propagates the broker error unchanged.
pub async fn declare_service_queue(
    channel: &Channel,
    service: &ServiceName,
) -> Result<(), lapin::Error> {
    let queue = service.request_queue();
    declare_bound_queue(channel, &queue, SERVICE_REQUESTS_EXCHANGE, &queue).await
}

/// Declares the core's reply queue.
///
/// # Errors
///
/// Propagates the broker error unchanged.
pub async fn declare_core_response_queue(channel: &Channel) -> Result<(), lapin::Error> {
    declare_bound_queue(
        channel,
        CORE_RESPONSE_QUEUE,
        SERVICE_RESPONSES_EXCHANGE,
        CORE_RESPONSE_ROUTING_KEY,
    )
    .await
}
