//! Core <-> service round trips without a broker
//!
//! Wires the router's publish seam straight into a real `ServiceConsumer`
//! and feeds its replies back through the response path, so the full
//! envelope lifecycle (dispatch, consume, dedup, handle, reply, correlate)
//! runs in-process exactly as it would across the wire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetgate::broker::BrokerClient;
use fleetgate::config::{DedupSettings, GatewayConfig, default_routes};
use fleetgate::consumer::{EndpointHandler, HandlerError, HandlerRequest, ServiceConsumer};
use fleetgate::correlation::CorrelationManager;
use fleetgate::domain_types::ServiceName;
use fleetgate::envelope::{Method, RequestEnvelope, UserContext};
use fleetgate::error::GatewayError;
use fleetgate::gateway::handle_response_bytes;
use fleetgate::resilience::BreakerRegistry;
use fleetgate::router::{RequestPublisher, ServiceRouter};
use fleetgate::tracer::RequestTracer;
use serde_json::{Value, json};

struct VehicleHandler;

#[async_trait]
impl EndpointHandler for VehicleHandler {
    async fn handle(&self, request: HandlerRequest) -> Result<Value, HandlerError> {
        match request.method {
            Method::Get => Ok(json!({"vehicles": [], "requested_by": request.user_context.user_id})),
            Method::Post => {
                if request.data.get("registration").is_none() {
                    return Err(HandlerError::Validation(
                        "registration is required".to_string(),
                    ));
                }
                Ok(json!({"created": true}))
            }
            _ => Err(HandlerError::NotFound("unsupported".to_string())),
        }
    }
}

struct SleepyHandler;

#[async_trait]
impl EndpointHandler for SleepyHandler {
    async fn handle(&self, _request: HandlerRequest) -> Result<Value, HandlerError> {
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok(json!({"too": "late"}))
    }
}

/// Routes published envelopes into the consumer and replies through the
/// response path, byte-for-byte like the broker would.
struct Loopback {
    consumer: Arc<ServiceConsumer>,
    correlation: Arc<CorrelationManager>,
}

#[async_trait]
impl RequestPublisher for Loopback {
    async fn publish_request(
        &self,
        _service: &ServiceName,
        envelope: &RequestEnvelope,
    ) -> Result<(), GatewayError> {
        let body = serde_json::to_vec(envelope)?;
        let consumer = Arc::clone(&self.consumer);
        let correlation = Arc::clone(&self.correlation);
        tokio::spawn(async move {
            if let Some(reply) = consumer.process(&body).await {
                let bytes = serde_json::to_vec(&reply).unwrap();
                handle_response_bytes(&correlation, &bytes);
            }
        });
        Ok(())
    }
}

fn build() -> (ServiceRouter, Arc<ServiceConsumer>, Arc<CorrelationManager>) {
    let mut config = GatewayConfig::default();
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.jitter = false;

    let broker = BrokerClient::new(config.broker.clone(), "management");
    let consumer = Arc::new(
        ServiceConsumer::new(
            ServiceName::try_new("management").unwrap(),
            broker,
            &DedupSettings::default(),
        )
        .with_handler("api/vehicles", Method::Get, Arc::new(VehicleHandler))
        .with_handler("api/vehicles", Method::Post, Arc::new(VehicleHandler))
        .with_handler("api/drivers", Method::Get, Arc::new(SleepyHandler)),
    );

    let correlation = Arc::new(CorrelationManager::new(config.request.clone()));
    let router = ServiceRouter::new(
        default_routes(),
        Arc::new(Loopback {
            consumer: Arc::clone(&consumer),
            correlation: Arc::clone(&correlation),
        }),
        Arc::clone(&correlation),
        Arc::new(BreakerRegistry::new(config.circuit.clone())),
        Arc::new(RequestTracer::new(config.trace.clone())),
        config.retry.clone(),
        config.request.clone(),
    );
    (router, consumer, correlation)
}

fn caller() -> UserContext {
    UserContext {
        user_id: "fleet-admin".to_string(),
        role: "admin".to_string(),
        permissions: vec!["*".to_string()],
        trace_id: None,
        client_ip: None,
    }
}

#[tokio::test]
async fn get_round_trips_through_the_consumer() {
    let (router, _consumer, correlation) = build();
    let value = router
        .dispatch(
            Method::Get,
            "/api/vehicles",
            Value::Null,
            caller(),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(value["requested_by"], json!("fleet-admin"));
    assert_eq!(correlation.stats().pending, 0);
    assert_eq!(correlation.stats().resolved, 1);
}

#[tokio::test]
async fn handler_validation_errors_surface_with_their_kind() {
    let (router, _consumer, _correlation) = build();
    let outcome = router
        .dispatch(
            Method::Post,
            "/api/vehicles",
            json!({"odometer": 1}),
            caller(),
            Some(Duration::from_secs(5)),
        )
        .await;
    match outcome {
        Err(GatewayError::Validation(message)) => {
            assert_eq!(message, "registration is required");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn sleepy_handler_cannot_hold_the_caller_past_its_deadline() {
    let (router, _consumer, correlation) = build();
    let outcome = router
        .dispatch(
            Method::Get,
            "/api/drivers",
            Value::Null,
            caller(),
            Some(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(outcome, Err(GatewayError::Timeout { .. })));

    // The handler finishes eventually; its late reply is dropped.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(correlation.stats().resolved, 0);
    assert!(correlation.stats().dropped_replies >= 1);
}

#[tokio::test]
async fn replayed_envelope_invokes_the_handler_once() {
    let (_router, consumer, correlation) = build();

    let envelope = RequestEnvelope::new(
        fleetgate::domain_types::CorrelationId::generate(),
        Method::Get,
        "api/vehicles",
        Value::Null,
        UserContext::system(),
    );
    let body = serde_json::to_vec(&envelope).unwrap();

    let first = consumer.process(&body).await;
    let second = consumer.process(&body).await;
    assert!(first.is_some());
    assert!(second.is_none(), "duplicate delivery must be dropped");

    // Exactly one reply flows back and resolves nothing (no caller here).
    let bytes = serde_json::to_vec(&first.unwrap()).unwrap();
    assert!(!handle_response_bytes(&correlation, &bytes));
    assert_eq!(correlation.stats().dropped_replies, 1);
}
