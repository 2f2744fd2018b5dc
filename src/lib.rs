//! # Fleetgate — fleet-management gateway and message-bus router
//!
//! Fleetgate is the core service of a fleet-management platform: it accepts
//! HTTP requests, authenticates and authorises them, and dispatches each one
//! to a back-end service block (vehicle management, maintenance, GPS, trip
//! planning, utilities) over an AMQP broker using a correlated
//! request/response pattern. The asynchronous reply is matched back to the
//! waiting caller and translated into the HTTP response.
//!
//! ## Architecture
//!
//! ```text
//! HTTP ingress
//!   -> auth (bearer token -> user context)
//!   -> ServiceRouter.resolve(path) -> service block
//!   -> dispatch: envelope onto `service_requests`
//!        routing_key = "<service>.requests"
//!   -> CorrelationManager.await(correlation_id, deadline)
//!        (service block consumes, handles, replies onto
//!         `service_responses` with routing_key "core.responses")
//!   -> reply resolved -> HTTP response
//! ```
//!
//! The crate also ships the mirror-image [`consumer::ServiceConsumer`]
//! library every service block runs: consume, deduplicate, validate,
//! dispatch to a registered handler, and always publish a reply.
//!
//! Resilience comes from one circuit breaker per destination service, a
//! jittered-backoff retry wrapper for transient broker failures, and a
//! broker client that owns all reconnect logic while consumers just watch a
//! connected/disconnected signal.

pub mod auth;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod correlation;
pub mod dedup;
pub mod domain_types;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod health;
pub mod resilience;
pub mod rest_api;
pub mod router;
pub mod server;
pub mod tracer;

pub use auth::{AuthDecision, AuthValidator, RouteGuard};
pub use broker::BrokerClient;
pub use config::{GatewayConfig, RouteRule};
pub use consumer::{EndpointHandler, HandlerError, HandlerRequest, ServiceConsumer};
pub use correlation::{CorrelationManager, PendingCall};
pub use domain_types::{CorrelationId, ServiceName};
pub use envelope::{Method, RequestEnvelope, ResponseEnvelope, UserContext};
pub use error::GatewayError;
pub use gateway::Gateway;
pub use rest_api::{AppState, create_app};
pub use router::{RequestPublisher, ServiceRouter};
