//! Service request router
//!
//! Maps endpoint prefixes to destination service blocks and drives the full
//! dispatch: breaker admission, pending-call registration, envelope publish,
//! and the await on the correlated reply. Publishing goes through a trait so
//! the dispatch path can be exercised without a live broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

use crate::broker::BrokerClient;
use crate::broker::topology::SERVICE_REQUESTS_EXCHANGE;
use crate::config::{RequestSettings, RetrySettings, RouteRule};
use crate::correlation::CorrelationManager;
use crate::domain_types::{CorrelationId, ServiceName};
use crate::envelope::{Method, RequestEnvelope, UserContext};
use crate::error::GatewayError;
use crate::resilience::{BreakerRegistry, retry_with_backoff};
use crate::tracer::RequestTracer;

/// Seam between the router and the broker.
#[async_trait]
pub trait RequestPublisher: Send + Sync {
    /// Publishes a request envelope onto the service's request queue.
    async fn publish_request(
        &self,
        service: &ServiceName,
        envelope: &RequestEnvelope,
    ) -> Result<(), GatewayError>;
}

#[async_trait]
impl RequestPublisher for BrokerClient {
    async fn publish_request(
        &self,
        service: &ServiceName,
        envelope: &RequestEnvelope,
    ) -> Result<(), GatewayError> {
        let body = serde_json::to_vec(envelope)?;
        self.publish(
            SERVICE_REQUESTS_EXCHANGE,
            &service.request_queue(),
            &body,
            Some(&envelope.correlation_id),
            &[("service_name", "core".to_string())],
        )
        .await
    }
}

/// Routes `(method, path)` pairs to service blocks and dispatches envelopes.
pub struct ServiceRouter {
    routes: Vec<RouteRule>,
    publisher: Arc<dyn RequestPublisher>,
    correlation: Arc<CorrelationManager>,
    breakers: Arc<BreakerRegistry>,
    tracer: Arc<RequestTracer>,
    retry: RetrySettings,
    request: RequestSettings,
}

impl ServiceRouter {
    /// Wires a router over its collaborators.
    #[must_use]
    pub fn new(
        routes: Vec<RouteRule>,
        publisher: Arc<dyn RequestPublisher>,
        correlation: Arc<CorrelationManager>,
        breakers: Arc<BreakerRegistry>,
        tracer: Arc<RequestTracer>,
        retry: RetrySettings,
        request: RequestSettings,
    ) -> Self {
        Self {
            routes,
            publisher,
            correlation,
            breakers,
            tracer,
            retry,
            request,
        }
    }

    /// Resolves a path to its destination service.
    ///
    /// The table is evaluated in declared order; the first prefix that
    /// matches the normalised path wins.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownEndpoint`] when no row matches.
    pub fn resolve(&self, path: &str) -> Result<ServiceName, GatewayError> {
        let endpoint = normalize_path(path);
        self.routes
            .iter()
            .find(|rule| {
                endpoint == rule.prefix
                    || endpoint
                        .strip_prefix(rule.prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .map(|rule| rule.service.clone())
            .ok_or_else(|| GatewayError::UnknownEndpoint(endpoint))
    }

    /// Dispatches one request and awaits its correlated reply.
    ///
    /// The deadline is absolute: retries against a broker outage never
    /// extend the caller's wall-clock budget. Breaker accounting follows the
    /// outcome of every attempt.
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`] kind the dispatch path can produce: unknown
    /// endpoint, breaker open, backpressure, broker failure after retries,
    /// timeout, or the service-reported error.
    pub async fn dispatch(
        &self,
        method: Method,
        path: &str,
        data: Value,
        mut user_context: UserContext,
        timeout: Option<Duration>,
    ) -> Result<Value, GatewayError> {
        let endpoint = normalize_path(path);
        let service = self.resolve(&endpoint)?;
        let correlation_id = CorrelationId::generate();
        user_context.trace_id = Some(correlation_id.as_str().to_string());

        let span = info_span!(
            "dispatch",
            correlation_id = %correlation_id,
            service = %service,
            method = %method,
            endpoint = %endpoint
        );

        self.tracer
            .start(correlation_id.clone(), &user_context.user_id);
        let started = Instant::now();
        let deadline = started + timeout.unwrap_or(self.request.default_timeout);

        let breaker = self.breakers.breaker(&service);
        let result = retry_with_backoff(&self.retry, deadline, || {
            let breaker = Arc::clone(&breaker);
            let publisher = Arc::clone(&self.publisher);
            let correlation = Arc::clone(&self.correlation);
            let service = service.clone();
            let correlation_id = correlation_id.clone();
            let endpoint = endpoint.clone();
            let data = data.clone();
            let user_context = user_context.clone();
            async move {
                breaker.try_acquire()?;

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(GatewayError::Timeout {
                        service: service.clone(),
                        elapsed_ms: 0,
                    });
                }

                let call = correlation.register(
                    correlation_id.clone(),
                    service.clone(),
                    method,
                    &endpoint,
                    remaining,
                )?;
                let envelope = RequestEnvelope::new(
                    correlation_id,
                    method,
                    endpoint,
                    data,
                    user_context,
                );

                let outcome = async {
                    publisher.publish_request(&service, &envelope).await?;
                    debug!("request published, awaiting reply");
                    call.await_reply().await
                }
                .await;

                match outcome {
                    Ok(value) => {
                        breaker.record_success();
                        Ok(value)
                    }
                    Err(err) => {
                        if err.counts_as_breaker_failure() {
                            breaker.record_failure();
                        }
                        Err(err)
                    }
                }
            }
        })
        .instrument(span)
        .await;

        let elapsed = started.elapsed();
        let operation = format!("{method} {endpoint}");
        let error_text = result.as_ref().err().map(ToString::to_string);
        self.tracer.record_call(
            &correlation_id,
            &service,
            &operation,
            elapsed,
            error_text.as_deref(),
        );
        self.tracer.complete(&correlation_id, result.is_err());

        result
    }

    /// Exhausted broker retries surface as `ServiceUnavailable` at the edge.
    ///
    /// Kept here so the HTTP layer does not special-case broker errors.
    #[must_use]
    pub fn map_exhausted(err: GatewayError) -> GatewayError {
        match err {
            GatewayError::BrokerUnavailable(message) => GatewayError::ServiceUnavailable(message),
            other => other,
        }
    }
}

/// Trims whitespace and surrounding slashes off a request path.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    path.trim().trim_matches('/').to_string()
}
