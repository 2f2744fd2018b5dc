//! Health aggregation
//!
//! Read-only rollups of broker connectivity, the response consumer, circuit
//! breakers, the correlation registry and the tracer. The broker and the
//! response consumer are critical dependencies; open circuit breakers only
//! degrade the verdict since the rest of the fleet keeps working.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde_json::{Value, json};

use crate::broker::BrokerClient;
use crate::correlation::CorrelationManager;
use crate::resilience::{BreakerRegistry, CircuitState};
use crate::tracer::RequestTracer;

/// Overall verdict of a detailed health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallHealth {
    /// All dependencies fine.
    Healthy,
    /// A non-critical dependency is failing.
    Degraded,
    /// A critical dependency is failing.
    Unhealthy,
}

impl OverallHealth {
    /// Wire spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Whether the verdict maps to HTTP 200.
    #[must_use]
    pub fn is_serving(self) -> bool {
        !matches!(self, Self::Unhealthy)
    }
}

/// Aggregates dependency state for the operational endpoints.
pub struct HealthMonitor {
    broker: Arc<BrokerClient>,
    correlation: Arc<CorrelationManager>,
    breakers: Arc<BreakerRegistry>,
    tracer: Arc<RequestTracer>,
    consumer_ready: Arc<AtomicBool>,
    started_at: Instant,
}

impl HealthMonitor {
    /// Wires the monitor over its dependencies.
    #[must_use]
    pub fn new(
        broker: Arc<BrokerClient>,
        correlation: Arc<CorrelationManager>,
        breakers: Arc<BreakerRegistry>,
        tracer: Arc<RequestTracer>,
        consumer_ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            broker,
            correlation,
            breakers,
            tracer,
            consumer_ready,
            started_at: Instant::now(),
        }
    }

    /// Liveness: the process is up and the event loop responsive.
    #[must_use]
    pub fn liveness(&self) -> Value {
        json!({
            "status": "alive",
            "uptime_seconds": self.started_at.elapsed().as_secs(),
        })
    }

    /// Readiness: broker reachable and the response consumer subscribed.
    #[must_use]
    pub fn readiness(&self) -> (bool, Value) {
        let broker_connected = self.broker.is_connected();
        let consumer_ready = self.consumer_ready.load(Ordering::Relaxed);
        let ready = broker_connected && consumer_ready;
        let check = |ok: bool| if ok { "ready" } else { "not_ready" };
        let body = json!({
            "status": check(ready),
            "checks": {
                "broker": {"status": check(broker_connected)},
                "response_consumer": {"status": check(consumer_ready)},
            },
        });
        (ready, body)
    }

    /// Detailed health with per-dependency checks.
    ///
    /// Runs the broker round-trip probe, so this one suspends.
    pub async fn detailed(&self) -> (OverallHealth, Value) {
        let broker_ok = self.broker.health_check().await;
        let consumer_ready = self.consumer_ready.load(Ordering::Relaxed);
        let snapshots = self.breakers.snapshots();
        let open_breakers: Vec<String> = snapshots
            .iter()
            .filter(|s| s.state != CircuitState::Closed)
            .map(|s| s.service.as_str().to_string())
            .collect();

        let overall = if !broker_ok || !consumer_ready {
            OverallHealth::Unhealthy
        } else if open_breakers.is_empty() {
            OverallHealth::Healthy
        } else {
            OverallHealth::Degraded
        };

        let status = |ok: bool| if ok { "healthy" } else { "unhealthy" };
        let correlation = self.correlation.stats();
        let body = json!({
            "status": overall.as_str(),
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "checks": {
                "broker": {"status": status(broker_ok)},
                "response_consumer": {"status": status(consumer_ready)},
                "circuit_breakers": {
                    "status": if open_breakers.is_empty() { "healthy" } else { "degraded" },
                    "total": snapshots.len(),
                    "open": open_breakers,
                },
                "correlation": correlation,
                "tracer": {"active": self.tracer.active_count()},
            },
        });
        (overall, body)
    }

    /// Flat metrics rollup for the metrics endpoint.
    #[must_use]
    pub fn metrics(&self) -> Value {
        let correlation = self.correlation.stats();
        json!({
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "broker_connected": self.broker.is_connected(),
            "pending_requests": correlation.pending,
            "resolved_requests": correlation.resolved,
            "expired_requests": correlation.expired,
            "dropped_replies": correlation.dropped_replies,
            "active_traces": self.tracer.active_count(),
            "circuit_breakers": self.breakers.snapshots(),
        })
    }
}
