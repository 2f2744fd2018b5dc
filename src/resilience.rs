//! Circuit breakers and retry with backoff
//!
//! One breaker per destination service plus the shared jittered-backoff
//! helpers used by the dispatch retry wrapper and the broker reconnect
//! supervisor. Hot paths read the breaker state from an atomic; the lock is
//! only taken around transitions.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{CircuitSettings, RetrySettings};
use crate::domain_types::ServiceName;
use crate::error::GatewayError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast.
    Open,
    /// Probing whether the service recovered.
    HalfOpen,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    failure_count: u32,
    last_failure_at: Option<Instant>,
    half_open_calls: u32,
}

/// Point-in-time view of one breaker, for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Destination service.
    pub service: ServiceName,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed.
    pub failure_count: u32,
    /// Seconds since the last failure, if any.
    pub seconds_since_last_failure: Option<u64>,
    /// Probes admitted since entering half-open.
    pub half_open_calls: u32,
}

/// Per-destination circuit breaker.
///
/// Transitions: `CLOSED --threshold failures--> OPEN --open_timeout-->
/// HALF_OPEN --probe ok--> CLOSED`, with a probe failure snapping straight
/// back to `OPEN`.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: ServiceName,
    settings: CircuitSettings,
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Builds a closed breaker for one destination.
    #[must_use]
    pub fn new(service: ServiceName, settings: CircuitSettings) -> Self {
        Self {
            service,
            settings,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            inner: Mutex::new(BreakerInner {
                failure_count: 0,
                last_failure_at: None,
                half_open_calls: 0,
            }),
        }
    }

    /// Current state, lock-free.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Admission check before a dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ServiceUnavailable`] while the breaker is
    /// open, or while half-open with all probe slots taken.
    pub fn try_acquire(&self) -> Result<(), GatewayError> {
        if self.state() == CircuitState::Closed {
            return Ok(());
        }

        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure_at
                    .is_some_and(|at| at.elapsed() >= self.settings.open_timeout);
                if cooled_down {
                    info!(service = %self.service, "circuit breaker transitioning to half-open");
                    self.set_state(CircuitState::HalfOpen);
                    inner.half_open_calls = 1;
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.settings.half_open_max_calls.into_inner() {
                    Err(self.open_error())
                } else {
                    inner.half_open_calls += 1;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful call; closes the breaker if it was probing.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if self.state() == CircuitState::HalfOpen {
            info!(service = %self.service, "circuit breaker closing after successful probe");
            self.set_state(CircuitState::Closed);
        }
        inner.failure_count = 0;
        inner.last_failure_at = None;
        inner.half_open_calls = 0;
    }

    /// Records a failed call; may open the breaker.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());

        match self.state() {
            CircuitState::Closed => {
                if inner.failure_count >= self.settings.failure_threshold.into_inner() {
                    warn!(
                        service = %self.service,
                        failures = inner.failure_count,
                        "circuit breaker opening"
                    );
                    self.set_state(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(service = %self.service, "probe failed, circuit breaker re-opening");
                self.set_state(CircuitState::Open);
                inner.half_open_calls = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the breaker back to closed and clears counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.set_state(CircuitState::Closed);
        inner.failure_count = 0;
        inner.last_failure_at = None;
        inner.half_open_calls = 0;
        info!(service = %self.service, "circuit breaker reset");
    }

    /// Snapshot for the health surface.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            service: self.service.clone(),
            state: self.state(),
            failure_count: inner.failure_count,
            seconds_since_last_failure: inner.last_failure_at.map(|at| at.elapsed().as_secs()),
            half_open_calls: inner.half_open_calls,
        }
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn open_error(&self) -> GatewayError {
        GatewayError::ServiceUnavailable(format!(
            "circuit breaker for '{}' is open",
            self.service
        ))
    }
}

/// All per-destination breakers, created lazily on first dispatch.
#[derive(Debug)]
pub struct BreakerRegistry {
    settings: CircuitSettings,
    breakers: DashMap<ServiceName, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new(settings: CircuitSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    /// Gets or creates the breaker for a destination.
    #[must_use]
    pub fn breaker(&self, service: &ServiceName) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service.clone(), self.settings.clone()))
            })
            .clone()
    }

    /// Snapshots every known breaker.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Resets one breaker; returns false when the destination is unknown.
    pub fn reset(&self, service: &ServiceName) -> bool {
        match self.breakers.get(service) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Resets every breaker.
    pub fn reset_all(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
    }
}

/// Exponential backoff delay for the given zero-based attempt.
///
/// `jitter` scales the delay by a uniform 0.5–1.0× factor to spread
/// simultaneous retries apart.
#[must_use]
pub fn backoff_delay(
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    attempt: u32,
) -> Duration {
    let exp = factor.powi(attempt.min(24) as i32);
    let mut delay = base.mul_f64(exp).min(max);
    if jitter {
        delay = delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0));
    }
    delay
}

/// Runs `op` with the configured retry budget, never past `deadline`.
///
/// Only errors whose kind is transient (see
/// [`GatewayError::is_retryable`]) are re-attempted; everything else
/// propagates immediately, as does the final attempt's error.
///
/// # Errors
///
/// The last error observed when the budget or the deadline is exhausted.
pub async fn retry_with_backoff<F, Fut, T>(
    settings: &RetrySettings,
    deadline: Instant,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let max_attempts = settings.max_attempts.into_inner();
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let out_of_budget = attempt + 1 >= max_attempts;
                if !err.is_retryable() || out_of_budget {
                    return Err(err);
                }
                let delay = backoff_delay(
                    settings.base_delay,
                    settings.max_delay,
                    settings.backoff_factor,
                    settings.jitter,
                    attempt,
                );
                if Instant::now() + delay >= deadline {
                    return Err(err);
                }
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "dispatch attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
