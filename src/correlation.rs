//! Response correlation
//!
//! The process-wide registry matching broker replies back to their waiting
//! HTTP callers. Each dispatch registers a oneshot completion handle keyed by
//! correlation id; the response consumer resolves it from another task. A
//! sweeper expires entries whose deadlines passed even when no awaiter is
//! scheduled, and dropping an un-awaited call cancels its entry, so every
//! registration is resolved at most once and removed within one housekeeping
//! tick of its deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RequestSettings;
use crate::domain_types::{CorrelationId, ServiceName};
use crate::envelope::Method;
use crate::error::GatewayError;

type ReplySender = oneshot::Sender<Result<Value, GatewayError>>;

struct PendingEntry {
    sender: ReplySender,
    deadline: Instant,
    service: ServiceName,
    method: Method,
    endpoint: String,
    created_at: Instant,
}

/// Counters exposed through the metrics endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CorrelationStats {
    /// Entries currently awaiting a reply.
    pub pending: usize,
    /// Soft cap on pending entries.
    pub soft_cap: usize,
    /// Replies delivered to a waiting caller.
    pub resolved: u64,
    /// Entries expired by deadline.
    pub expired: u64,
    /// Replies that arrived with no registered entry (late or unknown).
    pub dropped_replies: u64,
}

/// Registry of in-flight dispatches keyed by correlation id.
pub struct CorrelationManager {
    settings: RequestSettings,
    pending: Arc<DashMap<CorrelationId, PendingEntry>>,
    resolved: AtomicU64,
    expired: Arc<AtomicU64>,
    dropped_replies: AtomicU64,
}

impl CorrelationManager {
    /// Builds an empty registry.
    #[must_use]
    pub fn new(settings: RequestSettings) -> Self {
        Self {
            settings,
            pending: Arc::new(DashMap::new()),
            resolved: AtomicU64::new(0),
            expired: Arc::new(AtomicU64::new(0)),
            dropped_replies: AtomicU64::new(0),
        }
    }

    /// Registers a dispatch and returns the handle its caller awaits on.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BackpressureRejected`] when the registry is at
    /// its soft cap.
    pub fn register(
        &self,
        correlation_id: CorrelationId,
        service: ServiceName,
        method: Method,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<PendingCall, GatewayError> {
        if self.pending.len() >= self.settings.pending_soft_cap.as_usize() {
            warn!(
                pending = self.pending.len(),
                "correlation registry over soft cap, rejecting dispatch"
            );
            return Err(GatewayError::BackpressureRejected);
        }

        let (sender, receiver) = oneshot::channel();
        let now = Instant::now();
        let deadline = now + timeout;
        self.pending.insert(
            correlation_id.clone(),
            PendingEntry {
                sender,
                deadline,
                service: service.clone(),
                method,
                endpoint: endpoint.to_string(),
                created_at: now,
            },
        );
        debug!(correlation_id = %correlation_id, %service, timeout_ms = timeout.as_millis() as u64, "pending entry registered");

        Ok(PendingCall {
            correlation_id,
            service,
            deadline,
            created_at: now,
            receiver: Some(receiver),
            pending: Arc::clone(&self.pending),
        })
    }

    /// Delivers a reply (or a service error) to the waiting caller.
    ///
    /// Returns false when no entry is registered under the id, which covers
    /// both late replies and replies to cancelled callers; those are logged
    /// and dropped.
    pub fn resolve(&self, correlation_id: &CorrelationId, outcome: Result<Value, GatewayError>) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, entry)) => {
                if entry.sender.send(outcome).is_ok() {
                    self.resolved.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    // The awaiter gave up (deadline or disconnect) between
                    // lookup and delivery.
                    self.dropped_replies.fetch_add(1, Ordering::Relaxed);
                    debug!(correlation_id = %correlation_id, "reply arrived for abandoned caller, dropped");
                    false
                }
            }
            None => {
                self.dropped_replies.fetch_add(1, Ordering::Relaxed);
                warn!(correlation_id = %correlation_id, "reply for unknown correlation id, dropped");
                false
            }
        }
    }

    /// Whether an id currently has a pending entry.
    #[must_use]
    pub fn is_registered(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            pending: self.pending.len(),
            soft_cap: self.settings.pending_soft_cap.as_usize(),
            resolved: self.resolved.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            dropped_replies: self.dropped_replies.load(Ordering::Relaxed),
        }
    }

    /// Spawns the expiry sweeper.
    ///
    /// The sweeper guarantees liveness for entries nobody is awaiting: every
    /// entry is expired within one tick of its deadline.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        let expired = Arc::clone(&self.expired);
        let interval = self.settings.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = shutdown.cancelled() => break,
                }

                let now = Instant::now();
                let overdue: Vec<CorrelationId> = pending
                    .iter()
                    .filter(|entry| entry.value().deadline <= now)
                    .map(|entry| entry.key().clone())
                    .collect();

                for id in overdue {
                    if let Some((_, entry)) = pending.remove(&id) {
                        expired.fetch_add(1, Ordering::Relaxed);
                        let elapsed_ms = entry.created_at.elapsed().as_millis() as u64;
                        warn!(
                            correlation_id = %id,
                            service = %entry.service,
                            method = %entry.method,
                            endpoint = %entry.endpoint,
                            elapsed_ms,
                            "pending entry expired"
                        );
                        let _ = entry.sender.send(Err(GatewayError::Timeout {
                            service: entry.service,
                            elapsed_ms,
                        }));
                    }
                }
            }

            // Shutdown: fail whatever is still in flight so callers unblock.
            let leftover: Vec<CorrelationId> =
                pending.iter().map(|entry| entry.key().clone()).collect();
            for id in leftover {
                if let Some((_, entry)) = pending.remove(&id) {
                    let _ = entry
                        .sender
                        .send(Err(GatewayError::ServiceUnavailable("gateway shutting down".into())));
                }
            }
        })
    }
}

/// The caller-side handle for one registered dispatch.
///
/// Dropping the handle without awaiting it cancels the entry, so an HTTP
/// disconnect cleans up after itself; a reply arriving later finds nothing
/// registered and is dropped.
pub struct PendingCall {
    correlation_id: CorrelationId,
    service: ServiceName,
    deadline: Instant,
    created_at: Instant,
    receiver: Option<oneshot::Receiver<Result<Value, GatewayError>>>,
    pending: Arc<DashMap<CorrelationId, PendingEntry>>,
}

impl PendingCall {
    /// The id this call is registered under.
    #[must_use]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Suspends until the reply arrives or the deadline passes.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Timeout`] at the deadline; otherwise whatever outcome
    /// the resolver delivered.
    pub async fn await_reply(mut self) -> Result<Value, GatewayError> {
        let receiver = self.receiver.take().expect("receiver taken once");
        match tokio::time::timeout_at(self.deadline, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayError::Internal(
                "pending entry dropped before resolution".to_string(),
            )),
            Err(_) => {
                // Deadline elapsed with the reply still outstanding. Remove
                // the entry so a late reply is dropped, not delivered.
                self.pending.remove(&self.correlation_id);
                Err(GatewayError::Timeout {
                    service: self.service.clone(),
                    elapsed_ms: self.created_at.elapsed().as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        // Still holding the receiver means the call was never awaited to
        // completion: cancellation. Resolved calls found the entry already
        // removed by the resolver.
        if self.receiver.is_some() {
            self.pending.remove(&self.correlation_id);
        }
    }
}
