//! Per-request tracing
//!
//! A trace record opens for every dispatch, keyed by the correlation id, and
//! accumulates one entry per inter-service call. Completed records move to a
//! bounded ring buffer and age out after a retention window, so the traces
//! endpoints stay cheap no matter how long the process runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

use crate::config::TraceSettings;
use crate::domain_types::{CorrelationId, ServiceName};

/// Final disposition of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    /// Dispatch in flight.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

/// One inter-service call inside a trace.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceCall {
    /// Destination service.
    pub service: ServiceName,
    /// Operation label, `METHOD endpoint` form.
    pub operation: String,
    /// Call duration in milliseconds.
    pub duration_ms: u64,
    /// `success` or `error`.
    pub status: String,
    /// Error description when the call failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock time the call finished.
    pub timestamp: DateTime<Utc>,
}

/// The observability record for one correlated request.
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    /// Trace id (equals the correlation id).
    pub trace_id: CorrelationId,
    /// Requesting user.
    pub user_id: String,
    /// Wall-clock start.
    pub start_time: DateTime<Utc>,
    /// Wall-clock end, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Total duration in milliseconds, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    /// Ordered log of inter-service calls.
    pub service_calls: Vec<ServiceCall>,
    /// Current disposition.
    pub status: TraceStatus,
}

struct CompletedTrace {
    record: TraceRecord,
    finished_at: Instant,
}

/// Tracks active traces and retains completed ones for a bounded window.
pub struct RequestTracer {
    settings: TraceSettings,
    active: DashMap<CorrelationId, TraceRecord>,
    completed: Mutex<VecDeque<CompletedTrace>>,
}

impl RequestTracer {
    /// Builds an empty tracer.
    #[must_use]
    pub fn new(settings: TraceSettings) -> Self {
        let capacity = settings.ring_capacity.as_usize();
        Self {
            settings,
            active: DashMap::new(),
            completed: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Opens a trace for a freshly-minted correlation id.
    pub fn start(&self, trace_id: CorrelationId, user_id: &str) {
        let record = TraceRecord {
            trace_id: trace_id.clone(),
            user_id: user_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            total_duration_ms: None,
            service_calls: Vec::new(),
            status: TraceStatus::Active,
        };
        self.active.insert(trace_id, record);
    }

    /// Appends one inter-service call to an active trace.
    ///
    /// Unknown trace ids are ignored; the call may belong to a trace that
    /// already aged out.
    pub fn record_call(
        &self,
        trace_id: &CorrelationId,
        service: &ServiceName,
        operation: &str,
        duration: Duration,
        error: Option<&str>,
    ) {
        if let Some(mut record) = self.active.get_mut(trace_id) {
            record.service_calls.push(ServiceCall {
                service: service.clone(),
                operation: operation.to_string(),
                duration_ms: duration.as_millis() as u64,
                status: if error.is_none() { "success" } else { "error" }.to_string(),
                error: error.map(ToString::to_string),
                timestamp: Utc::now(),
            });
        }
    }

    /// Finalises a trace and moves it into the ring buffer.
    pub fn complete(&self, trace_id: &CorrelationId, failed: bool) {
        let Some((_, mut record)) = self.active.remove(trace_id) else {
            return;
        };
        let end = Utc::now();
        record.status = if failed {
            TraceStatus::Failed
        } else {
            TraceStatus::Completed
        };
        record.total_duration_ms = Some(
            (end - record.start_time)
                .num_milliseconds()
                .max(0) as u64,
        );
        record.end_time = Some(end);

        info!(
            trace_id = %record.trace_id,
            duration_ms = record.total_duration_ms,
            calls = record.service_calls.len(),
            failed,
            "trace completed"
        );

        let mut completed = self.completed.lock().expect("tracer lock poisoned");
        prune(&mut completed, self.settings.retention);
        if completed.len() >= self.settings.ring_capacity.as_usize() {
            completed.pop_front();
        }
        completed.push_back(CompletedTrace {
            record,
            finished_at: Instant::now(),
        });
    }

    /// Looks up one trace, active or recently completed.
    #[must_use]
    pub fn get(&self, trace_id: &CorrelationId) -> Option<TraceRecord> {
        if let Some(record) = self.active.get(trace_id) {
            return Some(record.clone());
        }
        let mut completed = self.completed.lock().expect("tracer lock poisoned");
        prune(&mut completed, self.settings.retention);
        completed
            .iter()
            .find(|t| &t.record.trace_id == trace_id)
            .map(|t| t.record.clone())
    }

    /// All retained traces, newest last.
    #[must_use]
    pub fn recent(&self) -> Vec<TraceRecord> {
        let mut completed = self.completed.lock().expect("tracer lock poisoned");
        prune(&mut completed, self.settings.retention);
        let mut records: Vec<TraceRecord> =
            self.active.iter().map(|e| e.value().clone()).collect();
        records.extend(completed.iter().map(|t| t.record.clone()));
        records
    }

    /// Number of traces still in flight.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

fn prune(completed: &mut VecDeque<CompletedTrace>, retention: Duration) {
    while completed
        .front()
        .is_some_and(|t| t.finished_at.elapsed() > retention)
    {
        completed.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::TraceRingCapacity;

    fn tracer(capacity: usize, retention: Duration) -> RequestTracer {
        RequestTracer::new(TraceSettings {
            retention,
            ring_capacity: TraceRingCapacity::try_new(capacity).unwrap(),
        })
    }

    fn gps() -> ServiceName {
        ServiceName::try_new("gps").unwrap()
    }

    #[test]
    fn trace_lifecycle_active_to_completed() {
        let tracer = tracer(10, Duration::from_secs(300));
        let id = CorrelationId::generate();
        tracer.start(id.clone(), "u-1");
        assert_eq!(tracer.active_count(), 1);

        tracer.record_call(&id, &gps(), "GET api/gps/locations", Duration::from_millis(12), None);
        tracer.complete(&id, false);

        assert_eq!(tracer.active_count(), 0);
        let record = tracer.get(&id).unwrap();
        assert_eq!(record.status, TraceStatus::Completed);
        assert_eq!(record.service_calls.len(), 1);
        assert!(record.total_duration_ms.is_some());
    }

    #[test]
    fn failed_completion_is_marked() {
        let tracer = tracer(10, Duration::from_secs(300));
        let id = CorrelationId::generate();
        tracer.start(id.clone(), "u-1");
        tracer.record_call(
            &id,
            &gps(),
            "GET api/gps/locations",
            Duration::from_millis(3),
            Some("Timeout"),
        );
        tracer.complete(&id, true);
        let record = tracer.get(&id).unwrap();
        assert_eq!(record.status, TraceStatus::Failed);
        assert_eq!(record.service_calls[0].status, "error");
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let tracer = tracer(3, Duration::from_secs(300));
        for n in 0..5 {
            let id = CorrelationId::try_new(format!("t-{n}")).unwrap();
            tracer.start(id.clone(), "u-1");
            tracer.complete(&id, false);
        }
        let completed = tracer.recent();
        assert_eq!(completed.len(), 3);
        // Oldest traces were evicted first.
        assert!(tracer.get(&CorrelationId::try_new("t-0").unwrap()).is_none());
        assert!(tracer.get(&CorrelationId::try_new("t-4").unwrap()).is_some());
    }

    #[test]
    fn retention_window_evicts_old_traces() {
        let tracer = tracer(10, Duration::from_millis(10));
        let id = CorrelationId::generate();
        tracer.start(id.clone(), "u-1");
        tracer.complete(&id, false);
        std::thread::sleep(Duration::from_millis(25));
        assert!(tracer.get(&id).is_none());
        assert!(tracer.recent().is_empty());
    }

    #[test]
    fn completing_an_unknown_trace_is_a_noop() {
        let tracer = tracer(10, Duration::from_secs(300));
        tracer.complete(&CorrelationId::generate(), false);
        assert!(tracer.recent().is_empty());
    }
}
