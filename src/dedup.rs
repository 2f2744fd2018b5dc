//! Consumer-side duplicate suppression
//!
//! A bounded FIFO window of recently-seen correlation ids. At-least-once
//! delivery means a consumer can see the same envelope twice; the window
//! absorbs those replays for as long as the process lives. Trimming drops
//! the oldest entries in insertion order, so eviction is deterministic.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

use crate::config::DedupSettings;
use crate::domain_types::CorrelationId;

/// Size statistics for the health surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DedupStats {
    /// Ids currently tracked.
    pub tracked: usize,
    /// Window capacity.
    pub capacity: usize,
    /// Duplicates suppressed since startup.
    pub duplicates_dropped: u64,
}

#[derive(Debug)]
struct WindowInner {
    order: VecDeque<CorrelationId>,
    seen: HashSet<CorrelationId>,
    duplicates_dropped: u64,
}

/// Bounded FIFO set of recently-processed correlation ids.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    trim_to: usize,
    inner: Mutex<WindowInner>,
}

impl DedupWindow {
    /// Builds an empty window from dedup settings.
    #[must_use]
    pub fn new(settings: &DedupSettings) -> Self {
        let capacity = settings.capacity.as_usize();
        Self {
            capacity,
            trim_to: settings.trim_to.min(capacity.saturating_sub(1)),
            inner: Mutex::new(WindowInner {
                order: VecDeque::with_capacity(capacity),
                seen: HashSet::with_capacity(capacity),
                duplicates_dropped: 0,
            }),
        }
    }

    /// Records an id; returns false when it was already in the window.
    ///
    /// A full window trims down to `trim_to` entries, oldest first, before
    /// accepting the new id.
    pub fn insert(&self, id: &CorrelationId) -> bool {
        let mut inner = self.inner.lock().expect("dedup lock poisoned");
        if inner.seen.contains(id) {
            inner.duplicates_dropped += 1;
            return false;
        }

        if inner.order.len() >= self.capacity {
            while inner.order.len() > self.trim_to {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.seen.remove(&evicted);
                }
            }
        }

        inner.order.push_back(id.clone());
        inner.seen.insert(id.clone());
        true
    }

    /// Whether the id is currently tracked.
    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.inner
            .lock()
            .expect("dedup lock poisoned")
            .seen
            .contains(id)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> DedupStats {
        let inner = self.inner.lock().expect("dedup lock poisoned");
        DedupStats {
            tracked: inner.order.len(),
            capacity: self.capacity,
            duplicates_dropped: inner.duplicates_dropped,
        }
    }
}
