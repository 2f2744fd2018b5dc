//! Domain types for the gateway
//!
//! Strongly-typed identifiers and bounded numeric configuration values used
//! across the routing and correlation plane, to keep raw strings and integers
//! out of internal code.

use nutype::nutype;
use uuid::Uuid;

/// Correlation identifier attached to every request envelope.
///
/// Minted once per HTTP ingress and echoed verbatim by service replies. The
/// wire form is an opaque non-empty string; ids minted locally are UUID v4.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(
        Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom, Into
    )
)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mints a fresh globally-unique correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self::try_new(Uuid::new_v4().to_string()).expect("uuid is never empty")
    }

    /// Borrows the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Name of a destination service block (`management`, `gps`, ...).
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty),
    derive(
        Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom, Into
    )
)]
pub struct ServiceName(String);

impl ServiceName {
    /// Borrows the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    /// Routing key / queue name for this service's request queue.
    #[must_use]
    pub fn request_queue(&self) -> String {
        format!("{}.requests", self.as_str())
    }
}

/// Per-channel consumer prefetch.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 10
)]
pub struct PrefetchCount(u16);

impl PrefetchCount {
    /// Gets the value as u16 for `basic_qos`.
    #[must_use]
    pub fn as_u16(&self) -> u16 {
        self.into_inner()
    }
}

/// Consecutive failures before a circuit breaker opens.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 5
)]
pub struct FailureThreshold(u32);

/// Concurrent probes admitted while a breaker is half-open.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 3
)]
pub struct HalfOpenMaxCalls(u32);

/// Maximum attempts made by the dispatch retry wrapper.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 3
)]
pub struct MaxRetryAttempts(u32);

/// Capacity of a consumer's duplicate-suppression window.
#[nutype(
    validate(greater_or_equal = 2, less_or_equal = 1_000_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 1000
)]
pub struct DedupCapacity(usize);

impl DedupCapacity {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Capacity of the completed-trace ring buffer.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 500
)]
pub struct TraceRingCapacity(usize);

impl TraceRingCapacity {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Soft cap on concurrently pending correlation entries.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 2048
)]
pub struct PendingSoftCap(usize);

impl PendingSoftCap {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_generation_is_unique() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn correlation_id_rejects_empty_and_whitespace() {
        assert!(CorrelationId::try_new("").is_err());
        assert!(CorrelationId::try_new("   ").is_err());
    }

    #[test]
    fn service_name_is_normalised() {
        let name = ServiceName::try_new("  Management ").unwrap();
        assert_eq!(name.as_str(), "management");
        assert_eq!(name.request_queue(), "management.requests");
    }

    #[test]
    fn bounded_values_enforce_ranges() {
        assert!(PrefetchCount::try_new(0).is_err());
        assert!(FailureThreshold::try_new(101).is_err());
        assert_eq!(FailureThreshold::default().into_inner(), 5);
        assert_eq!(HalfOpenMaxCalls::default().into_inner(), 3);
        assert_eq!(DedupCapacity::default().as_usize(), 1000);
    }
}
