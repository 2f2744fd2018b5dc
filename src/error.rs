//! Error types for the gateway
//!
//! One gateway-level error enum covers every failure the routing plane can
//! surface. The wire encoding of a service-side failure is `{type, message}`;
//! [`GatewayError::from_wire`] maps known type names back onto variants so
//! retry and circuit-breaker policy can key off the kind rather than strings.

use axum::http::StatusCode;
use thiserror::Error;

use crate::domain_types::ServiceName;

/// Every error kind the gateway can report to a caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or invalid bearer token.
    #[error("unauthorised: {0}")]
    Unauthorised(String),

    /// Valid token, insufficient role or permission.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Envelope or request body failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// The router found no service mapping for the path.
    #[error("no service mapped for endpoint: {0}")]
    UnknownEndpoint(String),

    /// The destination service reported absence.
    #[error("not found: {0}")]
    NotFound(String),

    /// The destination service reported a duplicate or state conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The deadline elapsed before a reply arrived.
    #[error("request to {service} timed out after {elapsed_ms}ms")]
    Timeout {
        /// Destination service the dispatch was addressed to.
        service: ServiceName,
        /// Milliseconds the caller waited.
        elapsed_ms: u64,
    },

    /// Circuit open for the destination, or retries exhausted against a
    /// broker outage.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The broker rejected a publish or consume at the transport level.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The correlation registry is over its soft cap.
    #[error("too many in-flight requests, dispatch rejected")]
    BackpressureRejected,

    /// A service-reported failure with a type the gateway does not model.
    /// Surfaced verbatim to the caller.
    #[error("{kind}: {message}")]
    Service {
        /// Error type name reported by the service block.
        kind: String,
        /// Human-readable message reported by the service block.
        message: String,
    },

    /// Unclassified internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Reconstructs an error from its wire form (`{type, message}`).
    ///
    /// Known type names map onto their variants; anything else is carried
    /// verbatim as [`GatewayError::Service`].
    #[must_use]
    pub fn from_wire(kind: &str, message: &str) -> Self {
        let message = message.to_string();
        match kind {
            "Unauthorised" | "Unauthorized" => Self::Unauthorised(message),
            "Forbidden" => Self::Forbidden(message),
            "ValidationError" | "BadRequest" => Self::Validation(message),
            "UnknownEndpoint" => Self::UnknownEndpoint(message),
            "NotFound" => Self::NotFound(message),
            "Conflict" => Self::Conflict(message),
            "ServiceUnavailable" => Self::ServiceUnavailable(message),
            "BrokerUnavailable" => Self::BrokerUnavailable(message),
            "Internal" | "InternalError" => Self::Internal(message),
            other => Self::Service {
                kind: other.to_string(),
                message,
            },
        }
    }

    /// The stable kind name used as the wire `type` field.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        match self {
            Self::Unauthorised(_) => "Unauthorised",
            Self::Forbidden(_) => "Forbidden",
            Self::Validation(_) => "ValidationError",
            Self::UnknownEndpoint(_) => "UnknownEndpoint",
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::Timeout { .. } => "Timeout",
            Self::ServiceUnavailable(_) => "ServiceUnavailable",
            Self::BrokerUnavailable(_) => "BrokerUnavailable",
            Self::BackpressureRejected => "BackpressureRejected",
            Self::Service { kind, .. } => kind,
            Self::Internal(_) => "Internal",
        }
    }

    /// HTTP status the edge maps this kind to.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorised(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UnknownEndpoint(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ServiceUnavailable(_)
            | Self::BrokerUnavailable(_)
            | Self::BackpressureRejected => StatusCode::SERVICE_UNAVAILABLE,
            Self::Service { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the dispatch retry wrapper may re-attempt after this error.
    ///
    /// Only transient transport failures qualify; 4xx-class outcomes and
    /// service-reported errors are final.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_) | Self::Timeout { .. })
    }

    /// Whether this error counts against the destination's circuit breaker.
    ///
    /// Local broker-transport failures do not: they drive the broker
    /// client's own connect breaker instead.
    #[must_use]
    pub fn counts_as_breaker_failure(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Internal(_) | Self::Service { .. } => true,
            Self::Validation(_) => false,
            Self::Unauthorised(_)
            | Self::Forbidden(_)
            | Self::UnknownEndpoint(_)
            | Self::NotFound(_)
            | Self::Conflict(_)
            | Self::ServiceUnavailable(_)
            | Self::BrokerUnavailable(_)
            | Self::BackpressureRejected => false,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialisation failed: {err}"))
    }
}
