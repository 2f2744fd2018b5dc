//! Request and response envelopes
//!
//! The JSON records that cross the broker. Envelopes are parsed exactly once,
//! at the I/O boundary; everything behind it works with validated values.
//! Unknown fields on receipt are ignored; timestamps are ISO-8601 on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::CorrelationId;
use crate::error::GatewayError;

/// HTTP method carried inside a request envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Read.
    Get,
    /// Create.
    Post,
    /// Replace.
    Put,
    /// Partial update.
    Patch,
    /// Remove.
    Delete,
}

impl Method {
    /// The canonical wire spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and rights of the caller, embedded in every envelope so service
/// blocks never re-validate tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    /// Subject id from the validated token.
    pub user_id: String,
    /// Role name (`admin`, `driver`, ... or the `system` sentinel).
    pub role: String,
    /// Granted permissions, `service:action` form with `*` wildcards.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Trace id for cross-service correlation (equals the correlation id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Originating client address, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

impl UserContext {
    /// The sentinel context used for internal calls.
    #[must_use]
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            role: "system".to_string(),
            permissions: vec!["*".to_string()],
            trace_id: None,
            client_ip: None,
        }
    }
}

/// A request as published by the core onto `service_requests`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Globally unique id matching the reply to this dispatch.
    pub correlation_id: CorrelationId,
    /// HTTP method of the original request.
    pub method: Method,
    /// Normalised path, leading/trailing slashes trimmed.
    pub endpoint: String,
    /// Opaque request payload.
    #[serde(default)]
    pub data: Value,
    /// Caller identity; always present.
    pub user_context: UserContext,
    /// Wall-clock time of dispatch.
    pub timestamp: DateTime<Utc>,
}

impl RequestEnvelope {
    /// Builds an envelope stamped with the current time.
    #[must_use]
    pub fn new(
        correlation_id: CorrelationId,
        method: Method,
        endpoint: impl Into<String>,
        data: Value,
        user_context: UserContext,
    ) -> Self {
        Self {
            correlation_id,
            method,
            endpoint: endpoint.into(),
            data,
            user_context,
            timestamp: Utc::now(),
        }
    }

    /// Checks the structural invariants a consumer relies on.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] naming the first missing field.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.endpoint.trim().is_empty() {
            return Err(GatewayError::Validation("endpoint must not be empty".into()));
        }
        if self.user_context.user_id.trim().is_empty() {
            return Err(GatewayError::Validation(
                "user_context.user_id must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Wire form of a service-side failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error type name, e.g. `NotFound` or a service-specific kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

/// Outcome discriminator on a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// `data` is populated.
    Success,
    /// `error` is populated.
    Error,
}

/// A reply as published by a service block onto `service_responses`.
///
/// Exactly one of `data` / `error` is populated; the constructors enforce it
/// and [`ResponseEnvelope::into_result`] classifies anything a foreign
/// producer got wrong.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Echoes the request's correlation id verbatim.
    pub correlation_id: CorrelationId,
    /// Outcome discriminator.
    pub status: ResponseStatus,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure detail on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Wall-clock time of the reply.
    pub timestamp: DateTime<Utc>,
}

impl ResponseEnvelope {
    /// Builds a success reply.
    #[must_use]
    pub fn success(correlation_id: CorrelationId, data: Value) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Builds an error reply.
    #[must_use]
    pub fn failure(
        correlation_id: CorrelationId,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::Error,
            data: None,
            error: Some(ErrorBody {
                kind: kind.into(),
                message: message.into(),
            }),
            timestamp: Utc::now(),
        }
    }

    /// Collapses the envelope into the caller-facing result.
    pub fn into_result(self) -> Result<Value, GatewayError> {
        match self.status {
            ResponseStatus::Success => Ok(self.data.unwrap_or(Value::Null)),
            ResponseStatus::Error => {
                let body = self.error.unwrap_or(ErrorBody {
                    kind: "Internal".to_string(),
                    message: "service reported an error without detail".to_string(),
                });
                Err(GatewayError::from_wire(&body.kind, &body.message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(data: Value) -> RequestEnvelope {
        RequestEnvelope::new(
            CorrelationId::generate(),
            Method::Post,
            "api/vehicles",
            data,
            UserContext::system(),
        )
    }

    #[test]
    fn request_round_trip_preserves_payload() {
        let original = envelope(json!({"registration": "CA 123-456", "odometer": 18234}));
        let bytes = serde_json::to_vec(&original).unwrap();
        let decoded: RequestEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.correlation_id, original.correlation_id);
        assert_eq!(decoded.method, Method::Post);
        assert_eq!(decoded.endpoint, "api/vehicles");
        assert_eq!(decoded.data, original.data);
    }

    #[test]
    fn unknown_fields_are_ignored_on_receipt() {
        let raw = json!({
            "correlation_id": "abc-1",
            "method": "GET",
            "endpoint": "api/gps/locations",
            "data": {},
            "user_context": {"user_id": "u1", "role": "admin"},
            "timestamp": "2025-06-01T12:00:00Z",
            "x_shard": 7
        });
        let decoded: RequestEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(decoded.user_context.permissions, Vec::<String>::new());
    }

    #[test]
    fn method_uses_uppercase_wire_form() {
        assert_eq!(serde_json::to_value(Method::Delete).unwrap(), json!("DELETE"));
        let m: Method = serde_json::from_value(json!("PATCH")).unwrap();
        assert_eq!(m, Method::Patch);
    }

    #[test]
    fn validation_flags_empty_endpoint() {
        let mut env = envelope(Value::Null);
        env.endpoint = "  ".to_string();
        assert!(env.validate().is_err());
    }

    #[test]
    fn success_and_failure_populate_exactly_one_side() {
        let id = CorrelationId::generate();
        let ok = ResponseEnvelope::success(id.clone(), json!({"vehicles": []}));
        assert!(ok.data.is_some() && ok.error.is_none());

        let err = ResponseEnvelope::failure(id, "NotFound", "no such vehicle");
        assert!(err.data.is_none() && err.error.is_some());
        match err.into_result() {
            Err(GatewayError::NotFound(msg)) => assert_eq!(msg, "no such vehicle"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn error_reply_without_detail_degrades_to_internal() {
        let raw = json!({
            "correlation_id": "abc-2",
            "status": "error",
            "timestamp": "2025-06-01T12:00:00Z"
        });
        let decoded: ResponseEnvelope = serde_json::from_value(raw).unwrap();
        assert!(matches!(decoded.into_result(), Err(GatewayError::Internal(_))));
    }
}
