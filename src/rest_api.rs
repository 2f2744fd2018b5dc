//! HTTP surface
//!
//! The axum application: a thin authorised proxy over the service router for
//! every `/api/...` resource family, plus the operational endpoints (health,
//! circuit breakers, metrics, traces) and token introspection. Handlers map
//! [`GatewayError`] kinds to status codes here and nowhere else.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum::Router;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::debug;

use crate::auth::{AuthDecision, AuthValidator, RouteGuard};
use crate::domain_types::{CorrelationId, ServiceName};
use crate::envelope::{Method, UserContext};
use crate::error::GatewayError;
use crate::health::HealthMonitor;
use crate::resilience::BreakerRegistry;
use crate::router::{ServiceRouter, normalize_path};
use crate::tracer::RequestTracer;

/// Roles allowed to reset circuit breakers.
const ADMIN_ROLES: &[&str] = &["admin"];

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// Dispatch plane.
    pub router: Arc<ServiceRouter>,
    /// Token validation.
    pub auth: Arc<AuthValidator>,
    /// Health aggregation.
    pub health: Arc<HealthMonitor>,
    /// Trace retention.
    pub tracer: Arc<RequestTracer>,
    /// Per-service breakers.
    pub breakers: Arc<BreakerRegistry>,
}

/// Builds the axum application over the given state.
#[must_use]
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/health/detailed", get(detailed_health))
        .route("/health/circuit-breakers", get(list_breakers))
        .route(
            "/health/circuit-breakers/{service}/reset",
            post(reset_breaker),
        )
        .route("/metrics", get(metrics))
        .route("/traces", get(list_traces))
        .route("/traces/{id}", get(get_trace))
        .route("/auth/introspect", get(introspect))
        .route("/api/{*path}", any(proxy))
        .with_state(state)
}

fn error_response(err: &GatewayError) -> Response {
    (
        err.status_code(),
        Json(json!({
            "error": err.kind_name(),
            "message": err.to_string(),
        })),
    )
        .into_response()
}

/// The permission a proxied request must hold: `<resource>:read` for GET,
/// `<resource>:write` for anything mutating.
fn required_permission(method: Method, endpoint: &str) -> String {
    let resource = endpoint
        .split('/')
        .nth(1)
        .or_else(|| endpoint.split('/').next())
        .unwrap_or("api");
    let action = match method {
        Method::Get => "read",
        Method::Post | Method::Put | Method::Patch | Method::Delete => "write",
    };
    format!("{resource}:{action}")
}

fn convert_method(method: &axum::http::Method) -> Option<Method> {
    match method.as_str() {
        "GET" => Some(Method::Get),
        "POST" => Some(Method::Post),
        "PUT" => Some(Method::Put),
        "PATCH" => Some(Method::Patch),
        "DELETE" => Some(Method::Delete),
        _ => None,
    }
}

fn authorize(
    auth: &AuthValidator,
    headers: &HeaderMap,
    guard: &RouteGuard,
) -> Result<UserContext, Response> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match auth.authorize(header, guard) {
        AuthDecision::Allow(mut context) => {
            context.client_ip = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(|raw| raw.split(',').next().unwrap_or(raw).trim().to_string());
            Ok(*context)
        }
        AuthDecision::Unauthorised(reason) => {
            Err(error_response(&GatewayError::Unauthorised(reason)))
        }
        AuthDecision::Forbidden(reason) => Err(error_response(&GatewayError::Forbidden(reason))),
    }
}

async fn proxy(
    State(state): State<AppState>,
    method: axum::http::Method,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(method) = convert_method(&method) else {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({"error": "MethodNotAllowed", "message": "unsupported method"})),
        )
            .into_response();
    };
    let endpoint = normalize_path(&format!("api/{path}"));

    let guard = RouteGuard::Permission(required_permission(method, &endpoint));
    let user_context = match authorize(&state.auth, &headers, &guard) {
        Ok(context) => context,
        Err(response) => return response,
    };

    let data = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => {
                return error_response(&GatewayError::Validation(format!(
                    "request body is not valid JSON: {err}"
                )));
            }
        }
    };

    let timeout = headers
        .get("x-request-timeout-secs")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs);

    debug!(%method, endpoint, user = %user_context.user_id, "proxying request");
    match state
        .router
        .dispatch(method, &endpoint, data, user_context, timeout)
        .await
        .map_err(ServiceRouter::map_exhausted)
    {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn introspect(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "));
    let Some(token) = token else {
        return error_response(&GatewayError::Unauthorised(
            "missing bearer token".to_string(),
        ));
    };
    match state.auth.verify(token.trim()) {
        Ok(claims) => (StatusCode::OK, Json(json!({ "active": true, "claims": claims })))
            .into_response(),
        Err(reason) => error_response(&GatewayError::Unauthorised(reason)),
    }
}

async fn liveness(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.health.liveness())).into_response()
}

async fn readiness(State(state): State<AppState>) -> Response {
    let (ready, body) = state.health.readiness();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn detailed_health(State(state): State<AppState>) -> Response {
    let (overall, body) = state.health.detailed().await;
    let status = if overall.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.health.metrics())).into_response()
}

async fn list_breakers(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        Json(json!({"circuit_breakers": state.breakers.snapshots()})),
    )
        .into_response()
}

async fn reset_breaker(
    State(state): State<AppState>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize(&state.auth, &headers, &RouteGuard::Roles(ADMIN_ROLES)) {
        return response;
    }
    let Ok(service) = ServiceName::try_new(service) else {
        return error_response(&GatewayError::Validation("invalid service name".into()));
    };
    if state.breakers.reset(&service) {
        (
            StatusCode::OK,
            Json(json!({"message": format!("circuit breaker for '{service}' reset")})),
        )
            .into_response()
    } else {
        error_response(&GatewayError::NotFound(format!(
            "no circuit breaker for '{service}'"
        )))
    }
}

async fn list_traces(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        Json(json!({"traces": state.tracer.recent()})),
    )
        .into_response()
}

async fn get_trace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = CorrelationId::try_new(id) else {
        return error_response(&GatewayError::Validation("invalid trace id".into()));
    };
    match state.tracer.get(&id) {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => error_response(&GatewayError::NotFound(format!("no trace '{id}'"))),
    }
}
