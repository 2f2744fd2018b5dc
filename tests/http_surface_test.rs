//! HTTP surface tests
//!
//! Drive the axum application directly with `tower::ServiceExt::oneshot`.
//! No broker runs here: auth rejections, router misses and operational
//! endpoints all fire before (or without) a publish, and the dispatch path
//! degrades to 503 exactly as a broker outage would.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use fleetgate::config::GatewayConfig;
use fleetgate::gateway::Gateway;
use fleetgate::rest_api::create_app;
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;

const SECRET: &str = "http-surface-test-secret";

fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.secret = SECRET.to_string();
    config.retry.base_delay = Duration::from_millis(2);
    config.retry.jitter = false;
    config
}

fn token(sub: &str, role: &str, permissions: &[&str]) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = json!({
        "sub": sub,
        "role": role,
        "permissions": permissions,
        "iat": now,
        "exp": now + 600,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn app() -> axum::Router {
    create_app(Gateway::new(test_config()).app_state())
}

#[tokio::test]
async fn liveness_answers_alive() {
    let response = app()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], json!("alive"));
}

#[tokio::test]
async fn readiness_is_503_without_a_broker() {
    let response = app()
        .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["checks"]["broker"]["status"], json!("not_ready"));
}

#[tokio::test]
async fn detailed_health_reports_unhealthy_without_a_broker() {
    let response = app()
        .oneshot(
            Request::get("/health/detailed")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], json!("unhealthy"));
}

#[tokio::test]
async fn proxy_without_token_is_401_and_never_dispatched() {
    let gateway = Gateway::new(test_config());
    let state = gateway.app_state();
    let response = create_app(state.clone())
        .oneshot(
            Request::post("/api/vehicles")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"registration":"CA 1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], json!("Unauthorised"));
    assert!(state.tracer.recent().is_empty(), "no dispatch may happen");
}

#[tokio::test]
async fn proxy_with_insufficient_permissions_is_403() {
    let gateway = Gateway::new(test_config());
    let state = gateway.app_state();
    let driver = token("driver-7", "driver", &["vehicles:read"]);
    let response = create_app(state.clone())
        .oneshot(
            Request::post("/api/vehicles")
                .header(header::AUTHORIZATION, format!("Bearer {driver}"))
                .body(Body::from(r#"{"registration":"CA 1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], json!("Forbidden"));
    assert!(state.tracer.recent().is_empty(), "no dispatch may happen");
}

#[tokio::test]
async fn proxy_to_unmapped_endpoint_is_404() {
    let admin = token("admin-1", "admin", &["*"]);
    let response = app()
        .oneshot(
            Request::get("/api/does-not-exist/42")
                .header(header::AUTHORIZATION, format!("Bearer {admin}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], json!("UnknownEndpoint"));
}

#[tokio::test]
async fn proxy_with_broker_down_degrades_to_503() {
    let admin = token("admin-1", "admin", &["*"]);
    let response = app()
        .oneshot(
            Request::get("/api/vehicles")
                .header(header::AUTHORIZATION, format!("Bearer {admin}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"], json!("ServiceUnavailable"));
}

#[tokio::test]
async fn proxy_rejects_non_json_bodies() {
    let admin = token("admin-1", "admin", &["*"]);
    let response = app()
        .oneshot(
            Request::post("/api/vehicles")
                .header(header::AUTHORIZATION, format!("Bearer {admin}"))
                .body(Body::from("registration=CA1"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], json!("ValidationError"));
}

#[tokio::test]
async fn introspection_returns_the_claims() {
    let admin = token("admin-1", "admin", &["*"]);
    let response = app()
        .oneshot(
            Request::get("/auth/introspect")
                .header(header::AUTHORIZATION, format!("Bearer {admin}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["active"], json!(true));
    assert_eq!(body["claims"]["sub"], json!("admin-1"));
    assert_eq!(body["claims"]["role"], json!("admin"));
}

#[tokio::test]
async fn introspection_rejects_garbage_tokens() {
    let response = app()
        .oneshot(
            Request::get("/auth/introspect")
                .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn breaker_listing_is_open_but_reset_needs_admin() {
    let gateway = Gateway::new(test_config());
    let state = gateway.app_state();

    let listing = create_app(state.clone())
        .oneshot(
            Request::get("/health/circuit-breakers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(listing.status(), StatusCode::OK);

    let driver = token("driver-7", "driver", &[]);
    let forbidden = create_app(state.clone())
        .oneshot(
            Request::post("/health/circuit-breakers/gps/reset")
                .header(header::AUTHORIZATION, format!("Bearer {driver}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    // Trip the gps breaker, then reset it as admin.
    let gps = fleetgate::domain_types::ServiceName::try_new("gps").unwrap();
    let breaker = state.breakers.breaker(&gps);
    for _ in 0..5 {
        breaker.record_failure();
    }
    let admin = token("admin-1", "admin", &["*"]);
    let reset = create_app(state.clone())
        .oneshot(
            Request::post("/health/circuit-breakers/gps/reset")
                .header(header::AUTHORIZATION, format!("Bearer {admin}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(reset.status(), StatusCode::OK);
    assert_eq!(
        breaker.state(),
        fleetgate::resilience::CircuitState::Closed
    );

    let missing = create_app(state)
        .oneshot(
            Request::post("/health/circuit-breakers/nowhere/reset")
                .header(header::AUTHORIZATION, format!("Bearer {admin}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn traces_endpoints_expose_retained_records() {
    let gateway = Gateway::new(test_config());
    let state = gateway.app_state();

    let id = fleetgate::domain_types::CorrelationId::generate();
    state.tracer.start(id.clone(), "admin-1");
    state.tracer.complete(&id, false);

    let listing = create_app(state.clone())
        .oneshot(Request::get("/traces").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(listing.status(), StatusCode::OK);
    let body = body_json(listing).await;
    assert_eq!(body["traces"].as_array().unwrap().len(), 1);

    let single = create_app(state.clone())
        .oneshot(
            Request::get(format!("/traces/{}", id.as_str()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(single.status(), StatusCode::OK);

    let missing = create_app(state)
        .oneshot(
            Request::get("/traces/never-dispatched")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_endpoint_reports_counters() {
    let response = app()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["broker_connected"], json!(false));
    assert_eq!(body["pending_requests"], json!(0));
}
