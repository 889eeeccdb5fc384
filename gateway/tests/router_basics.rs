//! Router tests that run without live stores: the missing-credential
//! path, request-id propagation, admin token rejection, and parameter
//! validation that fires before any store access.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

use gatekeeper::{build_router, AppState, GatewayConfig, GatewayMetrics, RedisHandle};

const ADMIN_TOKEN: &str = "test-admin-token";

fn test_config() -> GatewayConfig {
    GatewayConfig {
        app_host: "127.0.0.1".into(),
        app_port: 8080,
        log_level: "info".into(),
        postgres_host: "127.0.0.1".into(),
        postgres_port: 1,
        postgres_db: "gatekeeper".into(),
        postgres_user: "gatekeeper".into(),
        postgres_password: "gatekeeper".into(),
        redis_host: "127.0.0.1".into(),
        redis_port: 1,
        redis_db: 0,
        admin_token: ADMIN_TOKEN.into(),
        rate_limit_requests: 10,
        rate_limit_window_seconds: 60,
        enable_auto_block: false,
        allow_block_localhost: false,
        usage_exempt_paths: vec![
            "/health".into(),
            "/metrics".into(),
            "/admin".into(),
            "/docs".into(),
            "/openapi.json".into(),
        ],
    }
}

/// State whose stores point at closed ports; tests below only exercise
/// paths that reject before touching them.
fn offline_state() -> AppState {
    let config = test_config();
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_millis(250))
        .connect_lazy(&config.postgres_dsn())
        .expect("lazy pool");
    let redis = RedisHandle::new(&config.redis_url()).expect("redis handle");
    let metrics = Arc::new(GatewayMetrics::new().expect("metrics"));
    AppState::new(pool, redis, Arc::new(config), metrics)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn missing_api_key_is_401_with_detail() {
    let app = build_router(offline_state());
    let response = app
        .oneshot(Request::builder().uri("/protected").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "Missing API key");
}

#[tokio::test]
async fn empty_bearer_is_still_missing() {
    let app = build_router(offline_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/protected")
                .header("Authorization", "Bearer   ")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "Missing API key");
}

#[tokio::test]
async fn credential_store_outage_fails_closed() {
    let app = build_router(offline_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/protected")
                .header("Authorization", "Bearer not-a-real-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn inbound_request_id_is_echoed() {
    let app = build_router(offline_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/protected")
                .header("X-Request-Id", "req-abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-abc-123");
}

#[tokio::test]
async fn request_id_is_generated_when_absent() {
    let app = build_router(offline_state());
    let response = app
        .oneshot(Request::builder().uri("/protected").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let value = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .expect("generated request id");
    assert!(!value.is_empty());
}

#[tokio::test]
async fn admin_routes_reject_missing_or_wrong_token() {
    let app = build_router(offline_state());

    let missing = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/tenants")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "name": "acme" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(missing).await["detail"], "Unauthorized");

    let wrong = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/tenants")
                .header("content-type", "application/json")
                .header("X-Admin-Token", "nope")
                .body(Body::from(json!({ "name": "acme" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn out_of_range_limits_are_rejected_before_store_access() {
    let app = build_router(offline_state());
    let key_id = uuid::Uuid::new_v4();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/admin/keys/{key_id}/limits"))
                .header("content-type", "application/json")
                .header("X-Admin-Token", ADMIN_TOKEN)
                .body(Body::from(
                    json!({ "rate_limit": 0, "rate_window": 60 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "rate_limit must be between 1 and 1000000");
}

#[tokio::test]
async fn block_ttl_outside_bounds_is_rejected() {
    let app = build_router(offline_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/abuse/block-ip")
                .header("content-type", "application/json")
                .header("X-Admin-Token", ADMIN_TOKEN)
                .body(Body::from(
                    json!({ "client_ip": "1.2.3.4", "ttl_seconds": 5 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn auto_block_is_conflict_while_disabled() {
    let app = build_router(offline_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/abuse/auto-block")
                .header("content-type", "application/json")
                .header("X-Admin-Token", ADMIN_TOKEN)
                .body(Body::from(json!({}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(
        body["detail"],
        "Auto-block is disabled. Set ENABLE_AUTO_BLOCK=true to enable."
    );
}

#[tokio::test]
async fn near_quota_threshold_is_validated() {
    let app = build_router(offline_state());
    let tenant_id = uuid::Uuid::new_v4();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/admin/tenants/{tenant_id}/keys/near-quota?threshold=1.5"))
                .header("X-Admin-Token", ADMIN_TOKEN)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "threshold must be (0, 1]");
}

#[tokio::test]
async fn unknown_tier_is_a_bad_request() {
    let app = build_router(offline_state());
    let key_id = uuid::Uuid::new_v4();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/admin/keys/{key_id}/tier"))
                .header("content-type", "application/json")
                .header("X-Admin-Token", ADMIN_TOKEN)
                .body(Body::from(json!({ "tier": "platinum" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "Unknown tier: platinum");
}
