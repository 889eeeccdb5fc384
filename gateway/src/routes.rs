use axum::extract::State;
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tracing::warn;

use crate::abuse_handlers::{
    abuse_suspects, auto_block_from_suspects, block_events, block_ip, block_top_suspects,
    blocked_details, blocks_report, ip_timeline, list_blocked_ips, unblock_ip,
};
use crate::admin_auth::require_admin;
use crate::app_state::AppState;
use crate::client_auth::require_client_key;
use crate::gateway_handlers::{health, protected, whoami};
use crate::ip_blocklist::ip_blocklist_middleware;
use crate::request_id::request_id_middleware;
use crate::tenant_handlers::{
    create_api_key, create_tenant, list_api_keys, revoke_api_key, set_key_limits, set_key_tier,
};
use crate::usage_handlers::{
    global_rate_limited_usage, keys_near_quota, list_usage_events, tenant_rate_limited_usage,
    top_endpoints, unauth_usage, usage_by_key, usage_status_classes, usage_summary,
};
use crate::usage_logging::usage_logging_middleware;

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "Failed to render metrics");
            Response::builder()
                .status(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
                .body(axum::body::Body::from("metrics unavailable"))
                .unwrap_or_default()
        }
    }
}

/// Full application router. Layer order is load-bearing: the blocklist
/// wraps everything so banned sources pay one Redis lookup, request-id
/// runs before usage capture so rows carry the id, and the credential
/// resolver is scoped to the protected routes so admin traffic is
/// unaffected.
pub fn build_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/protected", get(protected))
        .route("/whoami", get(whoami))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_client_key,
        ));

    let admin_routes = Router::new()
        .route("/tenants", post(create_tenant))
        .route("/tenants/:tenant_id/keys", post(create_api_key).get(list_api_keys))
        .route("/keys/:key_id/revoke", post(revoke_api_key))
        .route("/keys/:key_id/limits", post(set_key_limits))
        .route("/keys/:key_id/tier", post(set_key_tier))
        .route("/tenants/:tenant_id/usage/summary", get(usage_summary))
        .route("/tenants/:tenant_id/usage/top-endpoints", get(top_endpoints))
        .route("/tenants/:tenant_id/usage/by-key", get(usage_by_key))
        .route("/tenants/:tenant_id/usage/status-classes", get(usage_status_classes))
        .route("/tenants/:tenant_id/usage/events", get(list_usage_events))
        .route("/tenants/:tenant_id/usage/rate-limited", get(tenant_rate_limited_usage))
        .route("/tenants/:tenant_id/keys/near-quota", get(keys_near_quota))
        .route("/usage/unauth", get(unauth_usage))
        .route("/usage/rate-limited", get(global_rate_limited_usage))
        .route("/abuse/suspects", get(abuse_suspects))
        .route("/abuse/suspects/block", post(block_top_suspects))
        .route("/abuse/ip/:client_ip", get(ip_timeline))
        .route("/abuse/block-ip", post(block_ip))
        .route("/abuse/unblock-ip", post(unblock_ip))
        .route("/abuse/blocked", get(list_blocked_ips))
        .route("/abuse/blocked/:client_ip", get(blocked_details))
        .route("/abuse/blocks/report", get(blocks_report))
        .route("/abuse/blocks/events", get(block_events))
        .route("/abuse/auto-block", post(auto_block_from_suspects))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected_routes)
        .nest("/admin", admin_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            usage_logging_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ip_blocklist_middleware,
        ))
        .with_state(state)
}
