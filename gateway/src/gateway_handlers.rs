use axum::extract::{ConnectInfo, State};
use axum::{Extension, Json};
use common_http_errors::{ApiError, ApiResult};
use serde_json::{json, Value};
use std::net::SocketAddr;

use crate::app_state::AppState;
use crate::context::{AuthContext, RequestId};

/// Minimal protected endpoint: reaching the handler proves the whole
/// enforcement pipeline passed.
pub async fn protected(Extension(auth): Extension<AuthContext>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "tenant_id": auth.tenant_id,
        "api_key_id": auth.api_key_id,
    }))
}

pub async fn whoami(
    Extension(auth): Extension<AuthContext>,
    request_id: Option<Extension<RequestId>>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Json<Value> {
    Json(json!({
        "tenant_id": auth.tenant_id,
        "api_key_id": auth.api_key_id,
        "rate_limit": auth.rate_limit,
        "rate_window": auth.rate_window,
        "client_ip": peer.map(|info| info.0.ip().to_string()),
        "request_id": request_id.map(|Extension(rid)| rid.0),
    }))
}

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::internal)?;

    let mut conn = state.redis.conn().await.map_err(ApiError::internal)?;
    let pong: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "status": "ok",
        "postgres": "ok",
        "redis": if pong == "PONG" { "ok" } else { "unknown" },
    })))
}
