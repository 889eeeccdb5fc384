//! Outermost middleware: blocked sources pay one Redis lookup and
//! nothing else. Requests whose peer address is unknowable pass
//! through.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use common_http_errors::ApiError;
use redis::AsyncCommands;
use serde_json::json;
use tracing::warn;

use crate::app_state::AppState;
use crate::blocklist::{parse_block_value, BLOCK_IP_PREFIX};
use crate::context::client_ip;

pub async fn ip_blocklist_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(client_ip) = client_ip(&request) else {
        return next.run(request).await;
    };

    let key = format!("{BLOCK_IP_PREFIX}{client_ip}");
    let mut conn = match state.redis.conn().await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(error = %err, "Redis unavailable for blocklist check");
            return ApiError::internal("blocklist store unavailable").into_response();
        }
    };

    let raw: Option<String> = match conn.get(&key).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "Blocklist lookup failed");
            return ApiError::internal("blocklist store unavailable").into_response();
        }
    };
    let Some(raw) = raw else {
        return next.run(request).await;
    };

    state.metrics.blocklist_hits.inc();
    let meta = parse_block_value(&raw);
    let ttl: i64 = conn.ttl(&key).await.unwrap_or(-2);
    let retry_after = (ttl > 0).then_some(ttl);

    let body = json!({
        "detail": "IP temporarily blocked",
        "client_ip": client_ip,
        "block_id": meta.block_id,
        "reason_code": meta.reason_code,
        "reason": meta.reason,
        "retry_after_seconds": retry_after,
        "expires_at_epoch": meta.expires_at_epoch,
    });

    let mut response = (StatusCode::FORBIDDEN, axum::Json(body)).into_response();
    if let Some(seconds) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
    }
    response
}
