//! Usage capture on the exit path. The middleware records one row for
//! every non-exempt request with whatever attribution landed on the
//! response, so 401/403/429 rejections stay visible to the abuse
//! detector. The write is best-effort: failures are logged and counted,
//! never surfaced to the client.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use std::time::Instant;
use tracing::warn;

use crate::app_state::AppState;
use crate::context::{client_ip, RequestId, UsageContext};
use crate::usage::{record_usage_event, NewUsageEvent};

pub async fn usage_logging_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    let client_ip = client_ip(&request).unwrap_or_default();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|rid| rid.0.clone())
        .unwrap_or_default();

    let response = next.run(request).await;

    if state.config.usage_exempt(&path) {
        return response;
    }

    let latency_ms = i32::try_from(start.elapsed().as_millis()).unwrap_or(i32::MAX);
    let usage = response
        .extensions()
        .get::<UsageContext>()
        .copied()
        .unwrap_or_default();

    let event = NewUsageEvent {
        tenant_id: usage.tenant_id,
        api_key_id: usage.api_key_id,
        method,
        path,
        status_code: i32::from(response.status().as_u16()),
        latency_ms,
        ts: Utc::now(),
        request_id: request_id.clone(),
        client_ip,
        user_agent,
    };

    if let Err(err) = record_usage_event(&state.db, event).await {
        state.metrics.usage_event_failures.inc();
        warn!(error = %err, request_id = %request_id, "Failed to record usage event");
    }

    response
}
