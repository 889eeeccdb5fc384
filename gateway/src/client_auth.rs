//! Credential resolver for protected routes: bearer lookup by
//! fingerprint, revocation check, then the rate-limit gate. Tenant/key
//! attribution is attached to the response before the revocation and
//! quota checks so rejected requests still produce labeled usage rows.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use common_http_errors::ApiError;
use sqlx::FromRow;
use tracing::warn;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::context::{AuthContext, UsageContext};
use crate::keys::hash_key;
use crate::rate_limit::RateLimitDecision;

#[derive(FromRow)]
struct AuthKeyRow {
    id: Uuid,
    tenant_id: Uuid,
    rate_limit: Option<i32>,
    rate_window: Option<i32>,
    revoked_at: Option<DateTime<Utc>>,
}

pub async fn require_client_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim);
    let Some(plain) = bearer.filter(|plain| !plain.is_empty()) else {
        return ApiError::Unauthorized { detail: "Missing API key" }.into_response();
    };

    let hashed = hash_key(plain);
    let row = match sqlx::query_as::<_, AuthKeyRow>(
        "SELECT id, tenant_id, rate_limit, rate_window, revoked_at
         FROM api_keys WHERE key_hash = $1",
    )
    .bind(&hashed)
    .fetch_optional(&state.db)
    .await
    {
        Ok(row) => row,
        Err(err) => {
            warn!(error = %err, "API key lookup failed");
            return ApiError::internal("credential store unavailable").into_response();
        }
    };

    let Some(key) = row else {
        return ApiError::Unauthorized { detail: "Invalid API key" }.into_response();
    };

    let usage = UsageContext {
        tenant_id: Some(key.tenant_id),
        api_key_id: Some(key.id),
    };

    if key.revoked_at.is_some() {
        let response = ApiError::Unauthorized { detail: "Invalid API key" }.into_response();
        return with_usage_context(response, usage);
    }

    let (limit, window) = state.effective_limits(key.rate_limit, key.rate_window);
    let decision = match state
        .rate_limiter
        .check(&key.id.to_string(), limit, window)
        .await
    {
        Ok(decision) => decision,
        Err(err) => {
            warn!(error = %err, api_key_id = %key.id, "Rate limiter failure");
            let response = ApiError::internal("rate limiter unavailable").into_response();
            return with_usage_context(response, usage);
        }
    };

    state.metrics.record_rate_check(decision.allowed);

    if !decision.allowed {
        let response = ApiError::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_epoch: decision.reset_epoch,
        }
        .into_response();
        return with_usage_context(response, usage);
    }

    request.extensions_mut().insert(AuthContext {
        api_key_id: key.id,
        tenant_id: key.tenant_id,
        rate_limit: limit,
        rate_window: window,
    });
    request.extensions_mut().insert(usage);

    let mut response = next.run(request).await;
    apply_rate_limit_headers(&mut response, &decision);
    with_usage_context(response, usage)
}

fn with_usage_context(mut response: Response, usage: UsageContext) -> Response {
    response.extensions_mut().insert(usage);
    response
}

fn apply_rate_limit_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
    headers.insert("X-RateLimit-Reset", HeaderValue::from(decision.reset_epoch));
}
