use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use common_http_errors::ApiError;

use crate::app_state::AppState;
use crate::keys::constant_time_equals;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Shared-secret guard for the `/admin` namespace.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());

    match provided {
        Some(token) if constant_time_equals(token, &state.config.admin_token) => {
            next.run(request).await
        }
        _ => {
            state.metrics.admin_auth_failures.inc();
            ApiError::Unauthorized { detail: "Unauthorized" }.into_response()
        }
    }
}
