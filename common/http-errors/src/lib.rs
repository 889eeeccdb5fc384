use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub detail: String,
}

/// Error kinds visible at the gateway's API boundary. Every variant
/// renders as a JSON `{"detail": ...}` envelope with the matching
/// status code; `RateLimited` additionally carries the window state so
/// the 429 response can emit `X-RateLimit-*` headers.
#[derive(Debug)]
pub enum ApiError {
    BadRequest { detail: String },
    Unauthorized { detail: &'static str },
    NotFound { detail: &'static str },
    Conflict { detail: String },
    RateLimited { limit: i64, remaining: i64, reset_epoch: i64 },
    Internal { detail: String },
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::BadRequest { detail: detail.into() }
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::Conflict { detail: detail.into() }
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal { detail: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest { detail } => {
                (StatusCode::BAD_REQUEST, Json(ErrorBody { detail })).into_response()
            }
            ApiError::Unauthorized { detail } => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody { detail: detail.to_string() }),
            )
                .into_response(),
            ApiError::NotFound { detail } => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody { detail: detail.to_string() }),
            )
                .into_response(),
            ApiError::Conflict { detail } => {
                (StatusCode::CONFLICT, Json(ErrorBody { detail })).into_response()
            }
            ApiError::RateLimited { limit, remaining, reset_epoch } => {
                let mut resp = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorBody { detail: "Rate limit exceeded".to_string() }),
                )
                    .into_response();
                let headers = resp.headers_mut();
                headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
                headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
                headers.insert("X-RateLimit-Reset", HeaderValue::from(reset_epoch));
                resp
            }
            ApiError::Internal { detail } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody { detail }),
            )
                .into_response(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
