//! Request-scoped values threaded through the middleware chain via
//! request/response extensions.

use axum::extract::ConnectInfo;
use std::net::SocketAddr;
use uuid::Uuid;

/// Inbound `X-Request-Id` or a generated UUID, pinned by the request-id
/// middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Resolved credential attached to the request for handlers.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub api_key_id: Uuid,
    pub tenant_id: Uuid,
    pub rate_limit: i64,
    pub rate_window: i64,
}

/// Attribution carried on the response so the usage logger can label
/// rows even when the credential resolver rejected the request. Both
/// fields are `None` for unauthenticated traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageContext {
    pub tenant_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
}

pub fn client_ip<B>(request: &axum::http::Request<B>) -> Option<String> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}
