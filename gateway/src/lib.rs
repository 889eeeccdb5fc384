pub mod abuse_handlers;
pub mod admin_auth;
pub mod app_state;
pub mod blocklist;
pub mod client_auth;
pub mod config;
pub mod context;
pub mod gateway_handlers;
pub mod ip_blocklist;
pub mod keys;
pub mod metrics;
pub mod rate_limit;
pub mod redis_client;
pub mod request_id;
pub mod routes;
pub mod tenant_handlers;
pub mod timerange;
pub mod usage;
pub mod usage_handlers;
pub mod usage_logging;

// Re-export the types tests and the binary wire together.
pub use crate::app_state::AppState;
pub use crate::config::GatewayConfig;
pub use crate::metrics::GatewayMetrics;
pub use crate::rate_limit::{InMemoryRateLimiter, RateLimiterEngine};
pub use crate::redis_client::RedisHandle;
pub use crate::routes::build_router;
