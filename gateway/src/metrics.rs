use anyhow::Result;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    rate_limit_checks: IntCounterVec,
    pub blocklist_hits: IntCounter,
    pub usage_event_failures: IntCounter,
    pub admin_auth_failures: IntCounter,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let rate_limit_checks = IntCounterVec::new(
            Opts::new(
                "gateway_rate_limit_checks_total",
                "Rate limit checks grouped by result",
            ),
            &["result"],
        )?;
        let blocklist_hits = IntCounter::new(
            "gateway_blocklist_hits_total",
            "Requests rejected by the IP blocklist",
        )?;
        let usage_event_failures = IntCounter::new(
            "gateway_usage_event_failures_total",
            "Usage event writes that failed on the best-effort path",
        )?;
        let admin_auth_failures = IntCounter::new(
            "gateway_admin_auth_failures_total",
            "Admin requests rejected for a missing or wrong token",
        )?;
        registry.register(Box::new(rate_limit_checks.clone()))?;
        registry.register(Box::new(blocklist_hits.clone()))?;
        registry.register(Box::new(usage_event_failures.clone()))?;
        registry.register(Box::new(admin_auth_failures.clone()))?;
        Ok(Self {
            registry,
            rate_limit_checks,
            blocklist_hits,
            usage_event_failures,
            admin_auth_failures,
        })
    }

    pub fn record_rate_check(&self, allowed: bool) {
        let result = if allowed { "allowed" } else { "rejected" };
        self.rate_limit_checks.with_label_values(&[result]).inc();
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, encoder.format_type())
            .body(Body::from(buffer))?)
    }
}
