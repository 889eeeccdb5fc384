//! Append-only usage event store. Every processed request produces one
//! immutable row; unauthenticated traffic carries null tenant/key ids.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewUsageEvent {
    pub tenant_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub method: String,
    pub path: String,
    pub status_code: i32,
    pub latency_ms: i32,
    pub ts: DateTime<Utc>,
    pub request_id: String,
    pub client_ip: String,
    pub user_agent: String,
}

/// The insert checks out its own pool connection, so it never shares a
/// transaction with the handler's store work.
pub async fn record_usage_event(pool: &PgPool, event: NewUsageEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO usage_events
            (id, tenant_id, api_key_id, method, path, status_code, latency_ms, ts, request_id, client_ip, user_agent)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(Uuid::new_v4())
    .bind(event.tenant_id)
    .bind(event.api_key_id)
    .bind(&event.method)
    .bind(&event.path)
    .bind(event.status_code)
    .bind(event.latency_ms)
    .bind(event.ts)
    .bind(&event.request_id)
    .bind(&event.client_ip)
    .bind(&event.user_agent)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UsageEventRow {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub method: String,
    pub path: String,
    pub status_code: i32,
    pub latency_ms: i32,
    pub ts: DateTime<Utc>,
    pub request_id: String,
    pub client_ip: String,
    pub user_agent: String,
}
