//! Usage analytics over the event store: per-tenant status and latency
//! summaries, endpoint/key hotspots, 429 views, and near-quota keys.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::timerange::{flexible_ts, resolve_timerange};
use crate::usage::UsageEventRow;

#[derive(Deserialize)]
pub struct RangeQuery {
    #[serde(default, deserialize_with = "flexible_ts")]
    pub from_ts: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flexible_ts")]
    pub to_ts: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct TopEndpointsQuery {
    #[serde(default, deserialize_with = "flexible_ts")]
    pub from_ts: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flexible_ts")]
    pub to_ts: Option<DateTime<Utc>>,
    #[serde(default = "default_limit_10")]
    pub limit: i64,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_limit_50")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Deserialize)]
pub struct TopLimitQuery {
    #[serde(default, deserialize_with = "flexible_ts")]
    pub from_ts: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flexible_ts")]
    pub to_ts: Option<DateTime<Utc>>,
    #[serde(default = "default_limit_10")]
    pub top_limit: i64,
}

#[derive(Deserialize)]
pub struct NearQuotaQuery {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_limit_20")]
    pub limit: i64,
}

fn default_limit_10() -> i64 {
    10
}

fn default_limit_20() -> i64 {
    20
}

fn default_limit_50() -> i64 {
    50
}

fn default_threshold() -> f64 {
    0.8
}

#[derive(FromRow)]
struct StatusCountRow {
    status_code: i32,
    count: i64,
    avg_latency: Option<f64>,
}

#[derive(FromRow)]
struct PathErrorRow {
    path: String,
    count: i64,
    errors: Option<i64>,
}

#[derive(FromRow)]
struct KeyErrorRow {
    api_key_id: Option<Uuid>,
    count: i64,
    errors: Option<i64>,
}

#[derive(FromRow)]
struct PathCountRow {
    path: String,
    count: i64,
}

pub async fn usage_summary(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Value>> {
    let (from_ts, to_ts) = resolve_timerange(range.from_ts, range.to_ts, 24)?;

    let rows = sqlx::query_as::<_, StatusCountRow>(
        "SELECT status_code, COUNT(*) AS count, AVG(latency_ms)::float8 AS avg_latency
         FROM usage_events
         WHERE tenant_id = $1 AND ts >= $2 AND ts <= $3
         GROUP BY status_code",
    )
    .bind(tenant_id)
    .bind(from_ts)
    .bind(to_ts)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    let by_status: BTreeMap<String, i64> = rows
        .iter()
        .map(|row| (row.status_code.to_string(), row.count))
        .collect();
    let avg_latency_ms = round2(
        rows.iter().map(|row| row.avg_latency.unwrap_or(0.0)).sum::<f64>()
            / rows.len().max(1) as f64,
    );

    Ok(Json(json!({
        "from_ts": from_ts,
        "to_ts": to_ts,
        "by_status": by_status,
        "avg_latency_ms": avg_latency_ms,
    })))
}

pub async fn top_endpoints(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<TopEndpointsQuery>,
) -> ApiResult<Json<Value>> {
    let (from_ts, to_ts) = resolve_timerange(query.from_ts, query.to_ts, 24)?;
    let limit = query.limit.clamp(1, 100);

    let rows = sqlx::query_as::<_, PathErrorRow>(
        "SELECT path, COUNT(*) AS count,
                SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END) AS errors
         FROM usage_events
         WHERE tenant_id = $1 AND ts >= $2 AND ts <= $3
         GROUP BY path
         ORDER BY COUNT(*) DESC
         LIMIT $4",
    )
    .bind(tenant_id)
    .bind(from_ts)
    .bind(to_ts)
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    let endpoints: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "path": row.path,
                "count": row.count,
                "error_rate": error_rate(row.errors, row.count),
            })
        })
        .collect();

    Ok(Json(Value::Array(endpoints)))
}

pub async fn usage_by_key(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Value>> {
    let (from_ts, to_ts) = resolve_timerange(range.from_ts, range.to_ts, 24)?;

    let rows = sqlx::query_as::<_, KeyErrorRow>(
        "SELECT api_key_id, COUNT(*) AS count,
                SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END) AS errors
         FROM usage_events
         WHERE tenant_id = $1 AND ts >= $2 AND ts <= $3
         GROUP BY api_key_id
         ORDER BY COUNT(*) DESC",
    )
    .bind(tenant_id)
    .bind(from_ts)
    .bind(to_ts)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    let keys: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "api_key_id": row.api_key_id,
                "count": row.count,
                "error_rate": error_rate(row.errors, row.count),
            })
        })
        .collect();

    Ok(Json(Value::Array(keys)))
}

pub async fn usage_status_classes(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Value>> {
    let (from_ts, to_ts) = resolve_timerange(range.from_ts, range.to_ts, 24)?;

    #[derive(FromRow)]
    struct StatusClassesRow {
        s2xx: Option<i64>,
        s4xx: Option<i64>,
        s5xx: Option<i64>,
    }

    let row = sqlx::query_as::<_, StatusClassesRow>(
        "SELECT SUM(CASE WHEN status_code BETWEEN 200 AND 299 THEN 1 ELSE 0 END) AS s2xx,
                SUM(CASE WHEN status_code BETWEEN 400 AND 499 THEN 1 ELSE 0 END) AS s4xx,
                SUM(CASE WHEN status_code >= 500 THEN 1 ELSE 0 END) AS s5xx
         FROM usage_events
         WHERE tenant_id = $1 AND ts >= $2 AND ts <= $3",
    )
    .bind(tenant_id)
    .bind(from_ts)
    .bind(to_ts)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "from_ts": from_ts,
        "to_ts": to_ts,
        "2xx": row.s2xx.unwrap_or(0),
        "4xx": row.s4xx.unwrap_or(0),
        "5xx": row.s5xx.unwrap_or(0),
    })))
}

pub async fn list_usage_events(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<UsageEventRow>>> {
    let limit = query.limit.clamp(1, 200);
    let offset = query.offset.max(0);

    let events = sqlx::query_as::<_, UsageEventRow>(
        "SELECT id, tenant_id, api_key_id, method, path, status_code, latency_ms, ts,
                request_id, client_ip, user_agent
         FROM usage_events
         WHERE tenant_id = $1
         ORDER BY ts DESC
         LIMIT $2 OFFSET $3",
    )
    .bind(tenant_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    Ok(Json(events))
}

pub async fn unauth_usage(
    State(state): State<AppState>,
    Query(query): Query<TopLimitQuery>,
) -> ApiResult<Json<Value>> {
    let (from_ts, to_ts) = resolve_timerange(query.from_ts, query.to_ts, 24)?;
    let top_limit = query.top_limit.clamp(1, 50);

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM usage_events
         WHERE tenant_id IS NULL AND ts >= $1 AND ts <= $2",
    )
    .bind(from_ts)
    .bind(to_ts)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::internal)?;

    let by_status_rows = sqlx::query_as::<_, StatusCountRow>(
        "SELECT status_code, COUNT(*) AS count, AVG(latency_ms)::float8 AS avg_latency
         FROM usage_events
         WHERE tenant_id IS NULL AND ts >= $1 AND ts <= $2
         GROUP BY status_code
         ORDER BY status_code ASC",
    )
    .bind(from_ts)
    .bind(to_ts)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    let top_paths = sqlx::query_as::<_, PathErrorRow>(
        "SELECT path, COUNT(*) AS count,
                SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END) AS errors
         FROM usage_events
         WHERE tenant_id IS NULL AND ts >= $1 AND ts <= $2
         GROUP BY path
         ORDER BY COUNT(*) DESC
         LIMIT $3",
    )
    .bind(from_ts)
    .bind(to_ts)
    .bind(top_limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    #[derive(FromRow)]
    struct IpUnauthRow {
        client_ip: String,
        count: i64,
        unauth_401: Option<i64>,
    }

    let top_ips = sqlx::query_as::<_, IpUnauthRow>(
        "SELECT client_ip, COUNT(*) AS count,
                SUM(CASE WHEN status_code = 401 THEN 1 ELSE 0 END) AS unauth_401
         FROM usage_events
         WHERE tenant_id IS NULL AND ts >= $1 AND ts <= $2
         GROUP BY client_ip
         ORDER BY COUNT(*) DESC
         LIMIT $3",
    )
    .bind(from_ts)
    .bind(to_ts)
    .bind(top_limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    let by_status: BTreeMap<String, i64> = by_status_rows
        .iter()
        .map(|row| (row.status_code.to_string(), row.count))
        .collect();
    let avg_latency_ms = if by_status_rows.is_empty() {
        0.0
    } else {
        round2(
            by_status_rows
                .iter()
                .map(|row| row.avg_latency.unwrap_or(0.0))
                .sum::<f64>()
                / by_status_rows.len() as f64,
        )
    };

    Ok(Json(json!({
        "from_ts": from_ts,
        "to_ts": to_ts,
        "total": total,
        "by_status": by_status,
        "avg_latency_ms": avg_latency_ms,
        "top_paths": top_paths
            .iter()
            .map(|row| json!({
                "path": row.path,
                "count": row.count,
                "error_rate": error_rate(row.errors, row.count),
            }))
            .collect::<Vec<_>>(),
        "top_ips": top_ips
            .iter()
            .map(|row| json!({
                "client_ip": row.client_ip,
                "count": row.count,
                "unauth_401": row.unauth_401.unwrap_or(0),
            }))
            .collect::<Vec<_>>(),
    })))
}

pub async fn global_rate_limited_usage(
    State(state): State<AppState>,
    Query(query): Query<TopLimitQuery>,
) -> ApiResult<Json<Value>> {
    let (from_ts, to_ts) = resolve_timerange(query.from_ts, query.to_ts, 24)?;
    let top_limit = query.top_limit.clamp(1, 50);

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM usage_events
         WHERE status_code = 429 AND ts >= $1 AND ts <= $2",
    )
    .bind(from_ts)
    .bind(to_ts)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::internal)?;

    let top_paths = sqlx::query_as::<_, PathCountRow>(
        "SELECT path, COUNT(*) AS count
         FROM usage_events
         WHERE status_code = 429 AND ts >= $1 AND ts <= $2
         GROUP BY path
         ORDER BY COUNT(*) DESC
         LIMIT $3",
    )
    .bind(from_ts)
    .bind(to_ts)
    .bind(top_limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    #[derive(FromRow)]
    struct TenantCountRow {
        tenant_id: Uuid,
        count: i64,
    }

    let by_tenant = sqlx::query_as::<_, TenantCountRow>(
        "SELECT tenant_id, COUNT(*) AS count
         FROM usage_events
         WHERE status_code = 429 AND ts >= $1 AND ts <= $2 AND tenant_id IS NOT NULL
         GROUP BY tenant_id
         ORDER BY COUNT(*) DESC
         LIMIT $3",
    )
    .bind(from_ts)
    .bind(to_ts)
    .bind(top_limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "from_ts": from_ts,
        "to_ts": to_ts,
        "total_429": total,
        "top_paths": top_paths
            .iter()
            .map(|row| json!({ "path": row.path, "count": row.count }))
            .collect::<Vec<_>>(),
        "by_tenant": by_tenant
            .iter()
            .map(|row| json!({ "tenant_id": row.tenant_id, "count": row.count }))
            .collect::<Vec<_>>(),
    })))
}

pub async fn tenant_rate_limited_usage(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<TopLimitQuery>,
) -> ApiResult<Json<Value>> {
    let (from_ts, to_ts) = resolve_timerange(query.from_ts, query.to_ts, 24)?;
    let top_limit = query.top_limit.clamp(1, 50);

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM usage_events
         WHERE tenant_id = $1 AND status_code = 429 AND ts >= $2 AND ts <= $3",
    )
    .bind(tenant_id)
    .bind(from_ts)
    .bind(to_ts)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::internal)?;

    #[derive(FromRow)]
    struct KeyCountRow {
        api_key_id: Uuid,
        count: i64,
    }

    let by_key = sqlx::query_as::<_, KeyCountRow>(
        "SELECT api_key_id, COUNT(*) AS count
         FROM usage_events
         WHERE tenant_id = $1 AND status_code = 429 AND ts >= $2 AND ts <= $3
           AND api_key_id IS NOT NULL
         GROUP BY api_key_id
         ORDER BY COUNT(*) DESC
         LIMIT $4",
    )
    .bind(tenant_id)
    .bind(from_ts)
    .bind(to_ts)
    .bind(top_limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    let top_paths = sqlx::query_as::<_, PathCountRow>(
        "SELECT path, COUNT(*) AS count
         FROM usage_events
         WHERE tenant_id = $1 AND status_code = 429 AND ts >= $2 AND ts <= $3
         GROUP BY path
         ORDER BY COUNT(*) DESC
         LIMIT $4",
    )
    .bind(tenant_id)
    .bind(from_ts)
    .bind(to_ts)
    .bind(top_limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "tenant_id": tenant_id,
        "from_ts": from_ts,
        "to_ts": to_ts,
        "total_429": total,
        "by_key": by_key
            .iter()
            .map(|row| json!({ "api_key_id": row.api_key_id, "count": row.count }))
            .collect::<Vec<_>>(),
        "top_paths": top_paths
            .iter()
            .map(|row| json!({ "path": row.path, "count": row.count }))
            .collect::<Vec<_>>(),
    })))
}

pub async fn keys_near_quota(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<NearQuotaQuery>,
) -> ApiResult<Json<Value>> {
    if !(query.threshold > 0.0 && query.threshold <= 1.0) {
        return Err(ApiError::bad_request("threshold must be (0, 1]"));
    }
    let limit = query.limit.clamp(1, 50) as usize;
    let now = Utc::now();

    #[derive(FromRow)]
    struct QuotaKeyRow {
        id: Uuid,
        key_prefix: String,
        rate_limit: Option<i32>,
        rate_window: Option<i32>,
    }

    let keys = sqlx::query_as::<_, QuotaKeyRow>(
        "SELECT id, key_prefix, rate_limit, rate_window
         FROM api_keys
         WHERE tenant_id = $1 AND revoked_at IS NULL",
    )
    .bind(tenant_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    let mut results: Vec<(f64, Value)> = Vec::new();
    for key in keys {
        // Only keys with explicit positive limits are comparable.
        let (Some(rate_limit), Some(rate_window)) = (key.rate_limit, key.rate_window) else {
            continue;
        };
        if rate_limit <= 0 || rate_window <= 0 {
            continue;
        }

        let window_start = now - Duration::seconds(i64::from(rate_window));
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM usage_events WHERE api_key_id = $1 AND ts >= $2",
        )
        .bind(key.id)
        .bind(window_start)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::internal)?;

        let utilization = count as f64 / f64::from(rate_limit);
        if utilization >= query.threshold {
            results.push((
                utilization,
                json!({
                    "api_key_id": key.id,
                    "key_prefix": key.key_prefix,
                    "requests_in_window": count,
                    "rate_limit": rate_limit,
                    "utilization": round2(utilization),
                }),
            ));
        }
    }

    results.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let keys: Vec<Value> = results.into_iter().take(limit).map(|(_, value)| value).collect();

    Ok(Json(json!({
        "tenant_id": tenant_id,
        "threshold": query.threshold,
        "keys": keys,
    })))
}

fn error_rate(errors: Option<i64>, count: i64) -> f64 {
    round2(errors.unwrap_or(0) as f64 / count.max(1) as f64)
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_two_decimals() {
        assert_eq!(round2(0.666_666), 0.67);
        assert_eq!(round2(12.0), 12.0);
        assert_eq!(round2(0.004), 0.0);
    }

    #[test]
    fn error_rate_guards_against_empty_groups() {
        assert_eq!(error_rate(Some(1), 3), 0.33);
        assert_eq!(error_rate(None, 10), 0.0);
        assert_eq!(error_rate(Some(0), 0), 0.0);
    }
}
