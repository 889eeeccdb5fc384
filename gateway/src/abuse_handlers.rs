//! Abuse surface: suspect detection over unauthenticated 401 volume,
//! per-IP timelines, manual block/unblock, the reconcile-and-report read
//! path, and the gated auto-block sweep shared by the bulk and
//! one-click entry points.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::blocklist::{BlockActor, ReasonCode};
use crate::usage::UsageEventRow;

pub const BLOCK_TTL_MIN: i64 = 10;
pub const BLOCK_TTL_MAX: i64 = 7 * 24 * 3600;

const TOP_PATHS_PER_SUSPECT: usize = 3;

#[derive(FromRow)]
struct SuspectRow {
    client_ip: String,
    unauth_401_count: i64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Canonical suspect query: unauthenticated 401s per client IP within
/// the window, at or above the threshold, busiest first.
async fn suspect_ips(
    db: &PgPool,
    from_ts: DateTime<Utc>,
    to_ts: DateTime<Utc>,
    min_unauth_401: i64,
    limit: i64,
) -> Result<Vec<SuspectRow>, sqlx::Error> {
    sqlx::query_as::<_, SuspectRow>(
        "SELECT client_ip, COUNT(*) AS unauth_401_count,
                MIN(ts) AS first_seen, MAX(ts) AS last_seen
         FROM usage_events
         WHERE tenant_id IS NULL AND status_code = 401 AND ts >= $1 AND ts <= $2
         GROUP BY client_ip
         HAVING COUNT(*) >= $3
         ORDER BY COUNT(*) DESC
         LIMIT $4",
    )
    .bind(from_ts)
    .bind(to_ts)
    .bind(min_unauth_401)
    .bind(limit)
    .fetch_all(db)
    .await
}

async fn top_paths_for_ips(
    db: &PgPool,
    from_ts: DateTime<Utc>,
    to_ts: DateTime<Utc>,
    ips: &[String],
) -> Result<HashMap<String, Vec<Value>>, sqlx::Error> {
    let mut by_ip: HashMap<String, Vec<Value>> =
        ips.iter().map(|ip| (ip.clone(), Vec::new())).collect();
    if ips.is_empty() {
        return Ok(by_ip);
    }

    #[derive(FromRow)]
    struct IpPathRow {
        client_ip: String,
        path: String,
        count: i64,
    }

    let rows = sqlx::query_as::<_, IpPathRow>(
        "SELECT client_ip, path, COUNT(*) AS count
         FROM usage_events
         WHERE tenant_id IS NULL AND status_code = 401 AND ts >= $1 AND ts <= $2
           AND client_ip = ANY($3)
         GROUP BY client_ip, path
         ORDER BY client_ip ASC, COUNT(*) DESC",
    )
    .bind(from_ts)
    .bind(to_ts)
    .bind(ips)
    .fetch_all(db)
    .await?;

    for row in rows {
        let Some(bucket) = by_ip.get_mut(&row.client_ip) else {
            continue;
        };
        if bucket.len() >= TOP_PATHS_PER_SUSPECT {
            continue;
        }
        bucket.push(json!({ "path": row.path, "count": row.count }));
    }

    Ok(by_ip)
}

#[derive(Deserialize)]
pub struct SuspectsQuery {
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    #[serde(default = "default_min_unauth_401_read")]
    pub min_unauth_401: i64,
    #[serde(default = "default_suspects_limit")]
    pub limit: i64,
}

fn default_window_minutes() -> i64 {
    10
}

fn default_min_unauth_401_read() -> i64 {
    20
}

fn default_suspects_limit() -> i64 {
    20
}

pub async fn abuse_suspects(
    State(state): State<AppState>,
    Query(query): Query<SuspectsQuery>,
) -> ApiResult<Json<Value>> {
    let window_minutes = query.window_minutes.clamp(1, 24 * 60);
    let min_unauth_401 = query.min_unauth_401.clamp(1, 1_000_000);
    let limit = query.limit.clamp(1, 200);

    let to_ts = Utc::now();
    let from_ts = to_ts - Duration::minutes(window_minutes);

    let suspects = suspect_ips(&state.db, from_ts, to_ts, min_unauth_401, limit)
        .await
        .map_err(ApiError::internal)?;
    let ips: Vec<String> = suspects.iter().map(|s| s.client_ip.clone()).collect();
    let top_paths = top_paths_for_ips(&state.db, from_ts, to_ts, &ips)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "window_minutes": window_minutes,
        "from_ts": from_ts,
        "to_ts": to_ts,
        "min_unauth_401": min_unauth_401,
        "suspects": suspects
            .iter()
            .map(|s| json!({
                "client_ip": s.client_ip,
                "unauth_401_count": s.unauth_401_count,
                "first_seen": s.first_seen,
                "last_seen": s.last_seen,
                "top_paths": top_paths.get(&s.client_ip).cloned().unwrap_or_default(),
            }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
pub struct TimelineQuery {
    #[serde(default = "default_timeline_minutes")]
    pub minutes: i64,
    #[serde(default = "default_timeline_limit")]
    pub limit: i64,
}

fn default_timeline_minutes() -> i64 {
    60
}

fn default_timeline_limit() -> i64 {
    200
}

pub async fn ip_timeline(
    State(state): State<AppState>,
    Path(client_ip): Path<String>,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<Json<Value>> {
    let minutes = query.minutes.clamp(1, 24 * 60);
    let limit = query.limit.clamp(1, 500);

    let to_ts = Utc::now();
    let from_ts = to_ts - Duration::minutes(minutes);

    #[derive(FromRow)]
    struct StatusRow {
        status_code: i32,
        count: i64,
    }

    let status_rows = sqlx::query_as::<_, StatusRow>(
        "SELECT status_code, COUNT(*) AS count
         FROM usage_events
         WHERE client_ip = $1 AND ts >= $2 AND ts <= $3
         GROUP BY status_code
         ORDER BY status_code ASC",
    )
    .bind(&client_ip)
    .bind(from_ts)
    .bind(to_ts)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    #[derive(FromRow)]
    struct SignalsRow {
        unauth_rows: Option<i64>,
        unauth_401: Option<i64>,
        rate_limited_429: Option<i64>,
        success_2xx: Option<i64>,
    }

    let signals = sqlx::query_as::<_, SignalsRow>(
        "SELECT SUM(CASE WHEN tenant_id IS NULL THEN 1 ELSE 0 END) AS unauth_rows,
                SUM(CASE WHEN status_code = 401 THEN 1 ELSE 0 END) AS unauth_401,
                SUM(CASE WHEN status_code = 429 THEN 1 ELSE 0 END) AS rate_limited_429,
                SUM(CASE WHEN status_code BETWEEN 200 AND 299 THEN 1 ELSE 0 END) AS success_2xx
         FROM usage_events
         WHERE client_ip = $1 AND ts >= $2 AND ts <= $3",
    )
    .bind(&client_ip)
    .bind(from_ts)
    .bind(to_ts)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::internal)?;

    #[derive(FromRow)]
    struct PathRow {
        path: String,
        count: i64,
    }

    let top_paths = sqlx::query_as::<_, PathRow>(
        "SELECT path, COUNT(*) AS count
         FROM usage_events
         WHERE client_ip = $1 AND ts >= $2 AND ts <= $3
         GROUP BY path
         ORDER BY COUNT(*) DESC
         LIMIT 10",
    )
    .bind(&client_ip)
    .bind(from_ts)
    .bind(to_ts)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    let events = sqlx::query_as::<_, UsageEventRow>(
        "SELECT id, tenant_id, api_key_id, method, path, status_code, latency_ms, ts,
                request_id, client_ip, user_agent
         FROM usage_events
         WHERE client_ip = $1 AND ts >= $2 AND ts <= $3
         ORDER BY ts DESC
         LIMIT $4",
    )
    .bind(&client_ip)
    .bind(from_ts)
    .bind(to_ts)
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    let total: i64 = status_rows.iter().map(|row| row.count).sum();
    Ok(Json(json!({
        "client_ip": client_ip,
        "from_ts": from_ts,
        "to_ts": to_ts,
        "counts": {
            "total": total,
            "unauth_rows": signals.unauth_rows.unwrap_or(0),
            "unauth_401": signals.unauth_401.unwrap_or(0),
            "rate_limited_429": signals.rate_limited_429.unwrap_or(0),
            "success_2xx": signals.success_2xx.unwrap_or(0),
        },
        "by_status": status_rows
            .iter()
            .map(|row| (row.status_code.to_string(), json!(row.count)))
            .collect::<serde_json::Map<_, _>>(),
        "top_paths": top_paths
            .iter()
            .map(|row| json!({ "path": row.path, "count": row.count }))
            .collect::<Vec<_>>(),
        "events": events,
    })))
}

#[derive(Deserialize)]
pub struct BlockIpIn {
    pub client_ip: String,
    pub ttl_seconds: i64,
    #[serde(default = "default_manual")]
    pub reason_code: String,
    #[serde(default = "default_manual")]
    pub reason: String,
}

fn default_manual() -> String {
    "manual".to_string()
}

pub async fn block_ip(
    State(state): State<AppState>,
    Json(payload): Json<BlockIpIn>,
) -> ApiResult<Json<Value>> {
    let client_ip = payload.client_ip.trim().to_string();
    if client_ip.is_empty() || client_ip.len() > 128 {
        return Err(ApiError::bad_request("client_ip must be 1-128 characters"));
    }
    validate_block_ttl(payload.ttl_seconds)?;

    let reason_code = ReasonCode::normalize(&payload.reason_code);
    let outcome = state
        .blocklist
        .block(
            &client_ip,
            payload.ttl_seconds,
            reason_code,
            &payload.reason,
            BlockActor::AdminApi,
        )
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "status": "blocked",
        "client_ip": client_ip,
        "block_id": outcome.block_id,
        "reason_code": outcome.reason_code,
        "reason": payload.reason,
        "ttl_seconds": outcome.ttl_seconds,
        "expires_at_epoch": outcome.expires_at_epoch,
    })))
}

#[derive(Deserialize)]
pub struct UnblockIpIn {
    pub client_ip: String,
}

pub async fn unblock_ip(
    State(state): State<AppState>,
    Json(payload): Json<UnblockIpIn>,
) -> ApiResult<Json<Value>> {
    let client_ip = payload.client_ip.trim().to_string();
    if client_ip.is_empty() || client_ip.len() > 128 {
        return Err(ApiError::bad_request("client_ip must be 1-128 characters"));
    }

    let (deleted, removed_from_index) = state
        .blocklist
        .unblock(&client_ip, BlockActor::AdminApi)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "status": "unblocked",
        "client_ip": client_ip,
        "deleted": deleted,
        "removed_from_index": removed_from_index,
    })))
}

#[derive(Deserialize)]
pub struct BlockedQuery {
    #[serde(default = "default_blocked_limit")]
    pub limit: i64,
}

fn default_blocked_limit() -> i64 {
    200
}

pub async fn list_blocked_ips(
    State(state): State<AppState>,
    Query(query): Query<BlockedQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.clamp(1, 1000) as usize;
    let blocked = state.blocklist.list(limit).await.map_err(ApiError::internal)?;
    Ok(Json(json!({ "count": blocked.len(), "blocked": blocked })))
}

pub async fn blocked_details(
    State(state): State<AppState>,
    Path(client_ip): Path<String>,
) -> ApiResult<Json<Value>> {
    let details = state
        .blocklist
        .details(&client_ip)
        .await
        .map_err(ApiError::internal)?;

    let Some((meta, ttl_seconds)) = details else {
        return Ok(Json(json!({ "client_ip": client_ip, "blocked": false })));
    };

    Ok(Json(json!({
        "client_ip": client_ip,
        "blocked": true,
        "block_id": meta.block_id,
        "reason_code": meta.reason_code,
        "reason": meta.reason,
        "ttl_seconds": ttl_seconds,
        "expires_at_epoch": meta.expires_at_epoch,
    })))
}

#[derive(Deserialize)]
pub struct ReportQuery {
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: i64,
    #[serde(default = "default_blocked_limit")]
    pub limit: i64,
}

fn default_lookback_minutes() -> i64 {
    60
}

pub async fn blocks_report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<Json<Value>> {
    let lookback_minutes = query.lookback_minutes.clamp(1, 7 * 24 * 60);
    let limit = query.limit.clamp(1, 1000) as usize;

    let report = state
        .blocklist
        .report(lookback_minutes, limit)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "lookback_minutes": lookback_minutes,
        "now_epoch": report.now_epoch,
        "active_count": report.active.len(),
        "expired_recently_count": report.expired_recently.len(),
        "active": report.active,
        "expired_recently": report.expired_recently.into_iter().take(limit).collect::<Vec<_>>(),
        "cleaned_stale_index_members": report.cleaned_stale,
    })))
}

#[derive(Deserialize)]
pub struct BlockEventsQuery {
    #[serde(default = "default_events_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_events_limit() -> i64 {
    100
}

pub async fn block_events(
    State(state): State<AppState>,
    Query(query): Query<BlockEventsQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.clamp(1, 500);
    let offset = query.offset.max(0);

    let events = state
        .blocklist
        .events(limit as isize, offset as isize)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "limit": limit,
        "offset": offset,
        "count": events.len(),
        "events": events,
    })))
}

#[derive(Deserialize)]
pub struct AutoBlockIn {
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    #[serde(default = "default_min_unauth_401_block")]
    pub min_unauth_401: i64,
    #[serde(default = "default_auto_block_ttl")]
    pub ttl_seconds: i64,
    #[serde(default = "default_auto_reason_code")]
    pub reason_code: String,
    #[serde(default = "default_auto_reason")]
    pub reason: String,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default)]
    pub include_localhost: bool,
    #[serde(default = "default_auto_block_limit")]
    pub limit: i64,
}

#[derive(Deserialize)]
pub struct BlockSuspectsIn {
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    #[serde(default = "default_min_unauth_401_block")]
    pub min_unauth_401: i64,
    #[serde(default = "default_top_n")]
    pub top_n: i64,
    #[serde(default = "default_auto_block_ttl")]
    pub ttl_seconds: i64,
    #[serde(default = "default_one_click_reason_code")]
    pub reason_code: String,
    #[serde(default = "default_one_click_reason")]
    pub reason: String,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default)]
    pub include_localhost: bool,
}

fn default_min_unauth_401_block() -> i64 {
    50
}

fn default_auto_block_ttl() -> i64 {
    600
}

fn default_auto_reason_code() -> String {
    "auto_unauth_401_surge".to_string()
}

fn default_auto_reason() -> String {
    "auto: unauth_401 surge".to_string()
}

fn default_one_click_reason_code() -> String {
    "one_click_suspects".to_string()
}

fn default_one_click_reason() -> String {
    "one-click: suspects".to_string()
}

fn default_true() -> bool {
    true
}

fn default_auto_block_limit() -> i64 {
    50
}

fn default_top_n() -> i64 {
    10
}

struct SweepParams {
    ttl_seconds: i64,
    reason_code: ReasonCode,
    reason: String,
    dry_run: bool,
    include_localhost: bool,
}

/// One algorithm behind both auto-block entry points: walk the suspect
/// list, honor the localhost guard, and either record what would happen
/// (dry run) or write the block through the store.
async fn sweep_suspects(
    state: &AppState,
    suspects: &[SuspectRow],
    params: &SweepParams,
    actor: BlockActor,
) -> ApiResult<(Vec<Value>, Vec<Value>)> {
    let mut blocked = Vec::new();
    let mut skipped = Vec::new();

    for suspect in suspects {
        let ip = suspect.client_ip.as_str();

        if is_localhost(ip) && !params.include_localhost && !state.config.allow_block_localhost {
            skipped.push(json!({ "client_ip": ip, "reason": "localhost_block_protection" }));
            continue;
        }

        if params.dry_run {
            let now = Utc::now().timestamp();
            blocked.push(json!({
                "client_ip": ip,
                "unauth_401_count": suspect.unauth_401_count,
                "block_id": Uuid::new_v4().to_string(),
                "reason_code": params.reason_code,
                "reason": params.reason,
                "ttl_seconds": params.ttl_seconds,
                "expires_at_epoch": now + params.ttl_seconds,
                "dry_run": true,
            }));
            continue;
        }

        let outcome = state
            .blocklist
            .block(ip, params.ttl_seconds, params.reason_code, &params.reason, actor)
            .await
            .map_err(ApiError::internal)?;

        blocked.push(json!({
            "client_ip": ip,
            "unauth_401_count": suspect.unauth_401_count,
            "block_id": outcome.block_id,
            "reason_code": outcome.reason_code,
            "reason": params.reason,
            "ttl_seconds": outcome.ttl_seconds,
            "expires_at_epoch": outcome.expires_at_epoch,
            "dry_run": false,
        }));
    }

    Ok((blocked, skipped))
}

pub async fn auto_block_from_suspects(
    State(state): State<AppState>,
    Json(payload): Json<AutoBlockIn>,
) -> ApiResult<Json<Value>> {
    ensure_auto_block_enabled(&state)?;
    validate_window_minutes(payload.window_minutes)?;
    validate_min_unauth_401(payload.min_unauth_401)?;
    validate_block_ttl(payload.ttl_seconds)?;
    if !(1..=500).contains(&payload.limit) {
        return Err(ApiError::bad_request("limit must be between 1 and 500"));
    }

    let to_ts = Utc::now();
    let from_ts = to_ts - Duration::minutes(payload.window_minutes);

    let suspects = suspect_ips(&state.db, from_ts, to_ts, payload.min_unauth_401, payload.limit)
        .await
        .map_err(ApiError::internal)?;

    let params = SweepParams {
        ttl_seconds: payload.ttl_seconds,
        reason_code: ReasonCode::normalize(&payload.reason_code),
        reason: payload.reason.clone(),
        dry_run: payload.dry_run,
        include_localhost: payload.include_localhost,
    };
    let (blocked, skipped) =
        sweep_suspects(&state, &suspects, &params, BlockActor::AutoBlock).await?;

    Ok(Json(json!({
        "enabled": true,
        "dry_run": payload.dry_run,
        "window_minutes": payload.window_minutes,
        "min_unauth_401": payload.min_unauth_401,
        "ttl_seconds": payload.ttl_seconds,
        "from_ts": from_ts,
        "to_ts": to_ts,
        "blocked_count": blocked.len(),
        "skipped_count": skipped.len(),
        "blocked": blocked,
        "skipped": skipped,
    })))
}

pub async fn block_top_suspects(
    State(state): State<AppState>,
    Json(payload): Json<BlockSuspectsIn>,
) -> ApiResult<Json<Value>> {
    ensure_auto_block_enabled(&state)?;
    validate_window_minutes(payload.window_minutes)?;
    validate_min_unauth_401(payload.min_unauth_401)?;
    validate_block_ttl(payload.ttl_seconds)?;
    if !(1..=200).contains(&payload.top_n) {
        return Err(ApiError::bad_request("top_n must be between 1 and 200"));
    }

    let to_ts = Utc::now();
    let from_ts = to_ts - Duration::minutes(payload.window_minutes);

    let suspects = suspect_ips(&state.db, from_ts, to_ts, payload.min_unauth_401, payload.top_n)
        .await
        .map_err(ApiError::internal)?;

    let params = SweepParams {
        ttl_seconds: payload.ttl_seconds,
        reason_code: ReasonCode::normalize(&payload.reason_code),
        reason: payload.reason.clone(),
        dry_run: payload.dry_run,
        include_localhost: payload.include_localhost,
    };
    let (blocked, skipped) =
        sweep_suspects(&state, &suspects, &params, BlockActor::OneClick).await?;

    Ok(Json(json!({
        "dry_run": payload.dry_run,
        "from_ts": from_ts,
        "to_ts": to_ts,
        "min_unauth_401": payload.min_unauth_401,
        "top_n": payload.top_n,
        "ttl_seconds": payload.ttl_seconds,
        "blocked_count": blocked.len(),
        "skipped_count": skipped.len(),
        "blocked": blocked,
        "skipped": skipped,
    })))
}

fn ensure_auto_block_enabled(state: &AppState) -> ApiResult<()> {
    if !state.config.enable_auto_block {
        return Err(ApiError::conflict(
            "Auto-block is disabled. Set ENABLE_AUTO_BLOCK=true to enable.",
        ));
    }
    Ok(())
}

fn validate_window_minutes(window_minutes: i64) -> ApiResult<()> {
    if !(1..=24 * 60).contains(&window_minutes) {
        return Err(ApiError::bad_request("window_minutes must be between 1 and 1440"));
    }
    Ok(())
}

fn validate_min_unauth_401(min_unauth_401: i64) -> ApiResult<()> {
    if !(1..=1_000_000).contains(&min_unauth_401) {
        return Err(ApiError::bad_request("min_unauth_401 must be between 1 and 1000000"));
    }
    Ok(())
}

fn validate_block_ttl(ttl_seconds: i64) -> ApiResult<()> {
    if !(BLOCK_TTL_MIN..=BLOCK_TTL_MAX).contains(&ttl_seconds) {
        return Err(ApiError::bad_request(
            "ttl_seconds must be between 10 and 604800",
        ));
    }
    Ok(())
}

fn is_localhost(ip: &str) -> bool {
    ip == "127.0.0.1" || ip == "::1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_addresses_are_guarded() {
        assert!(is_localhost("127.0.0.1"));
        assert!(is_localhost("::1"));
        assert!(!is_localhost("9.9.9.9"));
        assert!(!is_localhost("127.0.0.2"));
    }

    #[test]
    fn block_ttl_bounds_are_enforced() {
        assert!(validate_block_ttl(9).is_err());
        assert!(validate_block_ttl(10).is_ok());
        assert!(validate_block_ttl(604_800).is_ok());
        assert!(validate_block_ttl(604_801).is_err());
    }

    #[test]
    fn suspect_window_bounds_are_enforced() {
        assert!(validate_window_minutes(0).is_err());
        assert!(validate_window_minutes(1).is_ok());
        assert!(validate_window_minutes(1440).is_ok());
        assert!(validate_window_minutes(1441).is_err());
        assert!(validate_min_unauth_401(0).is_err());
        assert!(validate_min_unauth_401(1_000_001).is_err());
    }
}
