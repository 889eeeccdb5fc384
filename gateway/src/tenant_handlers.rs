//! Admin surface for tenant and credential lifecycle: creation, one-time
//! plaintext hand-off, revocation, and per-key limit/tier mutation.

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::keys::{generate_plaintext_key, hash_key, key_prefix};

pub const TENANT_NAME_MAX_LEN: usize = 200;
pub const RATE_LIMIT_MAX: i32 = 1_000_000;
pub const RATE_WINDOW_MAX: i32 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    /// `(rate_limit, rate_window)` granted by the tier.
    pub fn limits(self) -> (i32, i32) {
        match self {
            Tier::Free => (10, 60),
            Tier::Pro => (120, 60),
            Tier::Enterprise => (600, 60),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown tier: {0}")]
pub struct UnknownTier(String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

#[derive(Deserialize)]
pub struct TenantCreateIn {
    pub name: String,
}

#[derive(Serialize, FromRow)]
pub struct TenantOut {
    pub id: Uuid,
    pub name: String,
}

#[derive(Serialize)]
pub struct ApiKeyCreateOut {
    pub key_id: Uuid,
    pub tenant_id: Uuid,
    pub key_prefix: String,
    /// The plaintext is returned exactly once; only the hash is stored.
    pub api_key: String,
}

#[derive(Serialize, FromRow)]
pub struct ApiKeyRow {
    pub id: Uuid,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub rate_limit: Option<i32>,
    pub rate_window: Option<i32>,
}

#[derive(Serialize)]
pub struct RevokeOut {
    pub status: &'static str,
    pub key_id: Uuid,
}

#[derive(Deserialize)]
pub struct ApiKeyLimitsIn {
    pub rate_limit: i32,
    pub rate_window: i32,
}

#[derive(Serialize)]
pub struct ApiKeyLimitsOut {
    pub status: &'static str,
    pub key_id: Uuid,
    pub rate_limit: i32,
    pub rate_window: i32,
}

#[derive(Deserialize)]
pub struct ApiKeyTierIn {
    pub tier: String,
}

#[derive(Serialize)]
pub struct ApiKeyTierOut {
    pub status: &'static str,
    pub key_id: Uuid,
    pub tier: &'static str,
    pub rate_limit: i32,
    pub rate_window: i32,
}

pub async fn create_tenant(
    State(state): State<AppState>,
    Json(payload): Json<TenantCreateIn>,
) -> ApiResult<Json<TenantOut>> {
    let name = payload.name.trim().to_string();
    if name.is_empty() || name.chars().count() > TENANT_NAME_MAX_LEN {
        return Err(ApiError::bad_request("Tenant name must be 1-200 characters"));
    }

    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenants WHERE name = $1")
        .bind(&name)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::internal)?;
    if existing > 0 {
        return Err(ApiError::conflict("Tenant name already exists"));
    }

    let tenant = sqlx::query_as::<_, TenantOut>(
        "INSERT INTO tenants (id, name, created_at) VALUES ($1, $2, $3) RETURNING id, name",
    )
    .bind(Uuid::new_v4())
    .bind(&name)
    .bind(Utc::now())
    .fetch_one(&state.db)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            ApiError::conflict("Tenant name already exists")
        } else {
            ApiError::internal(err)
        }
    })?;

    Ok(Json(tenant))
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ApiKeyCreateOut>> {
    let tenant_exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenants WHERE id = $1")
        .bind(tenant_id)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::internal)?;
    if tenant_exists == 0 {
        return Err(ApiError::NotFound { detail: "Tenant not found" });
    }

    let plain = generate_plaintext_key().map_err(ApiError::internal)?;
    let hashed = hash_key(&plain);
    let prefix = key_prefix(&plain);

    let colliding: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_keys WHERE key_hash = $1")
        .bind(&hashed)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::internal)?;
    if colliding > 0 {
        return Err(ApiError::internal("Key generation collision"));
    }

    let key_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO api_keys (id, tenant_id, key_hash, key_prefix, created_at)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(key_id)
    .bind(tenant_id)
    .bind(&hashed)
    .bind(&prefix)
    .bind(Utc::now())
    .execute(&state.db)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            // Retryable: the admin call mints a fresh key on the next attempt.
            ApiError::internal("Key generation collision")
        } else {
            ApiError::internal(err)
        }
    })?;

    Ok(Json(ApiKeyCreateOut {
        key_id,
        tenant_id,
        key_prefix: prefix,
        api_key: plain,
    }))
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    Path(key_id): Path<Uuid>,
) -> ApiResult<Json<RevokeOut>> {
    let revoked_at: Option<Option<DateTime<Utc>>> =
        sqlx::query_scalar("SELECT revoked_at FROM api_keys WHERE id = $1")
            .bind(key_id)
            .fetch_optional(&state.db)
            .await
            .map_err(ApiError::internal)?;

    match revoked_at {
        None => Err(ApiError::NotFound { detail: "Key not found" }),
        Some(Some(_)) => Ok(Json(RevokeOut { status: "already_revoked", key_id })),
        Some(None) => {
            sqlx::query("UPDATE api_keys SET revoked_at = $1 WHERE id = $2 AND revoked_at IS NULL")
                .bind(Utc::now())
                .bind(key_id)
                .execute(&state.db)
                .await
                .map_err(ApiError::internal)?;
            Ok(Json(RevokeOut { status: "revoked", key_id }))
        }
    }
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ApiKeyRow>>> {
    let keys = sqlx::query_as::<_, ApiKeyRow>(
        "SELECT id, key_prefix, created_at, revoked_at, rate_limit, rate_window
         FROM api_keys WHERE tenant_id = $1
         ORDER BY created_at DESC",
    )
    .bind(tenant_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::internal)?;

    Ok(Json(keys))
}

pub async fn set_key_limits(
    State(state): State<AppState>,
    Path(key_id): Path<Uuid>,
    Json(payload): Json<ApiKeyLimitsIn>,
) -> ApiResult<Json<ApiKeyLimitsOut>> {
    if !(1..=RATE_LIMIT_MAX).contains(&payload.rate_limit) {
        return Err(ApiError::bad_request("rate_limit must be between 1 and 1000000"));
    }
    if !(1..=RATE_WINDOW_MAX).contains(&payload.rate_window) {
        return Err(ApiError::bad_request("rate_window must be between 1 and 86400"));
    }

    let updated = sqlx::query("UPDATE api_keys SET rate_limit = $1, rate_window = $2 WHERE id = $3")
        .bind(payload.rate_limit)
        .bind(payload.rate_window)
        .bind(key_id)
        .execute(&state.db)
        .await
        .map_err(ApiError::internal)?;
    if updated.rows_affected() == 0 {
        return Err(ApiError::NotFound { detail: "Key not found" });
    }

    Ok(Json(ApiKeyLimitsOut {
        status: "ok",
        key_id,
        rate_limit: payload.rate_limit,
        rate_window: payload.rate_window,
    }))
}

pub async fn set_key_tier(
    State(state): State<AppState>,
    Path(key_id): Path<Uuid>,
    Json(payload): Json<ApiKeyTierIn>,
) -> ApiResult<Json<ApiKeyTierOut>> {
    let tier = Tier::from_str(payload.tier.trim().to_lowercase().as_str())
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let revoked_at: Option<Option<DateTime<Utc>>> =
        sqlx::query_scalar("SELECT revoked_at FROM api_keys WHERE id = $1")
            .bind(key_id)
            .fetch_optional(&state.db)
            .await
            .map_err(ApiError::internal)?;
    match revoked_at {
        None => return Err(ApiError::NotFound { detail: "Key not found" }),
        Some(Some(_)) => return Err(ApiError::conflict("Key is revoked")),
        Some(None) => {}
    }

    let (rate_limit, rate_window) = tier.limits();
    sqlx::query("UPDATE api_keys SET rate_limit = $1, rate_window = $2 WHERE id = $3")
        .bind(rate_limit)
        .bind(rate_window)
        .bind(key_id)
        .execute(&state.db)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(ApiKeyTierOut {
        status: "ok",
        key_id,
        tier: tier.as_str(),
        rate_limit,
        rate_window,
    }))
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_map_to_expected_limits() {
        assert_eq!(Tier::Free.limits(), (10, 60));
        assert_eq!(Tier::Pro.limits(), (120, 60));
        assert_eq!(Tier::Enterprise.limits(), (600, 60));
    }

    #[test]
    fn tier_parsing_is_case_normalized_by_caller() {
        assert_eq!("pro".parse::<Tier>().unwrap(), Tier::Pro);
        assert_eq!("enterprise".parse::<Tier>().unwrap(), Tier::Enterprise);
        let err = "platinum".parse::<Tier>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown tier: platinum");
    }
}
