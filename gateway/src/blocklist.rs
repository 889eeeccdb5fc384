//! IP blocklist backed by three Redis structures: a TTL key per blocked
//! IP (`blk:ip:<ip>`), a sorted-set index scored by expiry epoch
//! (`blk:index`), and a capped list of block/unblock events
//! (`blk:events`). Writes are pipelined but not transactional; readers
//! tolerate partial visibility and the report path evicts stale index
//! members.

use crate::redis_client::RedisHandle;
use anyhow::Result;
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub const BLOCK_IP_PREFIX: &str = "blk:ip:";
pub const BLOCK_IP_INDEX_KEY: &str = "blk:index";
pub const BLOCK_EVENTS_KEY: &str = "blk:events";
pub const BLOCK_EVENTS_MAX: i64 = 5000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    #[default]
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "operator_action")]
    OperatorAction,
    #[serde(rename = "auto_unauth_401_surge")]
    AutoUnauth401Surge,
    #[serde(rename = "one_click_suspects")]
    OneClickSuspects,
}

impl ReasonCode {
    /// Anything outside the closed set is written as `manual`.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "manual" => Self::Manual,
            "operator_action" => Self::OperatorAction,
            "auto_unauth_401_surge" => Self::AutoUnauth401Surge,
            "one_click_suspects" => Self::OneClickSuspects,
            _ => Self::Manual,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::OperatorAction => "operator_action",
            Self::AutoUnauth401Surge => "auto_unauth_401_surge",
            Self::OneClickSuspects => "one_click_suspects",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockActor {
    #[serde(rename = "admin_api")]
    AdminApi,
    #[serde(rename = "auto_block")]
    AutoBlock,
    #[serde(rename = "one_click")]
    OneClick,
}

/// Payload written under `blk:ip:<ip>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEntry {
    pub block_id: String,
    pub reason_code: ReasonCode,
    pub reason: String,
    pub created_at_epoch: i64,
    pub expires_at_epoch: i64,
}

/// Tolerant view of a stored block value. Legacy deployments wrote the
/// bare reason string; those parse as `{reason, reason_code: manual}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BlockMeta {
    pub block_id: Option<String>,
    pub reason_code: ReasonCode,
    pub reason: Option<String>,
    pub created_at_epoch: Option<i64>,
    pub expires_at_epoch: Option<i64>,
}

pub fn parse_block_value(raw: &str) -> BlockMeta {
    if raw.trim_start().starts_with('{') {
        if let Ok(meta) = serde_json::from_str::<BlockMeta>(raw) {
            return meta;
        }
    }
    BlockMeta {
        reason: Some(raw.to_string()),
        reason_code: ReasonCode::Manual,
        ..BlockMeta::default()
    }
}

#[derive(Debug, Clone, Serialize)]
struct BlockEvent {
    event_type: &'static str,
    ts_epoch: i64,
    client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    block_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason_code: Option<ReasonCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at_epoch: Option<i64>,
    actor: BlockActor,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    removed_from_index: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct BlockOutcome {
    pub block_id: String,
    pub reason_code: ReasonCode,
    pub created_at_epoch: i64,
    pub expires_at_epoch: i64,
    /// Actual TTL observed after the write when positive, otherwise the
    /// requested duration.
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockedEntry {
    pub client_ip: String,
    pub ttl_seconds: Option<i64>,
    pub block_id: Option<String>,
    pub reason_code: ReasonCode,
    pub reason: Option<String>,
    pub expires_at_epoch: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveBlock {
    pub client_ip: String,
    pub ttl_seconds: Option<i64>,
    pub expires_at_epoch: Option<i64>,
    pub block_id: Option<String>,
    pub reason_code: ReasonCode,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpiredBlock {
    pub client_ip: String,
    pub expired_at_epoch: i64,
}

#[derive(Debug, Clone)]
pub struct BlocksReport {
    pub now_epoch: i64,
    pub active: Vec<ActiveBlock>,
    pub expired_recently: Vec<ExpiredBlock>,
    pub cleaned_stale: usize,
}

#[derive(Clone)]
pub struct BlocklistStore {
    redis: RedisHandle,
}

impl BlocklistStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis }
    }

    pub async fn block(
        &self,
        client_ip: &str,
        ttl_seconds: i64,
        reason_code: ReasonCode,
        reason: &str,
        actor: BlockActor,
    ) -> Result<BlockOutcome> {
        let created_at_epoch = Utc::now().timestamp();
        let expires_at_epoch = created_at_epoch + ttl_seconds;
        let block_id = Uuid::new_v4().to_string();

        let entry = BlockEntry {
            block_id: block_id.clone(),
            reason_code,
            reason: reason.to_string(),
            created_at_epoch,
            expires_at_epoch,
        };
        let payload = serde_json::to_string(&entry)?;
        let key = block_key(client_ip);

        let mut conn = self.redis.conn().await?;
        redis::pipe()
            .set_ex(&key, payload, ttl_seconds as u64)
            .ignore()
            .zadd(BLOCK_IP_INDEX_KEY, client_ip, expires_at_epoch)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        self.push_event(BlockEvent {
            event_type: "block",
            ts_epoch: created_at_epoch,
            client_ip: client_ip.to_string(),
            block_id: Some(block_id.clone()),
            reason_code: Some(reason_code),
            reason: Some(reason.to_string()),
            expires_at_epoch: Some(expires_at_epoch),
            actor,
            deleted: None,
            removed_from_index: None,
        })
        .await?;

        let ttl: i64 = conn.ttl(&key).await?;
        Ok(BlockOutcome {
            block_id,
            reason_code,
            created_at_epoch,
            expires_at_epoch,
            ttl_seconds: if ttl > 0 { ttl } else { ttl_seconds },
        })
    }

    /// Returns `(key_deleted, removed_from_index)`.
    pub async fn unblock(&self, client_ip: &str, actor: BlockActor) -> Result<(bool, bool)> {
        let key = block_key(client_ip);
        let mut conn = self.redis.conn().await?;
        let (deleted, removed): (i64, i64) = redis::pipe()
            .del(&key)
            .zrem(BLOCK_IP_INDEX_KEY, client_ip)
            .query_async(&mut conn)
            .await?;

        self.push_event(BlockEvent {
            event_type: "unblock",
            ts_epoch: Utc::now().timestamp(),
            client_ip: client_ip.to_string(),
            block_id: None,
            reason_code: None,
            reason: None,
            expires_at_epoch: None,
            actor,
            deleted: Some(deleted > 0),
            removed_from_index: Some(removed > 0),
        })
        .await?;

        Ok((deleted > 0, removed > 0))
    }

    /// Scans active block keys up to `limit`, sorted by remaining TTL
    /// ascending with unknown TTLs last.
    pub async fn list(&self, limit: usize) -> Result<Vec<BlockedEntry>> {
        let mut conn = self.redis.conn().await?;
        let mut reader = conn.clone();

        let mut keys = Vec::new();
        {
            let mut iter = conn
                .scan_match::<_, String>(format!("{BLOCK_IP_PREFIX}*"))
                .await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
                if keys.len() >= limit {
                    break;
                }
            }
        }

        let mut blocked = Vec::with_capacity(keys.len());
        for key in keys {
            let client_ip = key
                .strip_prefix(BLOCK_IP_PREFIX)
                .unwrap_or(key.as_str())
                .to_string();
            let ttl: i64 = reader.ttl(&key).await?;
            let raw: Option<String> = reader.get(&key).await?;
            let meta = raw.as_deref().map(parse_block_value).unwrap_or_default();
            blocked.push(BlockedEntry {
                client_ip,
                ttl_seconds: (ttl > 0).then_some(ttl),
                block_id: meta.block_id,
                reason_code: meta.reason_code,
                reason: meta.reason,
                expires_at_epoch: meta.expires_at_epoch,
            });
        }

        sort_by_ttl(&mut blocked);
        Ok(blocked)
    }

    pub async fn details(&self, client_ip: &str) -> Result<Option<(BlockMeta, Option<i64>)>> {
        let key = block_key(client_ip);
        let mut conn = self.redis.conn().await?;
        let raw: Option<String> = conn.get(&key).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let ttl: i64 = conn.ttl(&key).await?;
        Ok(Some((parse_block_value(&raw), (ttl > 0).then_some(ttl))))
    }

    /// Walks index members whose expiry falls inside the lookback window
    /// (or later), classifying each as active, expired recently, or
    /// stale. Stale members are evicted before returning.
    pub async fn report(&self, lookback_minutes: i64, limit: usize) -> Result<BlocksReport> {
        let now_epoch = Utc::now().timestamp();
        let since_epoch = now_epoch - lookback_minutes * 60;

        let mut conn = self.redis.conn().await?;
        let mut ips: Vec<String> = conn
            .zrangebyscore(BLOCK_IP_INDEX_KEY, since_epoch, "+inf")
            .await?;
        ips.truncate(limit);

        let mut active = Vec::new();
        let mut expired_recently = Vec::new();
        let mut stale = Vec::new();

        for ip in ips {
            let key = block_key(&ip);
            let raw: Option<String> = conn.get(&key).await?;
            let ttl: i64 = conn.ttl(&key).await?;
            let score: Option<f64> = conn.zscore(BLOCK_IP_INDEX_KEY, &ip).await?;

            let Some(raw) = raw else {
                match score {
                    Some(expiry) if expiry as i64 >= since_epoch => {
                        expired_recently.push(ExpiredBlock {
                            client_ip: ip,
                            expired_at_epoch: expiry as i64,
                        });
                    }
                    _ => stale.push(ip),
                }
                continue;
            };

            let meta = parse_block_value(&raw);
            active.push(ActiveBlock {
                client_ip: ip,
                ttl_seconds: (ttl > 0).then_some(ttl),
                expires_at_epoch: meta.expires_at_epoch.or(score.map(|s| s as i64)),
                block_id: meta.block_id,
                reason_code: meta.reason_code,
                reason: meta.reason,
            });
        }

        let cleaned_stale = stale.len();
        if !stale.is_empty() {
            let _: i64 = conn.zrem(BLOCK_IP_INDEX_KEY, stale).await?;
        }

        active.sort_by_key(|entry| {
            (entry.ttl_seconds.is_none(), entry.ttl_seconds.unwrap_or(i64::MAX))
        });
        expired_recently.sort_by_key(|entry| std::cmp::Reverse(entry.expired_at_epoch));

        Ok(BlocksReport {
            now_epoch,
            active,
            expired_recently,
            cleaned_stale,
        })
    }

    /// Newest-first page of the event log; undecodable entries come back
    /// as `{event_type: "unknown", raw}`.
    pub async fn events(&self, limit: isize, offset: isize) -> Result<Vec<Value>> {
        let mut conn = self.redis.conn().await?;
        let items: Vec<String> = conn
            .lrange(BLOCK_EVENTS_KEY, offset, offset + limit - 1)
            .await?;
        Ok(items
            .into_iter()
            .map(|raw| {
                serde_json::from_str::<Value>(&raw)
                    .unwrap_or_else(|_| json!({ "event_type": "unknown", "raw": raw }))
            })
            .collect())
    }

    async fn push_event(&self, event: BlockEvent) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.redis.conn().await?;
        redis::pipe()
            .lpush(BLOCK_EVENTS_KEY, payload)
            .ignore()
            .ltrim(BLOCK_EVENTS_KEY, 0, (BLOCK_EVENTS_MAX - 1) as isize)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

fn block_key(client_ip: &str) -> String {
    format!("{BLOCK_IP_PREFIX}{client_ip}")
}

fn sort_by_ttl(blocked: &mut [BlockedEntry]) {
    blocked.sort_by_key(|entry| {
        (entry.ttl_seconds.is_none(), entry.ttl_seconds.unwrap_or(i64::MAX))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_block_values() {
        let raw = r#"{"block_id":"b-1","reason_code":"auto_unauth_401_surge","reason":"auto: unauth_401 surge","created_at_epoch":100,"expires_at_epoch":700}"#;
        let meta = parse_block_value(raw);
        assert_eq!(meta.block_id.as_deref(), Some("b-1"));
        assert_eq!(meta.reason_code, ReasonCode::AutoUnauth401Surge);
        assert_eq!(meta.reason.as_deref(), Some("auto: unauth_401 surge"));
        assert_eq!(meta.created_at_epoch, Some(100));
        assert_eq!(meta.expires_at_epoch, Some(700));
    }

    #[test]
    fn parses_legacy_plain_string_values() {
        let meta = parse_block_value("scraping our catalog");
        assert!(meta.block_id.is_none());
        assert_eq!(meta.reason_code, ReasonCode::Manual);
        assert_eq!(meta.reason.as_deref(), Some("scraping our catalog"));
        assert!(meta.expires_at_epoch.is_none());
    }

    #[test]
    fn malformed_json_falls_back_to_plain_reason() {
        let meta = parse_block_value("{not json at all");
        assert_eq!(meta.reason.as_deref(), Some("{not json at all"));
        assert_eq!(meta.reason_code, ReasonCode::Manual);
    }

    #[test]
    fn unknown_reason_codes_normalize_to_manual() {
        assert_eq!(ReasonCode::normalize("one_click_suspects"), ReasonCode::OneClickSuspects);
        assert_eq!(ReasonCode::normalize("operator_action"), ReasonCode::OperatorAction);
        assert_eq!(ReasonCode::normalize("totally-made-up"), ReasonCode::Manual);
        assert_eq!(ReasonCode::normalize(""), ReasonCode::Manual);
    }

    #[test]
    fn block_entry_round_trips_with_wire_field_names() {
        let entry = BlockEntry {
            block_id: "b-2".to_string(),
            reason_code: ReasonCode::OneClickSuspects,
            reason: "one-click: suspects".to_string(),
            created_at_epoch: 10,
            expires_at_epoch: 20,
        };
        let raw = serde_json::to_string(&entry).unwrap();
        assert!(raw.contains("\"reason_code\":\"one_click_suspects\""));
        let meta = parse_block_value(&raw);
        assert_eq!(meta.block_id.as_deref(), Some("b-2"));
        assert_eq!(meta.expires_at_epoch, Some(20));
    }

    #[test]
    fn block_events_serialize_actor_names() {
        let event = BlockEvent {
            event_type: "block",
            ts_epoch: 1,
            client_ip: "9.9.9.9".to_string(),
            block_id: Some("b-3".to_string()),
            reason_code: Some(ReasonCode::Manual),
            reason: Some("manual".to_string()),
            expires_at_epoch: Some(601),
            actor: BlockActor::AutoBlock,
            deleted: None,
            removed_from_index: None,
        };
        let raw = serde_json::to_string(&event).unwrap();
        assert!(raw.contains("\"actor\":\"auto_block\""));
        assert!(raw.contains("\"event_type\":\"block\""));
        assert!(!raw.contains("deleted"));
    }

    #[test]
    fn listing_sorts_by_ttl_with_unknowns_last() {
        let mut blocked = vec![
            entry("a", None),
            entry("b", Some(300)),
            entry("c", Some(30)),
        ];
        sort_by_ttl(&mut blocked);
        let order: Vec<&str> = blocked.iter().map(|b| b.client_ip.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    fn entry(ip: &str, ttl: Option<i64>) -> BlockedEntry {
        BlockedEntry {
            client_ip: ip.to_string(),
            ttl_seconds: ttl,
            block_id: None,
            reason_code: ReasonCode::Manual,
            reason: None,
            expires_at_epoch: None,
        }
    }
}
