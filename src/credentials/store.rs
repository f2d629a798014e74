//! Redis-backed credential persistence
//!
//! One hash per account under `<ns>:cookies:<uid>` with a 30-day TTL.
//! Overwrites are atomic (DEL + HSET + EXPIRE in one transaction) so a
//! re-login can never leave a half-written record, and at most one record
//! per uid exists at any instant.

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::error::{HarvestError, Result};
use crate::storage;

use super::record::CredentialRecord;

/// 30 days.
pub const CREDENTIAL_TTL_SECS: i64 = 2_592_000;

const FIELD_COOKIES: &str = "cookies";
const FIELD_FETCHED_AT: &str = "fetched_at";
const FIELD_VALIDATED_AT: &str = "validated_at";
const FIELD_DISPLAY_NAME: &str = "display_name";

/// Whether a save created a fresh record or replaced a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    Overwritten,
}

/// Result of a successful save.
#[derive(Debug, Clone)]
pub struct SaveReceipt {
    pub outcome: SaveOutcome,
    pub key: String,
}

/// Credential store over the shared Redis pool.
pub struct CredentialStore {
    pool: deadpool_redis::Pool,
    namespace: String,
}

impl CredentialStore {
    #[must_use]
    pub fn new(pool: deadpool_redis::Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    fn key(&self, uid: &str) -> String {
        format!("{}:cookies:{uid}", self.namespace)
    }

    fn key_prefix(&self) -> String {
        format!("{}:cookies:", self.namespace)
    }

    /// Persist a validated record, replacing any live record for the uid.
    ///
    /// The caller contract requires the record to have passed validation;
    /// the store re-checks structure only.
    pub async fn save(&self, record: &CredentialRecord) -> Result<SaveReceipt> {
        record.ensure_valid()?;
        let key = self.key(&record.uid);
        let cookies_json = serde_json::to_string(&record.cookies)?;

        let existed = storage::retrying("credential save", || {
            let key = key.clone();
            let cookies_json = cookies_json.clone();
            async move {
                let mut conn = self.pool.get().await?;
                let existed: bool = conn.exists(&key).await?;

                let mut pipe = redis::pipe();
                pipe.atomic()
                    .del(&key)
                    .ignore()
                    .hset(&key, FIELD_COOKIES, &cookies_json)
                    .ignore()
                    .hset(&key, FIELD_FETCHED_AT, record.fetched_at.to_rfc3339())
                    .ignore()
                    .hset(&key, FIELD_VALIDATED_AT, record.validated_at.to_rfc3339())
                    .ignore();
                if let Some(display_name) = &record.display_name {
                    pipe.hset(&key, FIELD_DISPLAY_NAME, display_name).ignore();
                }
                pipe.expire(&key, CREDENTIAL_TTL_SECS).ignore();
                let _: () = pipe.query_async(&mut conn).await?;

                Ok(existed)
            }
        })
        .await?;

        let outcome = if existed {
            SaveOutcome::Overwritten
        } else {
            SaveOutcome::Created
        };
        info!(uid = %record.uid, key = %key, ?outcome, "credential record saved");
        Ok(SaveReceipt { outcome, key })
    }

    /// Fetch the record for `uid`.
    pub async fn query(&self, uid: &str) -> Result<CredentialRecord> {
        let key = self.key(uid);
        let fields: Vec<(String, String)> = storage::retrying("credential query", || {
            let key = key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                Ok(conn.hgetall(&key).await?)
            }
        })
        .await?;

        if fields.is_empty() {
            return Err(HarvestError::CredentialNotFound(uid.to_string()));
        }

        let mut cookies_json = None;
        let mut fetched_at = None;
        let mut validated_at = None;
        let mut display_name = None;
        for (field, value) in fields {
            match field.as_str() {
                FIELD_COOKIES => cookies_json = Some(value),
                FIELD_FETCHED_AT => fetched_at = Some(value),
                FIELD_VALIDATED_AT => validated_at = Some(value),
                FIELD_DISPLAY_NAME => display_name = Some(value),
                _ => {}
            }
        }

        let cookies = serde_json::from_str(&cookies_json.ok_or_else(|| {
            HarvestError::Serialization(format!("record {key} missing cookies field"))
        })?)?;

        Ok(CredentialRecord {
            uid: uid.to_string(),
            cookies,
            fetched_at: parse_timestamp(&key, FIELD_FETCHED_AT, fetched_at)?,
            validated_at: parse_timestamp(&key, FIELD_VALIDATED_AT, validated_at)?,
            display_name,
        })
    }

    /// All uids with a live record, by prefix scan.
    pub async fn list(&self) -> Result<Vec<String>> {
        let prefix = self.key_prefix();
        let pattern = format!("{prefix}*");

        let keys: Vec<String> = storage::retrying("credential list", || {
            let pattern = pattern.clone();
            async move {
                let mut conn = self.pool.get().await?;
                let mut iter = conn.scan_match::<_, String>(&pattern).await?;
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                Ok(keys)
            }
        })
        .await?;

        let mut uids: Vec<String> = keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        uids.sort();
        debug!(count = uids.len(), "listed credential uids");
        Ok(uids)
    }

    /// Remove the record for `uid`. Idempotent.
    pub async fn delete(&self, uid: &str) -> Result<()> {
        let key = self.key(uid);
        storage::retrying("credential delete", || {
            let key = key.clone();
            async move {
                let mut conn = self.pool.get().await?;
                let _: i64 = conn.del(&key).await?;
                Ok(())
            }
        })
        .await?;
        info!(uid, "credential record deleted");
        Ok(())
    }
}

fn parse_timestamp(
    key: &str,
    field: &str,
    value: Option<String>,
) -> Result<DateTime<Utc>> {
    let raw = value.ok_or_else(|| {
        HarvestError::Serialization(format!("record {key} missing {field} field"))
    })?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HarvestError::Serialization(format!("record {key} field {field}: {e}")))
}
