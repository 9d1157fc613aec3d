// SPDX-License-Identifier: MIT OR Apache-2.0
//! API keys and per-request usage rows.

use crate::types::{ApiKey, CreateKeyParams, CreatedKey, UsageEvent, UsageSummary};
use crate::{StoreError, parse_sql_timestamp, sql_timestamp};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqlitePool};
use tb_core::KeyType;

/// Default plaintext prefix for new keys.
pub const DEFAULT_KEY_PREFIX: &str = "tb_";

/// Mutable fields of a key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateKeyParams {
    /// New name, when present.
    #[serde(default)]
    pub name: Option<String>,
    /// New description, when present.
    #[serde(default)]
    pub description: Option<String>,
    /// New permission set, when present.
    #[serde(default)]
    pub permissions: Option<Vec<String>>,
    /// New metadata, when present.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl UpdateKeyParams {
    /// `true` when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.permissions.is_none()
            && self.metadata.is_none()
    }
}

/// Store of API keys and their audit rows.
#[derive(Debug, Clone)]
pub struct KeyStore {
    pool: SqlitePool,
}

impl KeyStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a key. The returned [`CreatedKey`] carries the plaintext; only
    /// its SHA-256 is stored.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn create(&self, params: CreateKeyParams) -> Result<CreatedKey, StoreError> {
        let now = tb_core::now_utc();
        let prefix = params.prefix.as_deref().unwrap_or(DEFAULT_KEY_PREFIX);
        let plaintext = tb_core::generate_key_plaintext(prefix);
        let key = ApiKey {
            id: tb_core::new_id(),
            key_hash: tb_core::sha256_hex(&plaintext),
            key_prefix: tb_core::key_prefix_of(&plaintext),
            key_type: params.key_type.unwrap_or(KeyType::Standard),
            name: params.name,
            description: params.description,
            created_at: now,
            last_used_at: None,
            expires_at: params
                .expires_in_days
                .map(|days| now + Duration::days(i64::from(days))),
            is_active: true,
            permissions: params
                .permissions
                .unwrap_or_else(tb_core::default_permissions),
            metadata: params.metadata,
        };

        let permissions_json = serde_json::to_string(&key.permissions)
            .map_err(|e| StoreError::InvalidRow {
                reason: e.to_string(),
            })?;
        let metadata_json = match &key.metadata {
            Some(v) => Some(serde_json::to_string(v).map_err(|e| StoreError::InvalidRow {
                reason: e.to_string(),
            })?),
            None => None,
        };

        sqlx::query(
            "INSERT INTO api_keys
             (id, key_hash, key_prefix, key_type, name, description, created_at,
              expires_at, is_active, permissions, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&key.id)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(key.key_type.as_str())
        .bind(&key.name)
        .bind(&key.description)
        .bind(sql_timestamp(key.created_at))
        .bind(key.expires_at.map(sql_timestamp))
        .bind(&permissions_json)
        .bind(&metadata_json)
        .execute(&self.pool)
        .await?;

        Ok(CreatedKey { key, plaintext })
    }

    /// Look up a key by plaintext. Returns `None` when the hash is unknown
    /// or the key has been revoked; expiry is the caller's check (it needs
    /// the distinction for its 403 message).
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn find_by_plaintext(&self, plaintext: &str) -> Result<Option<ApiKey>, StoreError> {
        let hash = tb_core::sha256_hex(plaintext);
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_hash = ? AND is_active = 1")
            .bind(&hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| key_from_row(&r)).transpose()
    }

    /// Fetch one key by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn get(&self, id: &str) -> Result<ApiKey, StoreError> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("api key"))?;
        key_from_row(&row)
    }

    /// Page through keys, newest first. Returns the page and the total count
    /// under the same filter.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn list(
        &self,
        limit: u32,
        offset: u32,
        include_inactive: bool,
    ) -> Result<(Vec<ApiKey>, u64), StoreError> {
        let filter = if include_inactive { "" } else { "WHERE is_active = 1" };
        let rows = sqlx::query(&format!(
            "SELECT * FROM api_keys {filter} ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM api_keys {filter}"))
            .fetch_one(&self.pool)
            .await?;

        let keys = rows
            .iter()
            .map(key_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((keys, total as u64))
    }

    /// Apply the set fields of `params` to a key and return the new row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn update(&self, id: &str, params: UpdateKeyParams) -> Result<ApiKey, StoreError> {
        // Read-modify-write keeps the unset fields intact without dynamic SQL.
        let mut key = self.get(id).await?;
        if let Some(name) = params.name {
            key.name = name;
        }
        if let Some(description) = params.description {
            key.description = Some(description);
        }
        if let Some(permissions) = params.permissions {
            key.permissions = permissions;
        }
        if let Some(metadata) = params.metadata {
            key.metadata = Some(metadata);
        }

        let permissions_json = serde_json::to_string(&key.permissions)
            .map_err(|e| StoreError::InvalidRow {
                reason: e.to_string(),
            })?;
        let metadata_json = match &key.metadata {
            Some(v) => Some(serde_json::to_string(v).map_err(|e| StoreError::InvalidRow {
                reason: e.to_string(),
            })?),
            None => None,
        };

        sqlx::query(
            "UPDATE api_keys SET name = ?, description = ?, permissions = ?, metadata = ?
             WHERE id = ?",
        )
        .bind(&key.name)
        .bind(&key.description)
        .bind(&permissions_json)
        .bind(&metadata_json)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(key)
    }

    /// Stamp `last_used_at` with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn touch_last_used(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(sql_timestamp(tb_core::now_utc()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft-revoke a key (`is_active = false`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn revoke(&self, id: &str) -> Result<ApiKey, StoreError> {
        let result = sqlx::query("UPDATE api_keys SET is_active = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("api key"));
        }
        self.get(id).await
    }

    /// Hard-delete a key. Cascades its usage rows, account, usage records,
    /// and transactions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("api key"));
        }
        Ok(())
    }

    /// Append one audit row.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn record_usage(&self, event: UsageEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO api_key_usage
             (id, key_id, endpoint, method, status_code, timestamp, ip, user_agent)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tb_core::new_id())
        .bind(&event.key_id)
        .bind(&event.endpoint)
        .bind(&event.method)
        .bind(i64::from(event.status_code))
        .bind(sql_timestamp(tb_core::now_utc()))
        .bind(&event.ip)
        .bind(&event.user_agent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Aggregate a key's audit rows, optionally bounded to `since`.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn usage_summary(
        &self,
        key_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<UsageSummary, StoreError> {
        let since = since.map(sql_timestamp).unwrap_or_default();
        let row = sqlx::query(
            "SELECT
               COUNT(*)                                        AS total,
               COALESCE(SUM(CASE WHEN status_code < 400 THEN 1 ELSE 0 END), 0) AS ok,
               MAX(timestamp)                                  AS last_used
             FROM api_key_usage
             WHERE key_id = ? AND timestamp >= ?",
        )
        .bind(key_id)
        .bind(&since)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let ok: i64 = row.try_get("ok")?;
        let last_used: Option<String> = row.try_get("last_used")?;
        Ok(UsageSummary {
            total_requests: total as u64,
            success_rate: if total > 0 {
                ok as f64 / total as f64
            } else {
                0.0
            },
            last_used: last_used
                .as_deref()
                .map(parse_sql_timestamp)
                .transpose()?,
        })
    }

    /// Number of active keys, for startup checks and `/health`.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn count_active(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_keys WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

fn key_from_row(row: &SqliteRow) -> Result<ApiKey, StoreError> {
    let key_type_s: String = row.try_get("key_type")?;
    let key_type = KeyType::parse(&key_type_s).ok_or_else(|| StoreError::InvalidRow {
        reason: format!("bad key_type {key_type_s:?}"),
    })?;
    let permissions_s: String = row.try_get("permissions")?;
    let permissions =
        serde_json::from_str(&permissions_s).map_err(|e| StoreError::InvalidRow {
            reason: format!("bad permissions: {e}"),
        })?;
    let metadata_s: Option<String> = row.try_get("metadata")?;
    let metadata = metadata_s
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| StoreError::InvalidRow {
            reason: format!("bad metadata: {e}"),
        })?;

    let created_at: String = row.try_get("created_at")?;
    let last_used_at: Option<String> = row.try_get("last_used_at")?;
    let expires_at: Option<String> = row.try_get("expires_at")?;

    Ok(ApiKey {
        id: row.try_get("id")?,
        key_hash: row.try_get("key_hash")?,
        key_prefix: row.try_get("key_prefix")?,
        key_type,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: parse_sql_timestamp(&created_at)?,
        last_used_at: last_used_at.as_deref().map(parse_sql_timestamp).transpose()?,
        expires_at: expires_at.as_deref().map(parse_sql_timestamp).transpose()?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        permissions,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn params(name: &str) -> CreateKeyParams {
        CreateKeyParams {
            name: name.into(),
            description: None,
            key_type: None,
            prefix: None,
            expires_in_days: None,
            permissions: None,
            metadata: None,
        }
    }

    async fn store() -> Store {
        Store::connect_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn create_then_find_by_plaintext() {
        let keys = store().await.keys();
        let created = keys.create(params("ci")).await.unwrap();
        assert!(created.plaintext.starts_with("tb_"));
        assert_eq!(created.key.key_prefix, created.plaintext[..8].to_string());

        let found = keys
            .find_by_plaintext(&created.plaintext)
            .await
            .unwrap()
            .expect("key should be found");
        assert_eq!(found.id, created.key.id);
        assert_eq!(found.key_type, KeyType::Standard);
        assert_eq!(found.permissions, tb_core::default_permissions());
    }

    #[tokio::test]
    async fn find_with_wrong_plaintext_misses() {
        let keys = store().await.keys();
        keys.create(params("a")).await.unwrap();
        assert!(
            keys.find_by_plaintext("tb_0000000000000000000000000000000000000000000000000000000000000000")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn revoked_key_is_not_found_by_plaintext() {
        let keys = store().await.keys();
        let created = keys.create(params("r")).await.unwrap();
        keys.revoke(&created.key.id).await.unwrap();
        assert!(
            keys.find_by_plaintext(&created.plaintext)
                .await
                .unwrap()
                .is_none()
        );
        // Still visible by id, flagged inactive.
        let row = keys.get(&created.key.id).await.unwrap();
        assert!(!row.is_active);
    }

    #[tokio::test]
    async fn expiry_is_stored_and_checked() {
        let keys = store().await.keys();
        let created = keys
            .create(CreateKeyParams {
                expires_in_days: Some(30),
                ..params("exp")
            })
            .await
            .unwrap();
        let key = keys.get(&created.key.id).await.unwrap();
        let exp = key.expires_at.expect("expiry set");
        assert!(exp > Utc::now() + Duration::days(29));
        assert!(key.is_usable(Utc::now()));
        assert!(!key.is_usable(exp + Duration::seconds(1)));
    }

    #[tokio::test]
    async fn list_pages_and_counts() {
        let keys = store().await.keys();
        for i in 0..5 {
            keys.create(params(&format!("k{i}"))).await.unwrap();
        }
        let (page, total) = keys.list(2, 0, true).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(total, 5);

        let created = keys.create(params("extra")).await.unwrap();
        keys.revoke(&created.key.id).await.unwrap();
        let (_, active_total) = keys.list(10, 0, false).await.unwrap();
        assert_eq!(active_total, 5);
        let (_, all_total) = keys.list(10, 0, true).await.unwrap();
        assert_eq!(all_total, 6);
    }

    #[tokio::test]
    async fn update_only_touches_set_fields() {
        let keys = store().await.keys();
        let created = keys.create(params("orig")).await.unwrap();
        let updated = keys
            .update(
                &created.key.id,
                UpdateKeyParams {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.permissions, tb_core::default_permissions());
    }

    #[tokio::test]
    async fn delete_is_hard_and_cascades_usage() {
        let keys = store().await.keys();
        let created = keys.create(params("gone")).await.unwrap();
        keys.record_usage(UsageEvent {
            key_id: created.key.id.clone(),
            endpoint: "/execute".into(),
            method: "POST".into(),
            status_code: 200,
            ip: None,
            user_agent: None,
        })
        .await
        .unwrap();
        keys.delete(&created.key.id).await.unwrap();
        assert!(matches!(
            keys.get(&created.key.id).await,
            Err(StoreError::NotFound { .. })
        ));
        let summary = keys.usage_summary(&created.key.id, None).await.unwrap();
        assert_eq!(summary.total_requests, 0);
    }

    #[tokio::test]
    async fn usage_summary_computes_success_rate() {
        let keys = store().await.keys();
        let created = keys.create(params("s")).await.unwrap();
        for status in [200u16, 200, 404, 500] {
            keys.record_usage(UsageEvent {
                key_id: created.key.id.clone(),
                endpoint: "/execute".into(),
                method: "POST".into(),
                status_code: status,
                ip: Some("10.0.0.1".into()),
                user_agent: Some("test".into()),
            })
            .await
            .unwrap();
        }
        let summary = keys.usage_summary(&created.key.id, None).await.unwrap();
        assert_eq!(summary.total_requests, 4);
        assert!((summary.success_rate - 0.5).abs() < f64::EPSILON);
        assert!(summary.last_used.is_some());
    }

    #[tokio::test]
    async fn touch_last_used_stamps_now() {
        let keys = store().await.keys();
        let created = keys.create(params("t")).await.unwrap();
        assert!(created.key.last_used_at.is_none());
        keys.touch_last_used(&created.key.id).await.unwrap();
        let key = keys.get(&created.key.id).await.unwrap();
        assert!(key.last_used_at.is_some());
    }

    #[tokio::test]
    async fn revoke_unknown_key_is_not_found() {
        let keys = store().await.keys();
        assert!(matches!(
            keys.revoke("missing").await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
