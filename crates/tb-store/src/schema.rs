// SPDX-License-Identifier: MIT OR Apache-2.0
//! Schema bootstrap.
//!
//! Five tables, all keyed (directly or via cascade) on `api_keys.id`.
//! Every statement is idempotent so [`apply`] can run at each startup.

use crate::StoreError;
use sqlx::SqlitePool;

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS api_keys (
        id           TEXT PRIMARY KEY,
        key_hash     TEXT NOT NULL UNIQUE,
        key_prefix   TEXT NOT NULL,
        key_type     TEXT NOT NULL DEFAULT 'standard'
                     CHECK (key_type IN ('standard', 'internal')),
        name         TEXT NOT NULL,
        description  TEXT,
        created_at   TEXT NOT NULL,
        last_used_at TEXT,
        expires_at   TEXT,
        is_active    INTEGER NOT NULL DEFAULT 1,
        permissions  TEXT NOT NULL,
        metadata     TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_api_keys_key_hash ON api_keys (key_hash)",
    "CREATE INDEX IF NOT EXISTS idx_api_keys_is_active ON api_keys (is_active)",
    "CREATE INDEX IF NOT EXISTS idx_api_keys_key_type ON api_keys (key_type)",
    "CREATE TABLE IF NOT EXISTS api_key_usage (
        id          TEXT PRIMARY KEY,
        key_id      TEXT NOT NULL REFERENCES api_keys (id) ON DELETE CASCADE,
        endpoint    TEXT NOT NULL,
        method      TEXT NOT NULL,
        status_code INTEGER NOT NULL,
        timestamp   TEXT NOT NULL,
        ip          TEXT,
        user_agent  TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_api_key_usage_key_ts
        ON api_key_usage (key_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS usage_records (
        id            TEXT PRIMARY KEY,
        api_key_id    TEXT NOT NULL REFERENCES api_keys (id) ON DELETE CASCADE,
        session_id    TEXT,
        workspace_id  TEXT NOT NULL,
        timestamp     TEXT NOT NULL,
        input_tokens  INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        total_tokens  INTEGER NOT NULL,
        input_cost    REAL NOT NULL,
        output_cost   REAL NOT NULL,
        total_cost    REAL NOT NULL,
        model         TEXT NOT NULL,
        duration_ms   INTEGER NOT NULL,
        status        TEXT NOT NULL CHECK (status IN ('success', 'error')),
        endpoint      TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_usage_records_key_ts
        ON usage_records (api_key_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_usage_records_workspace
        ON usage_records (workspace_id)",
    "CREATE TABLE IF NOT EXISTS billing_accounts (
        id              TEXT PRIMARY KEY,
        api_key_id      TEXT NOT NULL UNIQUE REFERENCES api_keys (id) ON DELETE CASCADE,
        credits_balance REAL NOT NULL DEFAULT 0,
        total_spent     REAL NOT NULL DEFAULT 0,
        daily_limit     REAL,
        monthly_limit   REAL,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transactions (
        id            TEXT PRIMARY KEY,
        api_key_id    TEXT NOT NULL REFERENCES api_keys (id) ON DELETE CASCADE,
        type          TEXT NOT NULL
                      CHECK (type IN ('credit_purchase', 'usage_deduction',
                                      'credit_adjustment', 'refund')),
        amount        REAL NOT NULL,
        balance_after REAL NOT NULL,
        description   TEXT,
        metadata      TEXT,
        timestamp     TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_transactions_key_ts
        ON transactions (api_key_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_type ON transactions (type)",
];

/// Create every table and index that does not already exist.
///
/// # Errors
///
/// Returns the first SQL error encountered.
pub async fn apply(pool: &SqlitePool) -> Result<(), StoreError> {
    for stmt in STATEMENTS {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row as _;

    #[tokio::test]
    async fn all_five_tables_exist_after_apply() {
        let store = crate::Store::connect_in_memory().await.unwrap();
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(store.keys().pool())
        .await
        .unwrap();
        let names: Vec<String> = rows
            .iter()
            .map(|r| r.try_get::<String, _>("name").unwrap())
            .collect();
        for table in [
            "api_keys",
            "api_key_usage",
            "billing_accounts",
            "transactions",
            "usage_records",
        ] {
            assert!(names.iter().any(|n| n == table), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn key_hash_is_unique() {
        let store = crate::Store::connect_in_memory().await.unwrap();
        let insert = "INSERT INTO api_keys
            (id, key_hash, key_prefix, key_type, name, created_at, permissions)
            VALUES (?, 'h', 'tb_', 'standard', 'n', '2026-01-01T00:00:00.000000Z', '[]')";
        sqlx::query(insert)
            .bind("a")
            .execute(store.keys().pool())
            .await
            .unwrap();
        let dup = sqlx::query(insert)
            .bind("b")
            .execute(store.keys().pool())
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn deleting_a_key_cascades() {
        let store = crate::Store::connect_in_memory().await.unwrap();
        let pool = store.keys().pool().clone();
        sqlx::query(
            "INSERT INTO api_keys
             (id, key_hash, key_prefix, key_type, name, created_at, permissions)
             VALUES ('k1', 'h1', 'tb_', 'standard', 'n', '2026-01-01T00:00:00.000000Z', '[]')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO api_key_usage
             (id, key_id, endpoint, method, status_code, timestamp)
             VALUES ('u1', 'k1', '/execute', 'POST', 200, '2026-01-01T00:00:00.000000Z')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("DELETE FROM api_keys WHERE id = 'k1'")
            .execute(&pool)
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_key_usage")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
