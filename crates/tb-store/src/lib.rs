// SPDX-License-Identifier: MIT OR Apache-2.0
//! tb-store
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! API-key and billing persistence on SQLite.
//!
//! One [`Store`] owns the pool; [`KeyStore`] and [`BillingStore`] are cheap
//! clones over it. The schema is bootstrapped idempotently at connect time.
//! The only multi-statement write path is [`BillingStore::deduct_usage`],
//! which mutates the account row and appends the paired transaction inside
//! one SQL transaction so `balance_after` always reflects the real balance.

/// Billing accounts, usage records, transactions, limits.
pub mod billing;
/// API keys and per-request usage rows.
pub mod keys;
/// Schema bootstrap.
pub mod schema;
/// Row types shared by both stores.
pub mod types;

pub use billing::BillingStore;
pub use keys::KeyStore;
pub use types::{
    ApiKey, BillingAccount, CreateKeyParams, CreatedKey, LimitCheck, NewUsageRecord, RunStatus,
    Transaction, UsageEvent, UsageRecord, UsageStats, UsageSummary, WorkspaceUsage,
};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// Errors surfaced by the key and billing stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying SQL engine failed.
    #[error("database error")]
    Sqlx(#[from] sqlx::Error),

    /// The requested row does not exist.
    #[error("{what} not found")]
    NotFound {
        /// Human-readable name of the missing resource.
        what: String,
    },

    /// A stored row could not be decoded.
    #[error("corrupt row: {reason}")]
    InvalidRow {
        /// What failed to decode.
        reason: String,
    },
}

impl StoreError {
    /// Shorthand for [`StoreError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

/// Shared handle to the SQLite database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and bootstrap the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be
    /// applied.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        schema::apply(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an in-memory database (single connection, since each SQLite
    /// `:memory:` connection is its own database).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        schema::apply(&pool).await?;
        Ok(Self { pool })
    }

    /// The key half of the store.
    #[must_use]
    pub fn keys(&self) -> KeyStore {
        KeyStore::new(self.pool.clone())
    }

    /// The billing half of the store.
    #[must_use]
    pub fn billing(&self) -> BillingStore {
        BillingStore::new(self.pool.clone())
    }

    /// Cheap liveness probe for startup checks and `/health`.
    ///
    /// # Errors
    ///
    /// Returns an error when the database is unreachable.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Render a timestamp in the fixed-width RFC 3339 form stored in SQL.
///
/// Fixed microsecond precision keeps lexicographic and chronological order
/// identical, which the window queries rely on.
#[must_use]
pub fn sql_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp previously written by [`sql_timestamp`].
///
/// # Errors
///
/// Returns [`StoreError::InvalidRow`] when the text is not RFC 3339.
pub fn parse_sql_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidRow {
            reason: format!("bad timestamp {s:?}"),
        })
}
