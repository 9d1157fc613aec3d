// SPDX-License-Identifier: MIT OR Apache-2.0
//! Billing accounts, usage records, transactions, and limit checks.
//!
//! Invariants the write paths maintain, to 6-decimal precision:
//! - Σ `transactions.amount` per key equals `billing_accounts.credits_balance`
//! - Σ `max(0, −transactions.amount)` per key equals `total_spent`
//! - every `usage_deduction` row's `balance_after` is the real balance at
//!   the moment of commit (account mutation and row insert share one SQL
//!   transaction)

use crate::types::{
    BillingAccount, LimitCheck, NewUsageRecord, RunStatus, Transaction, UsageRecord, UsageStats,
    WorkspaceUsage,
};
use crate::{StoreError, parse_sql_timestamp, sql_timestamp};
use chrono::{DateTime, Datelike, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqlitePool};
use tb_core::{TransactionType, round6};

/// Store of billing accounts and their usage/transaction logs.
#[derive(Debug, Clone)]
pub struct BillingStore {
    pool: SqlitePool,
}

impl BillingStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch a key's account, creating a zero-balance one on first access.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails (including a foreign-key
    /// failure for unknown keys).
    pub async fn get_or_create_account(&self, key_id: &str) -> Result<BillingAccount, StoreError> {
        if let Some(row) = sqlx::query("SELECT * FROM billing_accounts WHERE api_key_id = ?")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?
        {
            return account_from_row(&row);
        }

        let now = sql_timestamp(tb_core::now_utc());
        // A concurrent creator may win the race; the UNIQUE constraint makes
        // that harmless and the re-read below returns the winner's row.
        let _ = sqlx::query(
            "INSERT OR IGNORE INTO billing_accounts
             (id, api_key_id, credits_balance, total_spent, created_at, updated_at)
             VALUES (?, ?, 0, 0, ?, ?)",
        )
        .bind(tb_core::new_id())
        .bind(key_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM billing_accounts WHERE api_key_id = ?")
            .bind(key_id)
            .fetch_one(&self.pool)
            .await?;
        account_from_row(&row)
    }

    /// Append one usage record.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn record_usage(&self, rec: NewUsageRecord) -> Result<UsageRecord, StoreError> {
        let record = UsageRecord {
            id: tb_core::new_id(),
            api_key_id: rec.api_key_id,
            session_id: rec.session_id,
            workspace_id: rec.workspace_id,
            timestamp: tb_core::now_utc(),
            input_tokens: rec.input_tokens,
            output_tokens: rec.output_tokens,
            total_tokens: rec.input_tokens + rec.output_tokens,
            input_cost: round6(rec.input_cost),
            output_cost: round6(rec.output_cost),
            total_cost: round6(rec.input_cost + rec.output_cost),
            model: rec.model,
            duration_ms: rec.duration_ms,
            status: rec.status,
            endpoint: rec.endpoint,
        };

        sqlx::query(
            "INSERT INTO usage_records
             (id, api_key_id, session_id, workspace_id, timestamp,
              input_tokens, output_tokens, total_tokens,
              input_cost, output_cost, total_cost,
              model, duration_ms, status, endpoint)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.api_key_id)
        .bind(&record.session_id)
        .bind(&record.workspace_id)
        .bind(sql_timestamp(record.timestamp))
        .bind(record.input_tokens as i64)
        .bind(record.output_tokens as i64)
        .bind(record.total_tokens as i64)
        .bind(record.input_cost)
        .bind(record.output_cost)
        .bind(record.total_cost)
        .bind(&record.model)
        .bind(record.duration_ms as i64)
        .bind(record.status.as_str())
        .bind(&record.endpoint)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    /// Deduct `cost` from a key's balance and append the paired
    /// `usage_deduction` transaction, atomically.
    ///
    /// Returns the post-mutation account.
    ///
    /// # Errors
    ///
    /// Returns an error when the transaction cannot commit; the account is
    /// left untouched in that case.
    pub async fn deduct_usage(
        &self,
        key_id: &str,
        cost: f64,
        description: Option<&str>,
    ) -> Result<BillingAccount, StoreError> {
        let cost = round6(cost);
        self.apply_balance_change(
            key_id,
            -cost,
            cost,
            TransactionType::UsageDeduction,
            description,
        )
        .await
    }

    /// Apply a signed balance adjustment: positive amounts record a
    /// `credit_purchase`, negative ones a `credit_adjustment`. Negative
    /// amounts also count toward `total_spent` so the spend invariant holds.
    ///
    /// # Errors
    ///
    /// Returns an error when the transaction cannot commit.
    pub async fn adjust_balance(
        &self,
        key_id: &str,
        amount: f64,
        description: Option<&str>,
    ) -> Result<BillingAccount, StoreError> {
        let amount = round6(amount);
        let tx_type = if amount > 0.0 {
            TransactionType::CreditPurchase
        } else {
            TransactionType::CreditAdjustment
        };
        let spent_delta = if amount < 0.0 { -amount } else { 0.0 };
        self.apply_balance_change(key_id, amount, spent_delta, tx_type, description)
            .await
    }

    /// Atomic account mutation plus its paired transaction row.
    ///
    /// sqlx's `Transaction` API only issues a deferred `BEGIN`; this path
    /// must hold the write lock from the first statement through the
    /// post-mutation read, so the transaction is driven by hand with
    /// `BEGIN IMMEDIATE`. `amount` is the signed balance delta and is
    /// stamped into the transaction row verbatim.
    async fn apply_balance_change(
        &self,
        key_id: &str,
        amount: f64,
        spent_delta: f64,
        tx_type: TransactionType,
        description: Option<&str>,
    ) -> Result<BillingAccount, StoreError> {
        // Lazy creation happens outside the write transaction; the UNIQUE
        // constraint keeps it race-safe.
        self.get_or_create_account(key_id).await?;

        let now = sql_timestamp(tb_core::now_utc());
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let applied = async {
            sqlx::query(
                "UPDATE billing_accounts
                 SET credits_balance = ROUND(credits_balance + ?, 6),
                     total_spent = ROUND(total_spent + ?, 6),
                     updated_at = ?
                 WHERE api_key_id = ?",
            )
            .bind(amount)
            .bind(spent_delta)
            .bind(&now)
            .bind(key_id)
            .execute(&mut *conn)
            .await?;

            let row = sqlx::query("SELECT * FROM billing_accounts WHERE api_key_id = ?")
                .bind(key_id)
                .fetch_one(&mut *conn)
                .await?;
            let account = account_from_row(&row)?;

            sqlx::query(
                "INSERT INTO transactions
                 (id, api_key_id, type, amount, balance_after, description, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(tb_core::new_id())
            .bind(key_id)
            .bind(tx_type.as_str())
            .bind(amount)
            .bind(account.credits_balance)
            .bind(description)
            .bind(&now)
            .execute(&mut *conn)
            .await?;

            Ok::<_, StoreError>(account)
        }
        .await;

        match applied {
            Ok(account) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(account)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    /// Set (or clear) the daily and monthly spend caps.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn set_limits(
        &self,
        key_id: &str,
        daily_limit: Option<f64>,
        monthly_limit: Option<f64>,
    ) -> Result<BillingAccount, StoreError> {
        self.get_or_create_account(key_id).await?;
        sqlx::query(
            "UPDATE billing_accounts
             SET daily_limit = ?, monthly_limit = ?, updated_at = ?
             WHERE api_key_id = ?",
        )
        .bind(daily_limit.map(round6))
        .bind(monthly_limit.map(round6))
        .bind(sql_timestamp(tb_core::now_utc()))
        .bind(key_id)
        .execute(&self.pool)
        .await?;
        self.get_or_create_account(key_id).await
    }

    /// Check the key's cumulative spend against its caps.
    ///
    /// A cap is exceeded once cumulative cost is `>=` the cap, so the call
    /// that crosses the threshold is the last one admitted.
    ///
    /// # Errors
    ///
    /// Returns an error when a query fails.
    pub async fn check_limits(&self, key_id: &str) -> Result<LimitCheck, StoreError> {
        let account = self.get_or_create_account(key_id).await?;
        let now = tb_core::now_utc();

        let daily_usage = self.cost_since(key_id, start_of_day(now)).await?;
        let monthly_usage = self.cost_since(key_id, start_of_month(now)).await?;

        let mut reason = None;
        if let Some(limit) = account.daily_limit
            && daily_usage >= limit
        {
            reason = Some(format!(
                "daily limit reached: spent {daily_usage:.6} of {limit:.6}"
            ));
        } else if let Some(limit) = account.monthly_limit
            && monthly_usage >= limit
        {
            reason = Some(format!(
                "monthly limit reached: spent {monthly_usage:.6} of {limit:.6}"
            ));
        }

        Ok(LimitCheck {
            within: reason.is_none(),
            daily_usage,
            monthly_usage,
            daily_limit: account.daily_limit,
            monthly_limit: account.monthly_limit,
            reason,
        })
    }

    /// Aggregate usage records over an optional time range.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn usage_stats(
        &self,
        key_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<UsageStats, StoreError> {
        let from = from.map(sql_timestamp).unwrap_or_default();
        let to = to
            .map(sql_timestamp)
            .unwrap_or_else(|| "9999-12-31T23:59:59.999999Z".into());
        let row = sqlx::query(
            "SELECT
               COUNT(*)                       AS executions,
               COALESCE(SUM(input_tokens), 0)  AS input_tokens,
               COALESCE(SUM(output_tokens), 0) AS output_tokens,
               COALESCE(SUM(total_tokens), 0)  AS total_tokens,
               COALESCE(SUM(total_cost), 0.0)  AS total_cost,
               COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms
             FROM usage_records
             WHERE api_key_id = ? AND timestamp >= ? AND timestamp <= ?",
        )
        .bind(key_id)
        .bind(&from)
        .bind(&to)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageStats {
            total_executions: row.try_get::<i64, _>("executions")? as u64,
            input_tokens: row.try_get::<i64, _>("input_tokens")? as u64,
            output_tokens: row.try_get::<i64, _>("output_tokens")? as u64,
            total_tokens: row.try_get::<i64, _>("total_tokens")? as u64,
            total_cost: round6(row.try_get::<f64, _>("total_cost")?),
            avg_duration_ms: row.try_get::<f64, _>("avg_duration_ms")? as u64,
        })
    }

    /// Page through a key's usage records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn usage_records(
        &self,
        key_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM usage_records WHERE api_key_id = ?
             ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        )
        .bind(key_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Page through a key's transactions, newest first, optionally filtered
    /// by type.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn transactions(
        &self,
        key_id: &str,
        limit: u32,
        offset: u32,
        tx_type: Option<TransactionType>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = match tx_type {
            Some(t) => {
                sqlx::query(
                    "SELECT * FROM transactions WHERE api_key_id = ? AND type = ?
                     ORDER BY timestamp DESC LIMIT ? OFFSET ?",
                )
                .bind(key_id)
                .bind(t.as_str())
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM transactions WHERE api_key_id = ?
                     ORDER BY timestamp DESC LIMIT ? OFFSET ?",
                )
                .bind(key_id)
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(transaction_from_row).collect()
    }

    /// Roll a key's usage up per workspace.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn usage_by_workspace(
        &self,
        key_id: &str,
    ) -> Result<Vec<WorkspaceUsage>, StoreError> {
        let rows = sqlx::query(
            "SELECT workspace_id,
                    COUNT(*)                       AS executions,
                    COALESCE(SUM(total_tokens), 0) AS total_tokens,
                    COALESCE(SUM(total_cost), 0.0) AS total_cost,
                    MAX(timestamp)                 AS last_used
             FROM usage_records
             WHERE api_key_id = ?
             GROUP BY workspace_id
             ORDER BY last_used DESC",
        )
        .bind(key_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let last_used: String = row.try_get("last_used")?;
                Ok(WorkspaceUsage {
                    workspace_id: row.try_get("workspace_id")?,
                    executions: row.try_get::<i64, _>("executions")? as u64,
                    total_tokens: row.try_get::<i64, _>("total_tokens")? as u64,
                    total_cost: round6(row.try_get::<f64, _>("total_cost")?),
                    last_used: parse_sql_timestamp(&last_used)?,
                })
            })
            .collect()
    }

    async fn cost_since(&self, key_id: &str, since: DateTime<Utc>) -> Result<f64, StoreError> {
        let total: f64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(total_cost), 0.0) FROM usage_records
             WHERE api_key_id = ? AND timestamp >= ?",
        )
        .bind(key_id)
        .bind(sql_timestamp(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(round6(total))
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

fn account_from_row(row: &SqliteRow) -> Result<BillingAccount, StoreError> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(BillingAccount {
        id: row.try_get("id")?,
        api_key_id: row.try_get("api_key_id")?,
        credits_balance: row.try_get("credits_balance")?,
        total_spent: row.try_get("total_spent")?,
        daily_limit: row.try_get("daily_limit")?,
        monthly_limit: row.try_get("monthly_limit")?,
        created_at: parse_sql_timestamp(&created_at)?,
        updated_at: parse_sql_timestamp(&updated_at)?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<UsageRecord, StoreError> {
    let status_s: String = row.try_get("status")?;
    let status = RunStatus::parse(&status_s).ok_or_else(|| StoreError::InvalidRow {
        reason: format!("bad status {status_s:?}"),
    })?;
    let timestamp: String = row.try_get("timestamp")?;
    Ok(UsageRecord {
        id: row.try_get("id")?,
        api_key_id: row.try_get("api_key_id")?,
        session_id: row.try_get("session_id")?,
        workspace_id: row.try_get("workspace_id")?,
        timestamp: parse_sql_timestamp(&timestamp)?,
        input_tokens: row.try_get::<i64, _>("input_tokens")? as u64,
        output_tokens: row.try_get::<i64, _>("output_tokens")? as u64,
        total_tokens: row.try_get::<i64, _>("total_tokens")? as u64,
        input_cost: row.try_get("input_cost")?,
        output_cost: row.try_get("output_cost")?,
        total_cost: row.try_get("total_cost")?,
        model: row.try_get("model")?,
        duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
        status,
        endpoint: row.try_get("endpoint")?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<Transaction, StoreError> {
    let type_s: String = row.try_get("type")?;
    let tx_type = TransactionType::parse(&type_s).ok_or_else(|| StoreError::InvalidRow {
        reason: format!("bad transaction type {type_s:?}"),
    })?;
    let metadata_s: Option<String> = row.try_get("metadata")?;
    let metadata = metadata_s
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| StoreError::InvalidRow {
            reason: format!("bad metadata: {e}"),
        })?;
    let timestamp: String = row.try_get("timestamp")?;
    Ok(Transaction {
        id: row.try_get("id")?,
        api_key_id: row.try_get("api_key_id")?,
        tx_type,
        amount: row.try_get("amount")?,
        balance_after: row.try_get("balance_after")?,
        description: row.try_get("description")?,
        metadata,
        timestamp: parse_sql_timestamp(&timestamp)?,
    })
}
