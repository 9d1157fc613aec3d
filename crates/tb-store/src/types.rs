// SPDX-License-Identifier: MIT OR Apache-2.0
//! Row types shared by the key and billing stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tb_core::{KeyType, TransactionType};

/// A stored API key. The plaintext exists only inside [`CreatedKey`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Key identifier (UUIDv4).
    pub id: String,
    /// SHA-256 hex of the plaintext.
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// First ≤ 8 characters of the plaintext, for display.
    pub key_prefix: String,
    /// Whether use of this key is priced.
    pub key_type: KeyType,
    /// Operator-assigned name.
    pub name: String,
    /// Optional free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful authentication, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Expiry time; `None` means the key never expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// `false` once revoked. Revocation is soft.
    pub is_active: bool,
    /// Permission strings (default `execute`, `read`, `write`).
    pub permissions: Vec<String>,
    /// Free-form operator metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ApiKey {
    /// A key is usable iff it is active and unexpired.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|exp| now < exp)
    }
}

/// Result of [`crate::KeyStore::create`]: the stored row plus the plaintext,
/// which is returned exactly once.
#[derive(Debug, Clone)]
pub struct CreatedKey {
    /// The stored key row.
    pub key: ApiKey,
    /// The plaintext credential. Unrecoverable after this value is dropped.
    pub plaintext: String,
}

/// Parameters for creating a key.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateKeyParams {
    /// Operator-assigned name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Key type; defaults to `standard`.
    #[serde(default)]
    pub key_type: Option<KeyType>,
    /// Plaintext prefix; defaults to `tb_`.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Days until expiry; `None` means no expiry.
    #[serde(default)]
    pub expires_in_days: Option<u32>,
    /// Permission strings; defaults to `execute`, `read`, `write`.
    #[serde(default)]
    pub permissions: Option<Vec<String>>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// One authenticated request, for the audit log.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    /// Key that made the request.
    pub key_id: String,
    /// Request path.
    pub endpoint: String,
    /// HTTP method.
    pub method: String,
    /// Response status.
    pub status_code: u16,
    /// Caller IP, when known.
    pub ip: Option<String>,
    /// Caller user agent, when known.
    pub user_agent: Option<String>,
}

/// Aggregate over a key's audit rows.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    /// Number of requests in the window.
    pub total_requests: u64,
    /// Fraction of requests with `status_code < 400` (0 when no requests).
    pub success_rate: f64,
    /// Timestamp of the newest audit row, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

/// Outcome column of a usage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The engine returned a result.
    Success,
    /// The engine failed after reporting token counts.
    Error,
}

impl RunStatus {
    /// Stable string form used in SQL.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Input to [`crate::BillingStore::record_usage`].
#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    /// Key the task ran under.
    pub api_key_id: String,
    /// Session id, when the caller supplied or received one.
    pub session_id: Option<String>,
    /// Workspace the task ran against.
    pub workspace_id: String,
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Completion-side tokens.
    pub output_tokens: u64,
    /// Cost attributed to input tokens.
    pub input_cost: f64,
    /// Cost attributed to output tokens.
    pub output_cost: f64,
    /// Model the engine reported.
    pub model: String,
    /// Wall-clock duration of the turn.
    pub duration_ms: u64,
    /// Outcome of the turn.
    pub status: RunStatus,
    /// Endpoint that produced the record.
    pub endpoint: String,
}

/// One row per executed task for a standard key.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    /// Record identifier.
    pub id: String,
    /// Key the task ran under.
    pub api_key_id: String,
    /// Session id, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Workspace the task ran against.
    pub workspace_id: String,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Completion-side tokens.
    pub output_tokens: u64,
    /// `input + output`.
    pub total_tokens: u64,
    /// Cost attributed to input tokens.
    pub input_cost: f64,
    /// Cost attributed to output tokens.
    pub output_cost: f64,
    /// `input_cost + output_cost`.
    pub total_cost: f64,
    /// Model the engine reported.
    pub model: String,
    /// Wall-clock duration of the turn.
    pub duration_ms: u64,
    /// Outcome of the turn.
    pub status: RunStatus,
    /// Endpoint that produced the record.
    pub endpoint: String,
}

/// One billing account, 1:1 with an API key.
#[derive(Debug, Clone, Serialize)]
pub struct BillingAccount {
    /// Account identifier.
    pub id: String,
    /// Owning key.
    pub api_key_id: String,
    /// Remaining prepaid credits. May dip slightly negative under the
    /// pre-flight/post-flight race.
    pub credits_balance: f64,
    /// Lifetime spend.
    pub total_spent: f64,
    /// Daily spend cap, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<f64>,
    /// Monthly spend cap, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_limit: Option<f64>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// One balance change.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    /// Transaction identifier.
    pub id: String,
    /// Owning key.
    pub api_key_id: String,
    /// Kind of change.
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    /// Signed amount: positive adds credits, negative subtracts.
    pub amount: f64,
    /// Account balance immediately after this change.
    pub balance_after: f64,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// When the change was applied.
    pub timestamp: DateTime<Utc>,
}

/// Result of a spending-limit check.
#[derive(Debug, Clone, Serialize)]
pub struct LimitCheck {
    /// `true` when no cap has been reached.
    pub within: bool,
    /// Cost accumulated in the current UTC day.
    pub daily_usage: f64,
    /// Cost accumulated in the current UTC month.
    pub monthly_usage: f64,
    /// Daily cap, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<f64>,
    /// Monthly cap, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_limit: Option<f64>,
    /// Which cap was hit, when `within` is `false`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Aggregated usage over a time range.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    /// Number of usage records in the range.
    pub total_executions: u64,
    /// Summed input tokens.
    pub input_tokens: u64,
    /// Summed output tokens.
    pub output_tokens: u64,
    /// Summed total tokens.
    pub total_tokens: u64,
    /// Summed cost.
    pub total_cost: f64,
    /// Average turn duration in milliseconds (0 when no records).
    pub avg_duration_ms: u64,
}

/// Per-workspace roll-up of a key's usage.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceUsage {
    /// Workspace identifier.
    pub workspace_id: String,
    /// Number of executed tasks.
    pub executions: u64,
    /// Summed total tokens.
    pub total_tokens: u64,
    /// Summed cost.
    pub total_cost: f64,
    /// Newest record timestamp for this workspace.
    pub last_used: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_requires_active_and_unexpired() {
        let now = Utc::now();
        let mut key = ApiKey {
            id: "k".into(),
            key_hash: "h".into(),
            key_prefix: "tb_".into(),
            key_type: KeyType::Standard,
            name: "n".into(),
            description: None,
            created_at: now,
            last_used_at: None,
            expires_at: None,
            is_active: true,
            permissions: tb_core::default_permissions(),
            metadata: None,
        };
        assert!(key.is_usable(now));

        key.expires_at = Some(now + chrono::Duration::hours(1));
        assert!(key.is_usable(now));

        key.expires_at = Some(now - chrono::Duration::hours(1));
        assert!(!key.is_usable(now));

        key.expires_at = None;
        key.is_active = false;
        assert!(!key.is_usable(now));
    }

    #[test]
    fn key_hash_never_serialises() {
        let key = ApiKey {
            id: "k".into(),
            key_hash: "secret-hash".into(),
            key_prefix: "tb_".into(),
            key_type: KeyType::Standard,
            name: "n".into(),
            description: None,
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: None,
            is_active: true,
            permissions: vec![],
            metadata: None,
        };
        let json = serde_json::to_string(&key).unwrap();
        assert!(!json.contains("secret-hash"));
    }

    #[test]
    fn transaction_serialises_type_field() {
        let tx = Transaction {
            id: "t".into(),
            api_key_id: "k".into(),
            tx_type: TransactionType::UsageDeduction,
            amount: -0.10308,
            balance_after: 9.89692,
            description: None,
            metadata: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains(r#""type":"usage_deduction""#));
    }
}
