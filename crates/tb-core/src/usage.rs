// SPDX-License-Identifier: MIT OR Apache-2.0
//! Token counts and the billing vocabulary shared across crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Token counts for one executed turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt side.
    pub input_tokens: u64,
    /// Tokens produced by the completion side.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Combined token count.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// `true` when the engine reported no tokens at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Whether a key's use is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Priced and bounded by a billing account.
    Standard,
    /// Operational key exempt from pricing, limits, and usage recording.
    Internal,
}

impl KeyType {
    /// Stable string form used in SQL and on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Internal => "internal",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Self::Standard),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of balance change recorded in the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Credits added by an operator purchase.
    CreditPurchase,
    /// Credits consumed by an executed task.
    UsageDeduction,
    /// Manual correction (either sign).
    CreditAdjustment,
    /// Credits returned for a disputed charge.
    Refund,
}

impl TransactionType {
    /// Stable string form used in SQL and on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreditPurchase => "credit_purchase",
            Self::UsageDeduction => "usage_deduction",
            Self::CreditAdjustment => "credit_adjustment",
            Self::Refund => "refund",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credit_purchase" => Some(Self::CreditPurchase),
            "usage_deduction" => Some(Self::UsageDeduction),
            "credit_adjustment" => Some(Self::CreditAdjustment),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
