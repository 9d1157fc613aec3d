// SPDX-License-Identifier: MIT OR Apache-2.0
//! tb-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable vocabulary of the control plane: identifiers, hashing, money
//! arithmetic, and the token-usage types every other crate speaks.

/// Identifier generation and validation.
pub mod ids;
/// Money arithmetic with deterministic 6-decimal rounding.
pub mod money;
/// Token counts and per-turn usage.
pub mod usage;

pub use ids::{generate_key_plaintext, key_prefix_of, new_id, sha256_hex, validate_relative_path, validate_resource_id};
pub use money::{CostBreakdown, Pricing, round6};
pub use usage::{KeyType, TokenUsage, TransactionType};

use chrono::{DateTime, Utc};

/// Wall-clock "now" in UTC.
///
/// Single call site for time so tests and future clock injection have one
/// seam to hook.
#[must_use]
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Default permission set attached to newly created API keys.
#[must_use]
pub fn default_permissions() -> Vec<String> {
    vec!["execute".into(), "read".into(), "write".into()]
}
