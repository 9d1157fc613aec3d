// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the control plane.
//!
//! Every wire-visible error carries an [`ErrorCode`] (a machine-readable,
//! stable string tag) that maps to exactly one HTTP status. [`CoreError`]
//! is the carrier: code + human message + optional cause + structured
//! context. Messages never include host paths, SQL text, or credentials.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Request shape or parameter problems.
    Validation,
    /// Credential extraction and key lookup problems.
    Auth,
    /// Credit balance and spending-limit problems.
    Budget,
    /// Unknown or contended resources.
    Resource,
    /// Failures surfaced by the execution engine.
    Engine,
    /// Key/billing store failures.
    Storage,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::Budget => "budget",
            Self::Resource => "resource",
            Self::Engine => "engine",
            Self::Storage => "storage",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that will not
/// change across patch releases, and maps to exactly one HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Validation --
    /// Malformed body, bad identifier, or rejected path.
    ValidationFailed,
    /// Body or upload exceeds the configured size cap.
    PayloadTooLarge,

    // -- Auth --
    /// No credential was presented.
    Unauthenticated,
    /// A credential was presented but is invalid, revoked, or expired.
    AuthFailed,

    // -- Budget --
    /// Pre-flight balance check found no remaining credits.
    InsufficientCredits,
    /// Cumulative spend reached the daily or monthly cap.
    BudgetLimitExceeded,

    // -- Resource --
    /// Unknown key, session, workspace, or file.
    NotFound,
    /// A live session is already executing a task.
    SessionBusy,
    /// Per-IP request quota exhausted.
    RateLimited,

    // -- Engine --
    /// The execution engine reported a failure.
    EngineFailed,
    /// The execute deadline elapsed before the engine finished.
    ExecuteTimeout,

    // -- Storage --
    /// The key or billing store failed.
    StorageFailed,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ValidationFailed | Self::PayloadTooLarge => ErrorCategory::Validation,
            Self::Unauthenticated | Self::AuthFailed => ErrorCategory::Auth,
            Self::InsufficientCredits | Self::BudgetLimitExceeded => ErrorCategory::Budget,
            Self::NotFound | Self::SessionBusy | Self::RateLimited => ErrorCategory::Resource,
            Self::EngineFailed | Self::ExecuteTimeout => ErrorCategory::Engine,
            Self::StorageFailed => ErrorCategory::Storage,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// The single HTTP status this code maps to.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ValidationFailed | Self::PayloadTooLarge => 400,
            Self::Unauthenticated => 401,
            Self::InsufficientCredits => 402,
            Self::AuthFailed => 403,
            Self::NotFound => 404,
            Self::SessionBusy => 409,
            Self::BudgetLimitExceeded | Self::RateLimited => 429,
            Self::EngineFailed => 502,
            Self::ExecuteTimeout => 504,
            Self::StorageFailed | Self::Internal => 500,
        }
    }

    /// Stable `&'static str` representation (e.g. `"INSUFFICIENT_CREDITS"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::InsufficientCredits => "INSUFFICIENT_CREDITS",
            Self::BudgetLimitExceeded => "BUDGET_LIMIT_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::SessionBusy => "SESSION_BUSY",
            Self::RateLimited => "RATE_LIMITED",
            Self::EngineFailed => "ENGINE_FAILED",
            Self::ExecuteTimeout => "EXECUTE_TIMEOUT",
            Self::StorageFailed => "STORAGE_FAILED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

/// Unified control-plane error.
///
/// Carries a stable [`ErrorCode`], a human-readable message safe to show to
/// callers, an optional source error for cause-chaining, and structured
/// context for logs.
///
/// # Builder usage
///
/// ```
/// use tb_error::{CoreError, ErrorCode};
///
/// let err = CoreError::new(ErrorCode::BudgetLimitExceeded, "daily limit reached")
///     .with_context("daily_limit", 0.10)
///     .with_context("daily_usage", 0.10308);
/// ```
pub struct CoreError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description, safe for the wire.
    pub message: String,
    /// Optional underlying cause (never serialised to callers).
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl CoreError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; entries that fail
    /// to serialise are skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("CoreError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// The JSON body every error response carries:
/// `{ "error": { "code": …, "message": …, … } }` once wrapped by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Extra caller-relevant fields (e.g. `current_balance`, `reason`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl From<&CoreError> for ErrorBody {
    fn from(err: &CoreError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            details: err.context.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::ValidationFailed,
        ErrorCode::PayloadTooLarge,
        ErrorCode::Unauthenticated,
        ErrorCode::AuthFailed,
        ErrorCode::InsufficientCredits,
        ErrorCode::BudgetLimitExceeded,
        ErrorCode::NotFound,
        ErrorCode::SessionBusy,
        ErrorCode::RateLimited,
        ErrorCode::EngineFailed,
        ErrorCode::ExecuteTimeout,
        ErrorCode::StorageFailed,
        ErrorCode::Internal,
    ];

    #[test]
    fn status_map_matches_taxonomy() {
        assert_eq!(ErrorCode::ValidationFailed.http_status(), 400);
        assert_eq!(ErrorCode::Unauthenticated.http_status(), 401);
        assert_eq!(ErrorCode::InsufficientCredits.http_status(), 402);
        assert_eq!(ErrorCode::AuthFailed.http_status(), 403);
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::SessionBusy.http_status(), 409);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
        assert_eq!(ErrorCode::BudgetLimitExceeded.http_status(), 429);
        assert_eq!(ErrorCode::EngineFailed.http_status(), 502);
        assert_eq!(ErrorCode::ExecuteTimeout.http_status(), 504);
        assert_eq!(ErrorCode::Internal.http_status(), 500);
    }

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            assert!(seen.insert(code.as_str()), "duplicate: {}", code.as_str());
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_serialize_to_as_str() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            assert_eq!(json, format!(r#""{}""#, code.as_str()));
        }
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = CoreError::new(ErrorCode::NotFound, "no such workspace");
        assert_eq!(err.to_string(), "[NOT_FOUND] no such workspace");
    }

    #[test]
    fn builder_context_and_source() {
        let src = io::Error::new(io::ErrorKind::ConnectionRefused, "db down");
        let err = CoreError::new(ErrorCode::StorageFailed, "store unavailable")
            .with_context("operation", "deduct_usage")
            .with_source(src);
        assert_eq!(err.context["operation"], serde_json::json!("deduct_usage"));
        assert_eq!(
            std::error::Error::source(&err).unwrap().to_string(),
            "db down"
        );
    }

    #[test]
    fn error_body_carries_details() {
        let err = CoreError::new(ErrorCode::InsufficientCredits, "no credits")
            .with_context("current_balance", 0.0);
        let body = ErrorBody::from(&err);
        assert_eq!(body.code, ErrorCode::InsufficientCredits);
        assert_eq!(body.details["current_balance"], serde_json::json!(0.0));
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("INSUFFICIENT_CREDITS"));
    }

    #[test]
    fn categories_cover_all_codes() {
        for code in ALL_CODES {
            // Every code maps to a category and a status without panicking.
            let _ = code.category();
            assert!(code.http_status() >= 400);
        }
    }
}
