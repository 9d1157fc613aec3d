// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP error envelope.
//!
//! Every failure leaves the daemon as `{ "error": { "code", "message",
//! … } }` with the status dictated by the error code. Messages stay free of
//! host paths, SQL text, and credentials; the full cause chain goes to the
//! logs instead.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tb_error::{CoreError, ErrorBody, ErrorCode};

/// A wire-visible error: code, message, and structured details.
#[derive(Debug)]
pub struct ApiError {
    /// Taxonomy code; fixes the HTTP status.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Extra caller-relevant fields (e.g. `current_balance`).
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl ApiError {
    /// Create an error from a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    /// Attach a detail field.
    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl serde::Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.to_string(), v);
        }
        self
    }

    /// Shorthand for a 400 validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    /// Shorthand for a 404.
    pub fn not_found(what: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("{what} not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(obj) = body.as_object_mut() {
            for (k, v) in self.details {
                obj.insert(k, v);
            }
        }
        (status, Json(json!({ "error": body }))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let body = ErrorBody::from(&err);
        Self {
            code: body.code,
            message: body.message,
            details: body.details.into_iter().collect(),
        }
    }
}

impl From<tb_store::StoreError> for ApiError {
    fn from(err: tb_store::StoreError) -> Self {
        match err {
            tb_store::StoreError::NotFound { what } => {
                Self::new(ErrorCode::NotFound, format!("{what} not found"))
            }
            other => {
                tracing::error!(error = %other, "store operation failed");
                Self::new(ErrorCode::StorageFailed, "storage operation failed")
            }
        }
    }
}

impl From<tb_workspace::WorkspaceError> for ApiError {
    fn from(err: tb_workspace::WorkspaceError) -> Self {
        use tb_workspace::WorkspaceError as W;
        match err {
            W::InvalidId { reason } | W::InvalidPath { reason } => {
                Self::new(ErrorCode::ValidationFailed, reason)
            }
            W::NotFound { what } => Self::new(ErrorCode::NotFound, format!("{what} not found")),
            W::Io(source) => {
                tracing::error!(error = %source, "workspace I/O failed");
                Self::new(ErrorCode::Internal, "workspace operation failed")
            }
        }
    }
}

impl From<tb_engine::EngineError> for ApiError {
    fn from(err: tb_engine::EngineError) -> Self {
        use tb_engine::EngineError as E;
        match &err {
            E::TaskFailed { message, .. } => {
                Self::new(ErrorCode::EngineFailed, format!("engine failed: {message}"))
            }
            E::Spawn(_) | E::Protocol { .. } | E::Io(_) => {
                tracing::error!(error = %err, "engine adapter failed");
                Self::new(ErrorCode::EngineFailed, "engine unavailable")
            }
        }
    }
}
