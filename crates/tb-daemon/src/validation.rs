// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request validation for the daemon API.

use crate::error::ApiError;
use serde::Deserialize;
use tb_engine::McpServerConfig;

/// Maximum task length in bytes (100 KiB).
pub const MAX_TASK_BYTES: usize = 100 * 1024;

/// Body of `POST /execute`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    /// The task to run.
    pub task: String,
    /// Target workspace.
    pub workspace_id: String,
    /// Session to continue, when the caller has one.
    #[serde(default)]
    pub session_id: Option<String>,
    /// MCP plug-ins to attach.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

/// Validate an execute request, accumulating every problem found.
///
/// # Errors
///
/// Returns a 400 [`ApiError`] listing each violated rule.
pub fn validate_execute(req: &ExecuteRequest) -> Result<(), ApiError> {
    let mut errors = Vec::new();

    if req.task.is_empty() {
        errors.push("task must not be empty".to_string());
    } else if req.task.len() > MAX_TASK_BYTES {
        errors.push(format!(
            "task exceeds maximum length of {MAX_TASK_BYTES} bytes"
        ));
    } else if req.task.trim().is_empty() {
        errors.push("task must contain non-whitespace characters".to_string());
    }

    if let Err(reason) = tb_core::validate_resource_id(&req.workspace_id) {
        errors.push(format!("workspace_id: {reason}"));
    }
    if let Some(session_id) = &req.session_id
        && let Err(reason) = tb_core::validate_resource_id(session_id)
    {
        errors.push(format!("session_id: {reason}"));
    }
    for server in &req.mcp_servers {
        if let Err(reason) = server.validate() {
            errors.push(format!("mcp_servers: {reason}"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::validation(errors.join("; ")))
    }
}

/// Validate a caller-supplied relative path (uploads, downloads, deletes).
///
/// # Errors
///
/// Returns a 400 [`ApiError`] naming the violated rule.
pub fn validate_path(path: &str) -> Result<(), ApiError> {
    tb_core::validate_relative_path(path).map_err(ApiError::validation)
}
