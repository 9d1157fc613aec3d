// SPDX-License-Identifier: MIT OR Apache-2.0
//! tb-runtime
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The client side of the control plane: one `execute` interface with two
//! homes. [`LocalRuntime`] talks to the engine directly against the
//! caller's filesystem; [`CloudRuntime`] syncs the workspace to the server,
//! invokes `/execute`, and pulls results back. [`Agent`] carries the
//! session id across calls so successive tasks share a conversation.

/// Agent construction and session continuity.
pub mod agent;
/// Cloud runtime over HTTP.
pub mod cloud;
/// Local runtime over a direct engine.
pub mod local;

pub use agent::{Agent, AgentKind};
pub use cloud::CloudRuntime;
pub use local::LocalRuntime;

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tb_engine::McpServerConfig;

/// Where a runtime executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Direct engine against the local filesystem.
    Local,
    /// Upload → invoke → download against the cloud control plane.
    Cloud,
}

/// Workspace addressed by a task.
#[derive(Debug, Clone)]
pub struct WorkspaceRef {
    /// Server-side workspace id (`[A-Za-z0-9_-]{1,128}`).
    pub id: String,
    /// Local directory backing the workspace, when one exists.
    pub path: Option<PathBuf>,
}

impl WorkspaceRef {
    /// A workspace with both an id and a local directory.
    #[must_use]
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: Some(path.into()),
        }
    }

    /// A cloud-only workspace with no local directory.
    #[must_use]
    pub fn remote(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: None,
        }
    }
}

/// One task submission.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Stable agent identity, used by the local runtime to reuse threads.
    pub agent_id: String,
    /// The task to run.
    pub task: String,
    /// Target workspace.
    pub workspace: WorkspaceRef,
    /// Session to continue, when the agent has one.
    pub session_id: Option<String>,
    /// MCP plug-ins to attach.
    pub mcp_servers: Vec<McpServerConfig>,
    /// Skip workspace upload/download (ephemeral cloud-only runs).
    pub skip_workspace_sync: bool,
}

/// Usage metadata echoed by the server (or synthesized locally).
#[derive(Debug, Clone, Deserialize)]
pub struct UsageMetadata {
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Completion-side tokens.
    pub output_tokens: u64,
    /// `input + output`.
    pub total_tokens: u64,
    /// Cost at the server's pricing (0 locally).
    #[serde(default)]
    pub total_cost: f64,
}

/// Billing metadata echoed by the server for priced keys.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingMetadata {
    /// Balance after the deduction.
    pub balance_after: f64,
    /// Lifetime spend after the deduction.
    pub total_spent: f64,
}

/// Result of one task.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Final engine text.
    pub output: String,
    /// Session id to carry into the next call.
    pub session_id: String,
    /// Usage metadata, when reported.
    pub usage: Option<UsageMetadata>,
    /// Billing metadata, when the server deducted credits.
    pub billing: Option<BillingMetadata>,
}

/// Client-side failure taxonomy; HTTP statuses map onto it per the server
/// contract.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// 401/403, or no API key configured.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// 402.
    #[error("insufficient credits: {0}")]
    InsufficientCredits(String),

    /// 429 — rate limited or over a spending cap.
    #[error("rate limited or over budget: {0}")]
    LimitExceeded(String),

    /// 5xx, or a local engine failure.
    #[error("engine error: {0}")]
    Engine(String),

    /// The server-side deadline (504) or the client's own.
    #[error("execution timed out")]
    Timeout,

    /// Request construction problems (bad workspace ref, missing path).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Workspace upload/download failed.
    #[error("workspace sync failed: {0}")]
    WorkspaceSync(String),

    /// The HTTP transport failed before a status was available.
    #[error("transport error")]
    Transport(#[source] reqwest::Error),
}

/// Uniform execution interface over the two runtimes.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Which home this runtime executes in.
    fn kind(&self) -> RuntimeKind;

    /// Run one task.
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_ref_constructors() {
        let local = WorkspaceRef::new("w1", "/tmp/w1");
        assert!(local.path.is_some());
        let remote = WorkspaceRef::remote("w2");
        assert!(remote.path.is_none());
    }
}
