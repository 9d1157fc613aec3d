// SPDX-License-Identifier: MIT OR Apache-2.0
//! tb-engine
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The only contact surface with the external code-execution engine.
//!
//! [`Engine::open_thread`] opens a conversational thread rooted at a
//! workspace directory; [`EngineThread::run`] executes one task on it and
//! surfaces the final text plus token counts. [`ProcessEngine`] speaks
//! line-delimited JSON to an engine subprocess; [`MockEngine`] scripts
//! turns for tests.

/// MCP plug-in configuration forwarded verbatim to the engine.
pub mod mcp;
/// Scriptable in-process engine for tests.
pub mod mock;
/// Subprocess engine speaking line-delimited JSON.
pub mod process;

pub use mcp::McpServerConfig;
pub use mock::MockEngine;
pub use process::{ProcessEngine, ProcessEngineSpec};

use async_trait::async_trait;
use std::path::PathBuf;
use tb_core::TokenUsage;

/// Sandbox mode requested for new threads. The engine interprets it; the
/// control plane only forwards it.
pub const DEFAULT_SANDBOX: &str = "danger-full-access";

/// Options for opening a thread.
#[derive(Debug, Clone)]
pub struct ThreadOptions {
    /// Directory the thread is rooted at.
    pub working_directory: PathBuf,
    /// Sandbox mode string, forwarded verbatim.
    pub sandbox: String,
    /// Skip the engine's own version-control preflight.
    pub skip_vcs_check: bool,
    /// MCP plug-ins to attach, forwarded verbatim.
    pub mcp_servers: Vec<McpServerConfig>,
}

impl ThreadOptions {
    /// Options rooted at `working_directory` with the defaults the execute
    /// path uses: full-access sandbox, VCS check enabled, no plug-ins.
    #[must_use]
    pub fn rooted_at(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            sandbox: DEFAULT_SANDBOX.to_string(),
            skip_vcs_check: false,
            mcp_servers: Vec::new(),
        }
    }

    /// Attach MCP plug-ins.
    #[must_use]
    pub fn with_mcp_servers(mut self, servers: Vec<McpServerConfig>) -> Self {
        self.mcp_servers = servers;
        self
    }
}

/// Result of one executed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    /// Final assistant text.
    pub final_text: String,
    /// Token counts reported by the engine.
    pub usage: TokenUsage,
    /// Thread id the engine assigned (stable across turns).
    pub thread_id: String,
    /// Model the engine ran, when reported.
    pub model: Option<String>,
}

/// Errors surfaced by the engine adapter.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine process could not be spawned.
    #[error("failed to spawn engine process")]
    Spawn(#[source] std::io::Error),

    /// The engine closed its stream or emitted something unparseable.
    #[error("engine protocol error: {reason}")]
    Protocol {
        /// What went wrong on the wire.
        reason: String,
    },

    /// The engine reported a task failure. Token counts, when the engine
    /// got far enough to report them, ride along for partial accounting.
    #[error("engine task failed: {message}")]
    TaskFailed {
        /// Engine-reported failure message.
        message: String,
        /// Tokens consumed before the failure, when known.
        usage: Option<TokenUsage>,
    },

    /// I/O on the engine's pipes failed.
    #[error("engine I/O failed")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Token counts attached to this error, when the engine reported any.
    #[must_use]
    pub fn partial_usage(&self) -> Option<TokenUsage> {
        match self {
            Self::TaskFailed { usage, .. } => *usage,
            _ => None,
        }
    }
}

/// Factory for engine threads.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Open a new conversational thread.
    async fn open_thread(
        &self,
        options: ThreadOptions,
    ) -> Result<Box<dyn EngineThread>, EngineError>;
}

/// A live conversational thread. One turn at a time; callers serialize.
#[async_trait]
pub trait EngineThread: Send {
    /// Execute one task and return its result.
    async fn run(&mut self, task: &str) -> Result<TurnResult, EngineError>;

    /// The engine-assigned thread id, once the first turn reported it.
    fn thread_id(&self) -> Option<&str>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_at_uses_defaults() {
        let opts = ThreadOptions::rooted_at("/srv/w1");
        assert_eq!(opts.sandbox, DEFAULT_SANDBOX);
        assert!(!opts.skip_vcs_check);
        assert!(opts.mcp_servers.is_empty());
    }

    #[test]
    fn partial_usage_only_on_task_failures() {
        let failed = EngineError::TaskFailed {
            message: "tool crashed".into(),
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 2,
            }),
        };
        assert_eq!(failed.partial_usage().unwrap().total(), 12);

        let protocol = EngineError::Protocol {
            reason: "eof".into(),
        };
        assert!(protocol.partial_usage().is_none());
    }
}
