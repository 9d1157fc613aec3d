// SPDX-License-Identifier: MIT OR Apache-2.0
//! MCP plug-in configuration.
//!
//! Two shapes: a local subprocess plug-in (`stdio`) and a remote one
//! (`http`). Unknown fields are captured and forwarded untouched so newer
//! engine options pass through older control planes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration for one MCP server, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpServerConfig {
    /// Local subprocess plug-in.
    Stdio {
        /// Plug-in name.
        name: String,
        /// Command to spawn.
        command: String,
        /// CLI arguments.
        args: Vec<String>,
        /// Forward-compat passthrough of unknown fields.
        #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
        extra: BTreeMap<String, serde_json::Value>,
    },
    /// Remote plug-in reached over HTTP.
    Http {
        /// Plug-in name.
        name: String,
        /// Endpoint URL.
        url: String,
        /// Bearer token attached to plug-in requests.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token: Option<String>,
        /// Extra request headers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<BTreeMap<String, String>>,
        /// Restrict the plug-in to these tools.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_tools: Option<Vec<String>>,
        /// Startup timeout in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        startup_timeout_sec: Option<u64>,
        /// Per-tool-call timeout in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_timeout_sec: Option<u64>,
        /// Forward-compat passthrough of unknown fields.
        #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
        extra: BTreeMap<String, serde_json::Value>,
    },
}

impl McpServerConfig {
    /// The plug-in name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Stdio { name, .. } | Self::Http { name, .. } => name,
        }
    }

    /// Validate required fields beyond what deserialization enforces.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason for the first rule violated.
    pub fn validate(&self) -> Result<(), String> {
        if self.name().trim().is_empty() {
            return Err("mcp server name must not be empty".into());
        }
        match self {
            Self::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err("stdio mcp server requires a command".into());
                }
            }
            Self::Http { url, .. } => {
                if url.trim().is_empty() {
                    return Err("http mcp server requires a url".into());
                }
            }
        }
        Ok(())
    }
}
