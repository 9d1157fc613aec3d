// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent construction and session continuity.
//!
//! Two agent kinds with divergent requirements, enforced at construction:
//! computer agents must have a runtime, LLM agents must not, and function
//! tools belong to LLM agents only. The agent stores the session id each
//! execution returns so the next call continues the same conversation.

use crate::{ExecutionOutcome, ExecutionRequest, Runtime, RuntimeError, WorkspaceRef};
use std::sync::Arc;
use tb_engine::McpServerConfig;

/// What an agent is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Chat/completions against a model provider; no runtime.
    Llm,
    /// Computer-use tasks against a workspace; needs a runtime.
    Computer,
}

/// An agent instance. Single-threaded by design: one conversation at a
/// time per agent.
pub struct Agent {
    name: String,
    kind: AgentKind,
    runtime: Option<Arc<dyn Runtime>>,
    function_tools: Vec<String>,
    mcp_servers: Vec<McpServerConfig>,
    skip_workspace_sync: bool,
    session_id: Option<String>,
}

/// Builder for [`Agent`]; validation happens at [`AgentBuilder::build`].
pub struct AgentBuilder {
    name: String,
    kind: AgentKind,
    runtime: Option<Arc<dyn Runtime>>,
    function_tools: Vec<String>,
    mcp_servers: Vec<McpServerConfig>,
    skip_workspace_sync: bool,
}

impl AgentBuilder {
    /// Attach the runtime a computer agent executes on.
    #[must_use]
    pub fn runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Attach function tools (LLM agents only).
    #[must_use]
    pub fn function_tools(mut self, tools: Vec<String>) -> Self {
        self.function_tools = tools;
        self
    }

    /// Attach MCP plug-ins forwarded to the engine.
    #[must_use]
    pub fn mcp_servers(mut self, servers: Vec<McpServerConfig>) -> Self {
        self.mcp_servers = servers;
        self
    }

    /// Skip workspace sync on cloud runs (ephemeral workspaces).
    #[must_use]
    pub fn skip_workspace_sync(mut self, skip: bool) -> Self {
        self.skip_workspace_sync = skip;
        self
    }

    /// Validate the combination and produce the agent.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidRequest`] for computer-without-runtime,
    /// llm-with-runtime, and computer-with-function-tools combinations.
    pub fn build(self) -> Result<Agent, RuntimeError> {
        match self.kind {
            AgentKind::Computer => {
                if self.runtime.is_none() {
                    return Err(RuntimeError::InvalidRequest(
                        "computer agents require a runtime".into(),
                    ));
                }
                if !self.function_tools.is_empty() {
                    return Err(RuntimeError::InvalidRequest(
                        "function tools are not valid on computer agents".into(),
                    ));
                }
            }
            AgentKind::Llm => {
                if self.runtime.is_some() {
                    return Err(RuntimeError::InvalidRequest(
                        "llm agents must not have a runtime".into(),
                    ));
                }
            }
        }
        Ok(Agent {
            name: self.name,
            kind: self.kind,
            runtime: self.runtime,
            function_tools: self.function_tools,
            mcp_servers: self.mcp_servers,
            skip_workspace_sync: self.skip_workspace_sync,
            session_id: None,
        })
    }
}

impl Agent {
    /// Start building a computer-use agent.
    #[must_use]
    pub fn computer(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder {
            name: name.into(),
            kind: AgentKind::Computer,
            runtime: None,
            function_tools: Vec::new(),
            mcp_servers: Vec::new(),
            skip_workspace_sync: false,
        }
    }

    /// Start building an LLM agent.
    #[must_use]
    pub fn llm(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder {
            name: name.into(),
            kind: AgentKind::Llm,
            runtime: None,
            function_tools: Vec::new(),
            mcp_servers: Vec::new(),
            skip_workspace_sync: false,
        }
    }

    /// The agent's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The agent's kind.
    #[must_use]
    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Function tools attached to this agent.
    #[must_use]
    pub fn function_tools(&self) -> &[String] {
        &self.function_tools
    }

    /// The session id the next execution will continue, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Forget the current session; the next execution starts fresh.
    pub fn reset_session(&mut self) {
        self.session_id = None;
    }

    /// Continue a specific session on the next execution.
    pub fn resume_session(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
    }

    /// Execute a task against a workspace, continuing the stored session
    /// and storing the one the runtime returns.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidRequest`] on LLM agents, or whatever
    /// the runtime surfaces.
    pub async fn execute(
        &mut self,
        task: impl Into<String>,
        workspace: WorkspaceRef,
    ) -> Result<ExecutionOutcome, RuntimeError> {
        let Some(runtime) = self.runtime.clone() else {
            return Err(RuntimeError::InvalidRequest(
                "llm agents execute against a model provider, not a runtime".into(),
            ));
        };
        let outcome = runtime
            .execute(ExecutionRequest {
                agent_id: self.name.clone(),
                task: task.into(),
                workspace,
                session_id: self.session_id.clone(),
                mcp_servers: self.mcp_servers.clone(),
                skip_workspace_sync: self.skip_workspace_sync,
            })
            .await?;
        self.session_id = Some(outcome.session_id.clone());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalRuntime;
    use tb_engine::MockEngine;

    fn runtime() -> Arc<dyn Runtime> {
        Arc::new(LocalRuntime::new(Arc::new(MockEngine::new())))
    }

    #[test]
    fn computer_agent_requires_runtime() {
        assert!(matches!(
            Agent::computer("bot").build(),
            Err(RuntimeError::InvalidRequest(_))
        ));
        assert!(Agent::computer("bot").runtime(runtime()).build().is_ok());
    }

    #[test]
    fn llm_agent_rejects_runtime() {
        assert!(matches!(
            Agent::llm("chat").runtime(runtime()).build(),
            Err(RuntimeError::InvalidRequest(_))
        ));
        assert!(Agent::llm("chat").build().is_ok());
    }

    #[test]
    fn computer_agent_rejects_function_tools() {
        let result = Agent::computer("bot")
            .runtime(runtime())
            .function_tools(vec!["calculator".into()])
            .build();
        assert!(matches!(result, Err(RuntimeError::InvalidRequest(_))));
    }

    #[test]
    fn llm_agent_keeps_function_tools() {
        let agent = Agent::llm("chat")
            .function_tools(vec!["calculator".into()])
            .build()
            .unwrap();
        assert_eq!(agent.function_tools(), ["calculator".to_string()]);
    }

    #[tokio::test]
    async fn execute_stores_session_for_continuity() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = Agent::computer("bot").runtime(runtime()).build().unwrap();
        assert!(agent.session_id().is_none());

        let first = agent
            .execute("task one", WorkspaceRef::new("w1", dir.path()))
            .await
            .unwrap();
        assert_eq!(agent.session_id(), Some(first.session_id.as_str()));

        let second = agent
            .execute("task two", WorkspaceRef::new("w1", dir.path()))
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn reset_and_resume_control_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = Agent::computer("bot").runtime(runtime()).build().unwrap();
        agent
            .execute("task", WorkspaceRef::new("w1", dir.path()))
            .await
            .unwrap();
        agent.reset_session();
        assert!(agent.session_id().is_none());

        agent.resume_session("s-explicit");
        assert_eq!(agent.session_id(), Some("s-explicit"));
    }

    #[tokio::test]
    async fn llm_agent_cannot_execute() {
        let mut agent = Agent::llm("chat").build().unwrap();
        assert!(matches!(
            agent.execute("task", WorkspaceRef::remote("w1")).await,
            Err(RuntimeError::InvalidRequest(_))
        ));
    }
}
