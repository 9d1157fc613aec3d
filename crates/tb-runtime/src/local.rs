// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local runtime: a direct engine against the caller's filesystem.
//!
//! Threads are cached by agent identity, so successive calls from the same
//! agent land on the same engine conversation without the caller tracking
//! anything.

use crate::{
    ExecutionOutcome, ExecutionRequest, Runtime, RuntimeError, RuntimeKind, UsageMetadata,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tb_engine::{Engine, EngineThread, ThreadOptions};
use tokio::sync::Mutex;
use tracing::debug;

/// Runtime that opens engine threads directly.
pub struct LocalRuntime {
    engine: Arc<dyn Engine>,
    threads: Mutex<HashMap<String, Arc<Mutex<Box<dyn EngineThread>>>>>,
}

impl LocalRuntime {
    /// Create a local runtime over an engine.
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the cached thread for one agent.
    pub async fn forget(&self, agent_id: &str) {
        self.threads.lock().await.remove(agent_id);
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Local
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, RuntimeError> {
        let Some(path) = request.workspace.path.clone() else {
            return Err(RuntimeError::InvalidRequest(
                "local execution needs a workspace path".into(),
            ));
        };

        let handle = {
            let mut threads = self.threads.lock().await;
            match threads.get(&request.agent_id) {
                Some(handle) => Arc::clone(handle),
                None => {
                    debug!(agent_id = %request.agent_id, "opening local engine thread");
                    let options = ThreadOptions::rooted_at(path)
                        .with_mcp_servers(request.mcp_servers.clone());
                    let thread = self
                        .engine
                        .open_thread(options)
                        .await
                        .map_err(|e| RuntimeError::Engine(e.to_string()))?;
                    let handle = Arc::new(Mutex::new(thread));
                    threads.insert(request.agent_id.clone(), Arc::clone(&handle));
                    handle
                }
            }
        };

        let mut thread = handle.lock().await;
        let turn = thread
            .run(&request.task)
            .await
            .map_err(|e| RuntimeError::Engine(e.to_string()))?;

        Ok(ExecutionOutcome {
            output: turn.final_text,
            session_id: turn.thread_id,
            usage: Some(UsageMetadata {
                input_tokens: turn.usage.input_tokens,
                output_tokens: turn.usage.output_tokens,
                total_tokens: turn.usage.total(),
                total_cost: 0.0,
            }),
            billing: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkspaceRef;
    use tb_engine::MockEngine;

    fn request(agent_id: &str, task: &str, dir: &std::path::Path) -> ExecutionRequest {
        ExecutionRequest {
            agent_id: agent_id.into(),
            task: task.into(),
            workspace: WorkspaceRef::new("w1", dir),
            session_id: None,
            mcp_servers: Vec::new(),
            skip_workspace_sync: false,
        }
    }

    #[tokio::test]
    async fn same_agent_reuses_one_thread() {
        let engine = MockEngine::new();
        let runtime = LocalRuntime::new(Arc::new(engine.clone()));
        let dir = tempfile::tempdir().unwrap();

        let first = runtime.execute(request("agent-a", "t1", dir.path())).await.unwrap();
        let second = runtime.execute(request("agent-a", "t2", dir.path())).await.unwrap();

        assert_eq!(first.session_id, second.session_id);
        assert_eq!(engine.open_count(), 1);
        assert_eq!(engine.run_count(), 2);
    }

    #[tokio::test]
    async fn different_agents_get_different_threads() {
        let engine = MockEngine::new();
        let runtime = LocalRuntime::new(Arc::new(engine.clone()));
        let dir = tempfile::tempdir().unwrap();

        let a = runtime.execute(request("agent-a", "t", dir.path())).await.unwrap();
        let b = runtime.execute(request("agent-b", "t", dir.path())).await.unwrap();

        assert_ne!(a.session_id, b.session_id);
        assert_eq!(engine.open_count(), 2);
    }

    #[tokio::test]
    async fn forget_reopens_on_next_call() {
        let engine = MockEngine::new();
        let runtime = LocalRuntime::new(Arc::new(engine.clone()));
        let dir = tempfile::tempdir().unwrap();

        runtime.execute(request("agent-a", "t", dir.path())).await.unwrap();
        runtime.forget("agent-a").await;
        runtime.execute(request("agent-a", "t", dir.path())).await.unwrap();
        assert_eq!(engine.open_count(), 2);
    }

    #[tokio::test]
    async fn missing_path_is_invalid() {
        let runtime = LocalRuntime::new(Arc::new(MockEngine::new()));
        let mut req = request("agent-a", "t", std::path::Path::new("/tmp"));
        req.workspace = WorkspaceRef::remote("w1");
        assert!(matches!(
            runtime.execute(req).await,
            Err(RuntimeError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn engine_failure_maps_to_engine_error() {
        let engine = MockEngine::new();
        engine.push_failure("boom").await;
        let runtime = LocalRuntime::new(Arc::new(engine));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            runtime.execute(request("a", "t", dir.path())).await,
            Err(RuntimeError::Engine(_))
        ));
    }
}
