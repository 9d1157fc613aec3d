// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scriptable in-process engine.
//!
//! Turns are served from a script queue; an empty queue falls back to a
//! canned echo turn. The engine counts `open_thread` and `run` calls so
//! tests can assert session continuity (one open, many runs).

use crate::{Engine, EngineError, EngineThread, ThreadOptions, TurnResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use tb_core::TokenUsage;
use tokio::sync::Mutex;

type ScriptedTurn = Result<TurnResult, String>;

#[derive(Default)]
struct MockState {
    script: Mutex<VecDeque<ScriptedTurn>>,
    opens: AtomicU64,
    runs: AtomicU64,
}

/// In-process engine whose turns are scripted by the test.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    /// Create an engine with an empty script (every turn echoes).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful turn. Its `thread_id` is overwritten with the
    /// opened thread's id so scripted turns stay consistent.
    pub async fn push_turn(&self, final_text: &str, input_tokens: u64, output_tokens: u64) {
        self.state.script.lock().await.push_back(Ok(TurnResult {
            final_text: final_text.to_string(),
            usage: TokenUsage {
                input_tokens,
                output_tokens,
            },
            thread_id: String::new(),
            model: Some("mock-engine-1".into()),
        }));
    }

    /// Queue a failing turn.
    pub async fn push_failure(&self, message: &str) {
        self.state
            .script
            .lock()
            .await
            .push_back(Err(message.to_string()));
    }

    /// Number of threads opened so far.
    #[must_use]
    pub fn open_count(&self) -> u64 {
        self.state.opens.load(Relaxed)
    }

    /// Number of turns executed so far.
    #[must_use]
    pub fn run_count(&self) -> u64 {
        self.state.runs.load(Relaxed)
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn open_thread(
        &self,
        _options: ThreadOptions,
    ) -> Result<Box<dyn EngineThread>, EngineError> {
        self.state.opens.fetch_add(1, Relaxed);
        Ok(Box::new(MockThread {
            state: Arc::clone(&self.state),
            thread_id: format!("thread-{}", tb_core::new_id()),
        }))
    }
}

struct MockThread {
    state: Arc<MockState>,
    thread_id: String,
}

#[async_trait]
impl EngineThread for MockThread {
    async fn run(&mut self, task: &str) -> Result<TurnResult, EngineError> {
        self.state.runs.fetch_add(1, Relaxed);
        match self.state.script.lock().await.pop_front() {
            Some(Ok(mut turn)) => {
                turn.thread_id = self.thread_id.clone();
                Ok(turn)
            }
            Some(Err(message)) => Err(EngineError::TaskFailed {
                message,
                usage: None,
            }),
            None => Ok(TurnResult {
                final_text: format!("completed: {task}"),
                usage: TokenUsage {
                    input_tokens: 12,
                    output_tokens: 4,
                },
                thread_id: self.thread_id.clone(),
                model: Some("mock-engine-1".into()),
            }),
        }
    }

    fn thread_id(&self) -> Option<&str> {
        Some(&self.thread_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_turns_are_served_in_order() {
        let engine = MockEngine::new();
        engine.push_turn("first", 100, 10).await;
        engine.push_turn("second", 200, 20).await;

        let mut thread = engine
            .open_thread(ThreadOptions::rooted_at("/tmp"))
            .await
            .unwrap();
        let a = thread.run("t1").await.unwrap();
        let b = thread.run("t2").await.unwrap();
        assert_eq!(a.final_text, "first");
        assert_eq!(b.final_text, "second");
        assert_eq!(a.thread_id, b.thread_id);
        assert_eq!(engine.open_count(), 1);
        assert_eq!(engine.run_count(), 2);
    }

    #[tokio::test]
    async fn empty_script_echoes_the_task() {
        let engine = MockEngine::new();
        let mut thread = engine
            .open_thread(ThreadOptions::rooted_at("/tmp"))
            .await
            .unwrap();
        let turn = thread.run("build the thing").await.unwrap();
        assert!(turn.final_text.contains("build the thing"));
        assert!(turn.usage.total() > 0);
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_as_task_failed() {
        let engine = MockEngine::new();
        engine.push_failure("synthetic failure").await;
        let mut thread = engine
            .open_thread(ThreadOptions::rooted_at("/tmp"))
            .await
            .unwrap();
        assert!(matches!(
            thread.run("t").await,
            Err(EngineError::TaskFailed { .. })
        ));
    }

    #[tokio::test]
    async fn each_open_gets_a_distinct_thread_id() {
        let engine = MockEngine::new();
        let t1 = engine
            .open_thread(ThreadOptions::rooted_at("/tmp"))
            .await
            .unwrap();
        let t2 = engine
            .open_thread(ThreadOptions::rooted_at("/tmp"))
            .await
            .unwrap();
        assert_ne!(t1.thread_id(), t2.thread_id());
        assert_eq!(engine.open_count(), 2);
    }
}
