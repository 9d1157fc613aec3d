// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subprocess engine adapter.
//!
//! One engine process per thread. The wire is line-delimited JSON: the
//! adapter writes one request object per line on stdin and reads one
//! response object per line from stdout. The engine credential travels via
//! the process environment, never on the wire or in logs.

use crate::{Engine, EngineError, EngineThread, ThreadOptions, TurnResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tb_core::TokenUsage;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// Environment variable carrying the engine credential.
pub const CREDENTIAL_ENV: &str = "TESTBASE_ENGINE_CREDENTIAL";

/// How to spawn the engine binary.
#[derive(Debug, Clone)]
pub struct ProcessEngineSpec {
    /// Engine command.
    pub command: String,
    /// Extra CLI arguments.
    pub args: Vec<String>,
    /// Credential exported as [`CREDENTIAL_ENV`].
    pub credential: Option<String>,
}

/// Engine adapter that spawns one subprocess per thread.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    spec: ProcessEngineSpec,
}

impl ProcessEngine {
    /// Create an adapter from a spawn spec.
    #[must_use]
    pub fn new(spec: ProcessEngineSpec) -> Self {
        Self { spec }
    }
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WireRequest<'a> {
    Open {
        working_directory: &'a str,
        sandbox: &'a str,
        skip_vcs_check: bool,
        mcp_servers: &'a [crate::McpServerConfig],
    },
    Run {
        task: &'a str,
    },
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    final_text: Option<String>,
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[async_trait]
impl Engine for ProcessEngine {
    async fn open_thread(
        &self,
        options: ThreadOptions,
    ) -> Result<Box<dyn EngineThread>, EngineError> {
        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .current_dir(&options.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(credential) = &self.spec.credential {
            command.env(CREDENTIAL_ENV, credential);
        }

        let mut child = command.spawn().map_err(EngineError::Spawn)?;
        let stdin = child.stdin.take().ok_or_else(|| EngineError::Protocol {
            reason: "engine stdin unavailable".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| EngineError::Protocol {
            reason: "engine stdout unavailable".into(),
        })?;

        let mut thread = ProcessThread {
            _child: child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            thread_id: None,
        };

        let working_directory = options.working_directory.to_string_lossy().to_string();
        let open = WireRequest::Open {
            working_directory: &working_directory,
            sandbox: &options.sandbox,
            skip_vcs_check: options.skip_vcs_check,
            mcp_servers: &options.mcp_servers,
        };
        let response = thread.round_trip(&open).await?;
        thread.thread_id = response.thread_id;
        debug!(thread_id = ?thread.thread_id, "engine thread opened");

        Ok(Box::new(thread))
    }
}

struct ProcessThread {
    _child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    thread_id: Option<String>,
}

impl ProcessThread {
    async fn round_trip(&mut self, request: &WireRequest<'_>) -> Result<WireResponse, EngineError> {
        let mut line = serde_json::to_string(request).map_err(|e| EngineError::Protocol {
            reason: format!("encode request: {e}"),
        })?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let raw = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| EngineError::Protocol {
                reason: "engine closed its stream".into(),
            })?;
        let response: WireResponse =
            serde_json::from_str(&raw).map_err(|e| EngineError::Protocol {
                reason: format!("decode response: {e}"),
            })?;

        if let Some(message) = response.error {
            let usage = match (response.input_tokens, response.output_tokens) {
                (None, None) => None,
                (input, output) => Some(TokenUsage {
                    input_tokens: input.unwrap_or(0),
                    output_tokens: output.unwrap_or(0),
                }),
            };
            return Err(EngineError::TaskFailed { message, usage });
        }
        Ok(response)
    }
}

#[async_trait]
impl EngineThread for ProcessThread {
    async fn run(&mut self, task: &str) -> Result<TurnResult, EngineError> {
        let response = self.round_trip(&WireRequest::Run { task }).await?;

        let final_text = response.final_text.ok_or_else(|| EngineError::Protocol {
            reason: "response missing final_text".into(),
        })?;
        if let Some(id) = response.thread_id {
            self.thread_id = Some(id);
        }
        let thread_id = self
            .thread_id
            .clone()
            .ok_or_else(|| EngineError::Protocol {
                reason: "engine never reported a thread id".into(),
            })?;

        Ok(TurnResult {
            final_text,
            usage: TokenUsage {
                input_tokens: response.input_tokens.unwrap_or(0),
                output_tokens: response.output_tokens.unwrap_or(0),
            },
            thread_id,
            model: response.model,
        })
    }

    fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_SANDBOX;

    /// A tiny shell stand-in for the engine: answers the open request, then
    /// echoes one canned turn per run request.
    const FAKE_ENGINE: &str = r#"
read open
echo '{"thread_id":"t-123"}'
while read line; do
  echo '{"final_text":"done","input_tokens":7,"output_tokens":3,"thread_id":"t-123","model":"fake-1"}'
done
"#;

    fn spec() -> ProcessEngineSpec {
        ProcessEngineSpec {
            command: "sh".into(),
            args: vec!["-c".into(), FAKE_ENGINE.into()],
            credential: Some("engine-secret".into()),
        }
    }

    #[tokio::test]
    async fn open_then_run_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(spec());
        let mut thread = engine
            .open_thread(ThreadOptions::rooted_at(dir.path()))
            .await
            .unwrap();
        assert_eq!(thread.thread_id(), Some("t-123"));

        let turn = thread.run("create hello.py").await.unwrap();
        assert_eq!(turn.final_text, "done");
        assert_eq!(turn.usage.total(), 10);
        assert_eq!(turn.thread_id, "t-123");
        assert_eq!(turn.model.as_deref(), Some("fake-1"));
    }

    #[tokio::test]
    async fn engine_error_line_becomes_task_failed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(ProcessEngineSpec {
            command: "sh".into(),
            args: vec![
                "-c".into(),
                r#"
read open
echo '{"thread_id":"t-err"}'
read run
echo '{"error":"tool exploded","input_tokens":5,"output_tokens":0}'
"#
                .into(),
            ],
            credential: None,
        });
        let mut thread = engine
            .open_thread(ThreadOptions::rooted_at(dir.path()))
            .await
            .unwrap();
        match thread.run("boom").await {
            Err(EngineError::TaskFailed { message, usage }) => {
                assert_eq!(message, "tool exploded");
                assert_eq!(usage.unwrap().input_tokens, 5);
            }
            other => panic!("expected TaskFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(ProcessEngineSpec {
            command: "definitely-not-a-real-engine-binary".into(),
            args: vec![],
            credential: None,
        });
        assert!(matches!(
            engine.open_thread(ThreadOptions::rooted_at(dir.path())).await,
            Err(EngineError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn closed_stream_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(ProcessEngineSpec {
            command: "true".into(),
            args: vec![],
            credential: None,
        });
        match engine.open_thread(ThreadOptions::rooted_at(dir.path())).await {
            Err(EngineError::Protocol { .. } | EngineError::Io(_)) => {}
            other => panic!("expected protocol or I/O error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn open_request_serialises_sandbox_and_vcs_flag() {
        let json = serde_json::to_value(WireRequest::Open {
            working_directory: "/srv/w1",
            sandbox: DEFAULT_SANDBOX,
            skip_vcs_check: false,
            mcp_servers: &[],
        })
        .unwrap();
        assert_eq!(json["op"], "open");
        assert_eq!(json["sandbox"], "danger-full-access");
        assert_eq!(json["skip_vcs_check"], false);
    }
}
