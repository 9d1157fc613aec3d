// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cloud runtime: workspace upload, `/execute` invoke, workspace download.
//!
//! The production endpoint is a compile-time constant; the API key comes
//! from explicit configuration or `TESTBASE_API_KEY`. Workspace sync flows
//! through the server's file surface one file at a time, skipping files
//! whose size already matches.

use crate::{
    BillingMetadata, ExecutionOutcome, ExecutionRequest, Runtime, RuntimeError, RuntimeKind,
    UsageMetadata,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use walkdir::WalkDir;

/// Production control-plane endpoint. Fixed at compile time.
pub const CLOUD_ENDPOINT: &str = "https://api.testbase.ai";

/// Environment variable consulted for the API key.
pub const API_KEY_ENV: &str = "TESTBASE_API_KEY";

/// Client-side deadline, aligned with the server's default plus slack for
/// transfer overhead.
const CLIENT_DEADLINE: Duration = Duration::from_secs(620);

/// Runtime that executes against the cloud control plane.
pub struct CloudRuntime {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl CloudRuntime {
    /// Create a cloud runtime with an explicit API key.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Transport`]-free construction errors only via
    /// the HTTP client builder; an empty key is [`RuntimeError::AuthFailed`].
    pub fn new(api_key: impl Into<String>) -> Result<Self, RuntimeError> {
        Self::with_base_url(CLOUD_ENDPOINT, api_key)
    }

    /// Create a cloud runtime keyed from `TESTBASE_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AuthFailed`] when the variable is unset.
    pub fn from_env() -> Result<Self, RuntimeError> {
        let key = std::env::var(API_KEY_ENV)
            .map_err(|_| RuntimeError::AuthFailed(format!("{API_KEY_ENV} is not set")))?;
        Self::new(key)
    }

    /// Construction against a non-production endpoint. Test harnesses only;
    /// production builds use [`CLOUD_ENDPOINT`].
    #[doc(hidden)]
    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, RuntimeError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(RuntimeError::AuthFailed("API key is empty".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(CLIENT_DEADLINE)
            .build()
            .map_err(RuntimeError::Transport)?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
        })
    }

    async fn upload_workspace(
        &self,
        workspace_id: &str,
        root: &Path,
    ) -> Result<(), RuntimeError> {
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
            })
            .flatten()
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| RuntimeError::WorkspaceSync("path outside workspace".into()))?
                .to_string_lossy()
                .replace('\\', "/");
            let bytes = tokio::fs::read(entry.path())
                .await
                .map_err(|e| RuntimeError::WorkspaceSync(format!("read {rel}: {e}")))?;

            let form = reqwest::multipart::Form::new()
                .text("path", rel.clone())
                .part(
                    "file",
                    reqwest::multipart::Part::bytes(bytes).file_name(rel.clone()),
                );
            let resp = self
                .http
                .post(format!("{}/workspace/{workspace_id}/upload", self.base_url))
                .bearer_auth(&self.api_key)
                .multipart(form)
                .send()
                .await
                .map_err(|e| RuntimeError::WorkspaceSync(format!("upload {rel}: {e}")))?;
            if !resp.status().is_success() {
                return Err(RuntimeError::WorkspaceSync(format!(
                    "upload {rel}: server returned {}",
                    resp.status()
                )));
            }
            debug!(workspace_id, path = %rel, "uploaded workspace file");
        }
        Ok(())
    }

    async fn download_workspace(
        &self,
        workspace_id: &str,
        root: &Path,
    ) -> Result<(), RuntimeError> {
        let mut pending = vec![None::<String>];
        while let Some(subpath) = pending.pop() {
            let mut request = self
                .http
                .get(format!("{}/workspace/{workspace_id}/files", self.base_url))
                .bearer_auth(&self.api_key);
            if let Some(path) = &subpath {
                request = request.query(&[("path", path)]);
            }
            let resp = request
                .send()
                .await
                .map_err(|e| RuntimeError::WorkspaceSync(format!("list: {e}")))?;
            if !resp.status().is_success() {
                return Err(RuntimeError::WorkspaceSync(format!(
                    "list: server returned {}",
                    resp.status()
                )));
            }
            let listing: ListingWire = resp
                .json()
                .await
                .map_err(|e| RuntimeError::WorkspaceSync(format!("decode listing: {e}")))?;

            for entry in listing.files {
                if entry.is_dir {
                    pending.push(Some(entry.path));
                    continue;
                }
                let local = root.join(&entry.path);
                if let Ok(meta) = tokio::fs::metadata(&local).await
                    && meta.len() == entry.size
                {
                    continue;
                }
                let resp = self
                    .http
                    .get(format!(
                        "{}/workspace/{workspace_id}/download/{}",
                        self.base_url, entry.path
                    ))
                    .bearer_auth(&self.api_key)
                    .send()
                    .await
                    .map_err(|e| RuntimeError::WorkspaceSync(format!("download: {e}")))?;
                if !resp.status().is_success() {
                    return Err(RuntimeError::WorkspaceSync(format!(
                        "download {}: server returned {}",
                        entry.path,
                        resp.status()
                    )));
                }
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| RuntimeError::WorkspaceSync(format!("download body: {e}")))?;
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| RuntimeError::WorkspaceSync(e.to_string()))?;
                }
                tokio::fs::write(&local, &bytes)
                    .await
                    .map_err(|e| RuntimeError::WorkspaceSync(e.to_string()))?;
                debug!(workspace_id, path = %entry.path, "downloaded workspace file");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ListingWire {
    files: Vec<FileEntryWire>,
}

#[derive(Debug, Deserialize)]
struct FileEntryWire {
    path: String,
    size: u64,
    is_dir: bool,
}

#[derive(Debug, Deserialize)]
struct ExecuteWire {
    output: String,
    session_id: String,
    #[serde(default)]
    usage: Option<UsageMetadata>,
    #[serde(default)]
    billing: Option<BillingMetadata>,
}

#[derive(Debug, Deserialize)]
struct ErrorWire {
    error: ErrorBodyWire,
}

#[derive(Debug, Deserialize)]
struct ErrorBodyWire {
    #[serde(default)]
    message: String,
}

#[async_trait]
impl Runtime for CloudRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Cloud
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, RuntimeError> {
        tb_core::validate_resource_id(&request.workspace.id)
            .map_err(|reason| RuntimeError::InvalidRequest(format!("workspace id: {reason}")))?;
        if let Some(session_id) = &request.session_id {
            tb_core::validate_resource_id(session_id)
                .map_err(|reason| RuntimeError::InvalidRequest(format!("session id: {reason}")))?;
        }

        let sync_root = (!request.skip_workspace_sync)
            .then_some(request.workspace.path.as_deref())
            .flatten();

        if let Some(root) = sync_root {
            self.upload_workspace(&request.workspace.id, root).await?;
        }

        let body = serde_json::json!({
            "task": request.task,
            "workspace_id": request.workspace.id,
            "session_id": request.session_id,
            "mcp_servers": request.mcp_servers,
        });
        let resp = self
            .http
            .post(format!("{}/execute", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RuntimeError::Timeout
                } else {
                    RuntimeError::Transport(e)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<ErrorWire>()
                .await
                .map(|w| w.error.message)
                .unwrap_or_else(|_| status.to_string());
            return Err(map_status(status, message));
        }

        let wire: ExecuteWire = resp.json().await.map_err(RuntimeError::Transport)?;

        if let Some(root) = sync_root {
            self.download_workspace(&request.workspace.id, root).await?;
        }

        Ok(ExecutionOutcome {
            output: wire.output,
            session_id: wire.session_id,
            usage: wire.usage,
            billing: wire.billing,
        })
    }
}

fn map_status(status: StatusCode, message: String) -> RuntimeError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RuntimeError::AuthFailed(message),
        StatusCode::PAYMENT_REQUIRED => RuntimeError::InsufficientCredits(message),
        StatusCode::TOO_MANY_REQUESTS => RuntimeError::LimitExceeded(message),
        StatusCode::GATEWAY_TIMEOUT => RuntimeError::Timeout,
        _ => RuntimeError::Engine(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkspaceRef;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(workspace: WorkspaceRef) -> ExecutionRequest {
        ExecutionRequest {
            agent_id: "agent-a".into(),
            task: "create hello.py".into(),
            workspace,
            session_id: None,
            mcp_servers: Vec::new(),
            skip_workspace_sync: false,
        }
    }

    async fn runtime_for(server: &MockServer) -> CloudRuntime {
        CloudRuntime::with_base_url(server.uri(), "tb_testkey").unwrap()
    }

    #[tokio::test]
    async fn execute_parses_usage_and_billing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(header("authorization", "Bearer tb_testkey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": "Created hello.py.",
                "session_id": "s-1",
                "workspace_id": "w1",
                "usage": {
                    "input_tokens": 6548,
                    "output_tokens": 108,
                    "total_tokens": 6656,
                    "total_cost": 0.10308
                },
                "billing": { "balance_after": 9.89692, "total_spent": 0.10308 }
            })))
            .mount(&server)
            .await;

        let runtime = runtime_for(&server).await;
        let outcome = runtime
            .execute(request(WorkspaceRef::remote("w1")))
            .await
            .unwrap();
        assert_eq!(outcome.output, "Created hello.py.");
        assert_eq!(outcome.session_id, "s-1");
        assert_eq!(outcome.usage.unwrap().total_tokens, 6656);
        assert_eq!(outcome.billing.unwrap().balance_after, 9.89692);
    }

    #[tokio::test]
    async fn session_id_is_echoed_into_the_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(body_partial_json(json!({ "session_id": "s-keep" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": "ok", "session_id": "s-keep", "workspace_id": "w1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let runtime = runtime_for(&server).await;
        let mut req = request(WorkspaceRef::remote("w1"));
        req.session_id = Some("s-keep".into());
        let outcome = runtime.execute(req).await.unwrap();
        assert_eq!(outcome.session_id, "s-keep");
    }

    #[tokio::test]
    async fn status_mapping_matches_contract() {
        for (status, check) in [
            (401, "auth"),
            (402, "credits"),
            (429, "limit"),
            (504, "timeout"),
            (502, "engine"),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/execute"))
                .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                    "error": { "code": "X", "message": "why" }
                })))
                .mount(&server)
                .await;
            let runtime = runtime_for(&server).await;
            let err = runtime
                .execute(request(WorkspaceRef::remote("w1")))
                .await
                .unwrap_err();
            let matched = match (check, &err) {
                ("auth", RuntimeError::AuthFailed(_))
                | ("credits", RuntimeError::InsufficientCredits(_))
                | ("limit", RuntimeError::LimitExceeded(_))
                | ("timeout", RuntimeError::Timeout)
                | ("engine", RuntimeError::Engine(_)) => true,
                _ => false,
            };
            assert!(matched, "status {status} mapped to {err:?}");
        }
    }

    #[tokio::test]
    async fn workspace_files_upload_before_invoke() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), b"print()").unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), b"hidden").unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workspace/w1/upload"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "workspace_id": "w1", "uploaded": ["main.py"] })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": "ok", "session_id": "s", "workspace_id": "w1"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/workspace/w1/files"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "workspace_id": "w1", "files": [] })),
            )
            .mount(&server)
            .await;

        let runtime = runtime_for(&server).await;
        runtime
            .execute(request(WorkspaceRef::new("w1", dir.path())))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn download_writes_new_files_locally() {
        let dir = tempfile::tempdir().unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": "ok", "session_id": "s", "workspace_id": "w1"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/workspace/w1/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "workspace_id": "w1",
                "files": [
                    { "name": "hello.py", "path": "hello.py", "size": 5,
                      "modified": "2026-08-01T00:00:00Z", "is_dir": false }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/workspace/w1/download/hello.py"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"print".to_vec()))
            .mount(&server)
            .await;

        let runtime = runtime_for(&server).await;
        runtime
            .execute(request(WorkspaceRef::new("w1", dir.path())))
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("hello.py")).unwrap(), b"print");
    }

    #[tokio::test]
    async fn skip_workspace_sync_skips_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), b"x").unwrap();

        let server = MockServer::start().await;
        // Only /execute is mocked; any sync call would 404 and fail the run.
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": "ok", "session_id": "s", "workspace_id": "w1"
            })))
            .mount(&server)
            .await;

        let runtime = runtime_for(&server).await;
        let mut req = request(WorkspaceRef::new("w1", dir.path()));
        req.skip_workspace_sync = true;
        runtime.execute(req).await.unwrap();
    }

    #[tokio::test]
    async fn empty_api_key_is_rejected_at_construction() {
        assert!(matches!(
            CloudRuntime::with_base_url("http://localhost:1", "  "),
            Err(RuntimeError::AuthFailed(_))
        ));
    }
}
