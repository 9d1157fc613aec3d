// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared harness for control-plane integration tests: a real router over
//! an in-memory store, a temp object mount, and a scriptable engine.
#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt as _;
use serde_json::Value;
use std::sync::Arc;
use tb_config::ServerConfig;
use tb_daemon::{AppState, build_app};
use tb_engine::MockEngine;
use tb_store::{CreateKeyParams, Store};
use tempfile::TempDir;
use tower::ServiceExt as _;

/// Admin credential every harness configures.
pub const ADMIN_CREDENTIAL: &str = "admin-secret";

pub struct Harness {
    pub app: Router,
    pub state: Arc<AppState>,
    pub store: Store,
    pub engine: MockEngine,
    _mount: TempDir,
}

/// Build a harness with the default test configuration.
pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

/// Build a harness, letting the test tweak the config first.
pub async fn harness_with(tweak: impl FnOnce(&mut ServerConfig)) -> Harness {
    let mount = tempfile::tempdir().expect("create temp mount");
    let mut config = ServerConfig::default();
    config.storage.object_mount_path = mount.path().to_string_lossy().to_string();
    config.auth.admin_credential = Some(ADMIN_CREDENTIAL.to_string());
    config.execute.timeout_secs = 5;
    tweak(&mut config);

    let store = Store::connect_in_memory().await.expect("open store");
    let engine = MockEngine::new();
    let state = Arc::new(AppState::new(config, store.clone(), Arc::new(engine.clone())));
    let app = build_app(Arc::clone(&state));
    Harness {
        app,
        state,
        store,
        engine,
        _mount: mount,
    }
}

impl Harness {
    /// Create a key and credit its account, returning `(key_id, plaintext)`.
    pub async fn key_with_credits(&self, key_type: tb_core::KeyType, credits: f64) -> (String, String) {
        let created = self
            .store
            .keys()
            .create(CreateKeyParams {
                name: "test-key".into(),
                description: None,
                key_type: Some(key_type),
                prefix: None,
                expires_in_days: None,
                permissions: None,
                metadata: None,
            })
            .await
            .expect("create key");
        if credits != 0.0 {
            self.store
                .billing()
                .adjust_balance(&created.key.id, credits, Some("test credit"))
                .await
                .expect("credit account");
        }
        (created.key.id, created.plaintext)
    }

    /// One request through the router.
    pub async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.app.clone().oneshot(req).await.expect("infallible");
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    /// `POST` a JSON body with a bearer credential.
    pub async fn post_json(
        &self,
        path: &str,
        bearer: &str,
        body: Value,
    ) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("build request");
        self.send(req).await
    }

    /// `GET` with a bearer credential.
    pub async fn get(&self, path: &str, bearer: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
            .body(Body::empty())
            .expect("build request");
        self.send(req).await
    }

    /// `DELETE` with a bearer credential.
    pub async fn delete(&self, path: &str, bearer: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("DELETE")
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
            .body(Body::empty())
            .expect("build request");
        self.send(req).await
    }

    /// `POST /execute` shorthand.
    pub async fn execute(
        &self,
        bearer: &str,
        task: &str,
        workspace_id: &str,
        session_id: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut body = serde_json::json!({ "task": task, "workspace_id": workspace_id });
        if let Some(sid) = session_id {
            body["session_id"] = Value::String(sid.to_string());
        }
        self.post_json("/execute", bearer, body).await
    }
}
