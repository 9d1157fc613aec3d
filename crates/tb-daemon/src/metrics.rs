// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process counters, the execution history ring, and the health and
//! metrics endpoints.

use crate::AppState;
use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use tokio::sync::Mutex;

/// How many execution records the history ring retains.
const HISTORY_CAP: usize = 100;

/// One completed (or failed) execution, for `/metrics/history`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    /// When the execution finished.
    pub timestamp: DateTime<Utc>,
    /// Target workspace.
    pub workspace_id: String,
    /// Session the task ran under.
    pub session_id: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Token total reported by the engine (0 on failures without counts).
    pub total_tokens: u64,
    /// `true` when the engine returned a result.
    pub success: bool,
}

/// Atomic counters shared across all request handlers.
pub struct ServerMetrics {
    executions: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    tokens_total: AtomicU64,
    history: Mutex<VecDeque<ExecutionRecord>>,
}

impl ServerMetrics {
    /// Zero-initialised metrics.
    #[must_use]
    pub fn new() -> Self {
        Self {
            executions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            tokens_total: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
        }
    }

    /// Record one finished execution.
    pub async fn record(&self, record: ExecutionRecord) {
        self.executions.fetch_add(1, Relaxed);
        if !record.success {
            self.errors.fetch_add(1, Relaxed);
        }
        self.tokens_total.fetch_add(record.total_tokens, Relaxed);
        let mut history = self.history.lock().await;
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Count one deadline expiry (these never reach [`Self::record`]).
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Relaxed);
    }

    /// Point-in-time snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions: self.executions.load(Relaxed),
            errors: self.errors.load(Relaxed),
            timeouts: self.timeouts.load(Relaxed),
            tokens_total: self.tokens_total.load(Relaxed),
        }
    }

    /// The newest `limit` history records, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.history
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialisable snapshot of [`ServerMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Executions attempted (success + error).
    pub executions: u64,
    /// Executions that failed.
    pub errors: u64,
    /// Executions abandoned at the deadline.
    pub timeouts: u64,
    /// Tokens accounted across all executions.
    pub tokens_total: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — liveness plus mount/store/cache status.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let database_ok = state.store.ping().await.is_ok();
    let mount_ok = probe_mount(&state).await;
    let active_keys = state.store.keys().count_active().await.unwrap_or(0);
    let live_sessions = state.cache.len().await;

    let status = if database_ok && mount_ok { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "time": tb_core::now_utc().to_rfc3339(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "database": { "ok": database_ok },
        "object_mount": { "ok": mount_ok },
        "keys": { "active": active_keys },
        "cache": {
            "live_sessions": live_sessions,
            "capacity": state.config.cache.max_sessions,
        },
        "metrics": state.metrics.snapshot(),
    }))
}

/// `GET /metrics` — aggregate counters.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "metrics": state.metrics.snapshot(),
        "active_sessions": state.cache.len().await,
    }))
}

/// Query for `GET /metrics/history`.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Maximum records to return (default 20).
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    20
}

/// `GET /metrics/history?limit=N` — recent execution records.
pub async fn metrics_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.min(HISTORY_CAP);
    Json(json!({ "history": state.metrics.recent(limit).await }))
}

async fn probe_mount(state: &AppState) -> bool {
    let root = state.workspaces.root();
    if tokio::fs::create_dir_all(root).await.is_err() {
        return false;
    }
    let probe = root.join(".health-probe");
    let ok = tokio::fs::write(&probe, b"ok").await.is_ok();
    let _ = tokio::fs::remove_file(&probe).await;
    ok
}
