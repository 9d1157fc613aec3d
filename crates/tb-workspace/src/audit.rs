// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session audit sidecars.
//!
//! One small JSON file per session under `<mount>/.sessions/`. Writes are
//! best-effort: the execute path logs a warning and carries on when one
//! fails.

use crate::WorkspaceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Audit record of one session's activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAudit {
    /// Caller-stable session id.
    pub session_id: String,
    /// Engine-assigned thread id.
    pub thread_id: String,
    /// Workspace the session runs against.
    pub workspace_id: String,
    /// Timestamp of the newest task.
    pub last_activity: DateTime<Utc>,
    /// Number of tasks executed in this session.
    pub task_count: u64,
    /// When the session first appeared.
    pub created: DateTime<Utc>,
}

/// Store of session-audit sidecars under `<mount>/.sessions/`.
#[derive(Debug, Clone)]
pub struct SessionAuditStore {
    dir: PathBuf,
}

impl SessionAuditStore {
    /// Directory name of the sidecars under the object mount.
    pub const DIR: &'static str = ".sessions";

    /// Create a store rooted at `mount_root`.
    #[must_use]
    pub fn new(mount_root: &Path) -> Self {
        Self {
            dir: mount_root.join(Self::DIR),
        }
    }

    /// Record a task against a session: bumps `task_count` and
    /// `last_activity`, creating the sidecar on first use.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed ids or filesystem failures (callers on
    /// the hot path swallow those with a warning).
    pub async fn record_task(
        &self,
        session_id: &str,
        thread_id: &str,
        workspace_id: &str,
    ) -> Result<SessionAudit, WorkspaceError> {
        let now = tb_core::now_utc();
        let audit = match self.get(session_id).await? {
            Some(mut existing) => {
                existing.thread_id = thread_id.to_string();
                existing.workspace_id = workspace_id.to_string();
                existing.last_activity = now;
                existing.task_count += 1;
                existing
            }
            None => SessionAudit {
                session_id: session_id.to_string(),
                thread_id: thread_id.to_string(),
                workspace_id: workspace_id.to_string(),
                last_activity: now,
                task_count: 1,
                created: now,
            },
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(&audit).map_err(std::io::Error::other)?;
        tokio::fs::write(self.path_of(session_id)?, bytes).await?;
        Ok(audit)
    }

    /// Read one session's audit record.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed ids; a missing or unreadable sidecar
    /// is `None`.
    pub async fn get(&self, session_id: &str) -> Result<Option<SessionAudit>, WorkspaceError> {
        let path = self.path_of(session_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List every session audit, newest activity first. Unreadable sidecars
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only when the directory exists but cannot be read.
    pub async fn list(&self) -> Result<Vec<SessionAudit>, WorkspaceError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(entry.path()).await
                && let Ok(audit) = serde_json::from_slice::<SessionAudit>(&bytes)
            {
                out.push(audit);
            }
        }
        out.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(out)
    }

    /// Delete one session's sidecar.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotFound`] when no sidecar exists.
    pub async fn delete(&self, session_id: &str) -> Result<(), WorkspaceError> {
        let path = self.path_of(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(WorkspaceError::NotFound {
                what: "session".into(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete sidecars whose `last_activity` is older than `horizon`.
    /// Returns the session ids removed.
    ///
    /// # Errors
    ///
    /// Returns an error only when the directory exists but cannot be read.
    pub async fn cleanup(
        &self,
        horizon: chrono::Duration,
    ) -> Result<Vec<String>, WorkspaceError> {
        let cutoff = tb_core::now_utc() - horizon;
        let mut removed = Vec::new();
        for audit in self.list().await? {
            if audit.last_activity < cutoff
                && self.delete(&audit.session_id).await.is_ok()
            {
                removed.push(audit.session_id);
            }
        }
        Ok(removed)
    }

    fn path_of(&self, session_id: &str) -> Result<PathBuf, WorkspaceError> {
        tb_core::validate_resource_id(session_id)
            .map_err(|reason| WorkspaceError::InvalidId { reason })?;
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> SessionAuditStore {
        SessionAuditStore::new(dir.path())
    }

    #[tokio::test]
    async fn record_task_creates_then_bumps() {
        let dir = tempfile::tempdir().unwrap();
        let audits = store(&dir);

        let first = audits.record_task("s1", "t1", "w1").await.unwrap();
        assert_eq!(first.task_count, 1);

        let second = audits.record_task("s1", "t1", "w1").await.unwrap();
        assert_eq!(second.task_count, 2);
        assert_eq!(second.created, first.created);
        assert!(second.last_activity >= first.last_activity);
    }

    #[tokio::test]
    async fn get_missing_session_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir).get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_orders_by_activity() {
        let dir = tempfile::tempdir().unwrap();
        let audits = store(&dir);
        audits.record_task("old", "t", "w").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        audits.record_task("new", "t", "w").await.unwrap();

        let all = audits.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id, "new");
    }

    #[tokio::test]
    async fn delete_then_delete_again_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let audits = store(&dir);
        audits.record_task("s1", "t", "w").await.unwrap();
        audits.delete("s1").await.unwrap();
        assert!(matches!(
            audits.delete("s1").await,
            Err(WorkspaceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_for_unchanged_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let audits = store(&dir);
        audits.record_task("s1", "t", "w").await.unwrap();

        // Sweep with a future cutoff removes the session.
        let removed = audits.cleanup(chrono::Duration::seconds(-5)).await.unwrap();
        assert_eq!(removed, vec!["s1".to_string()]);
        // A second sweep with the same horizon removes nothing more.
        let removed = audits.cleanup(chrono::Duration::seconds(-5)).await.unwrap();
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn bad_session_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            store(&dir).get("../../etc/passwd").await,
            Err(WorkspaceError::InvalidId { .. })
        ));
    }
}
