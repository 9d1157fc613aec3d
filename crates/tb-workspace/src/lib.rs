// SPDX-License-Identifier: MIT OR Apache-2.0
//! tb-workspace
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Per-workspace directory trees on the shared object mount.
//!
//! Layout:
//! - `<mount>/<workspace_id>/…` — workspace files
//! - `<mount>/.sessions/<session_id>.json` — session audit sidecars
//! - `<mount>/.thread-cache/<session_id>.json` — owned by the thread cache
//!
//! Dot-prefixed names are reserved and excluded from enumeration. Every
//! caller-supplied path is validated against traversal before it is joined
//! to the mount.

/// Session audit sidecars.
pub mod audit;

pub use audit::{SessionAudit, SessionAuditStore};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

/// Errors from workspace operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// The workspace or session id is malformed.
    #[error("invalid identifier: {reason}")]
    InvalidId {
        /// Which rule was violated.
        reason: String,
    },

    /// The caller-supplied path is malformed or escapes the workspace.
    #[error("invalid path: {reason}")]
    InvalidPath {
        /// Which rule was violated.
        reason: String,
    },

    /// The workspace or file does not exist.
    #[error("{what} not found")]
    NotFound {
        /// Human-readable name of the missing resource.
        what: String,
    },

    /// Filesystem failure.
    #[error("workspace I/O failed")]
    Io(#[from] std::io::Error),
}

/// One entry in a workspace listing.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    /// Name within its directory.
    pub name: String,
    /// Path relative to the workspace root.
    pub path: String,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// `true` for directories.
    pub is_dir: bool,
}

/// Summary of one workspace directory.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInfo {
    /// Workspace identifier (directory name).
    pub workspace_id: String,
    /// Newest modification time anywhere in the tree.
    pub modified: DateTime<Utc>,
    /// Number of files (not directories), dot-entries excluded.
    pub file_count: u64,
    /// Total size of those files in bytes.
    pub total_bytes: u64,
}

/// Manager of per-workspace directories rooted at the object mount.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager rooted at `root`. The directory itself is created
    /// lazily by [`WorkspaceManager::ensure`].
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The mount root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure the workspace directory exists and carries a version-control
    /// marker. Idempotent; safe under concurrent callers.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed ids or filesystem failures. A failed
    /// VCS init is logged and tolerated (the directory still works).
    pub async fn ensure(&self, workspace_id: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.dir_of(workspace_id)?;
        tokio::fs::create_dir_all(&path).await?;
        ensure_vcs_marker(&path).await;
        Ok(path)
    }

    /// Absolute path of a workspace directory, without creating it.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed ids.
    pub fn dir_of(&self, workspace_id: &str) -> Result<PathBuf, WorkspaceError> {
        tb_core::validate_resource_id(workspace_id)
            .map_err(|reason| WorkspaceError::InvalidId { reason })?;
        Ok(self.root.join(workspace_id))
    }

    /// Resolve a caller-supplied relative path inside a workspace.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed ids or unsafe paths.
    pub fn resolve(&self, workspace_id: &str, rel_path: &str) -> Result<PathBuf, WorkspaceError> {
        let dir = self.dir_of(workspace_id)?;
        tb_core::validate_relative_path(rel_path)
            .map_err(|reason| WorkspaceError::InvalidPath { reason })?;
        Ok(dir.join(rel_path))
    }

    /// List a workspace directory (or a subdirectory of it), excluding
    /// dot-prefixed names.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotFound`] for unknown workspaces or
    /// subpaths.
    pub async fn list_files(
        &self,
        workspace_id: &str,
        subpath: Option<&str>,
    ) -> Result<Vec<FileEntry>, WorkspaceError> {
        let base = match subpath {
            Some(p) if !p.is_empty() => self.resolve(workspace_id, p)?,
            _ => self.dir_of(workspace_id)?,
        };
        if !base.is_dir() {
            return Err(WorkspaceError::NotFound {
                what: "directory".into(),
            });
        }

        let workspace_root = self.dir_of(workspace_id)?;
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&base).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await?;
            let rel = entry
                .path()
                .strip_prefix(&workspace_root)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|_| name.clone());
            out.push(FileEntry {
                name,
                path: rel,
                size: if meta.is_dir() { 0 } else { meta.len() },
                modified: modified_of(&meta),
                is_dir: meta.is_dir(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Write a file inside a workspace, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error for unsafe paths or filesystem failures.
    pub async fn write_file(
        &self,
        workspace_id: &str,
        rel_path: &str,
        bytes: &[u8],
    ) -> Result<(), WorkspaceError> {
        let path = self.resolve(workspace_id, rel_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(workspace_id, path = rel_path, size = bytes.len(), "file written");
        Ok(())
    }

    /// Read a file from a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotFound`] when the file does not exist.
    pub async fn read_file(
        &self,
        workspace_id: &str,
        rel_path: &str,
    ) -> Result<Vec<u8>, WorkspaceError> {
        let path = self.resolve(workspace_id, rel_path)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(WorkspaceError::NotFound {
                what: "file".into(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a file from a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotFound`] when the file does not exist.
    pub async fn delete_file(
        &self,
        workspace_id: &str,
        rel_path: &str,
    ) -> Result<(), WorkspaceError> {
        let path = self.resolve(workspace_id, rel_path)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(WorkspaceError::NotFound {
                what: "file".into(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Inventory of all workspaces on the mount, dot-directories excluded.
    ///
    /// # Errors
    ///
    /// Returns an error when the mount cannot be read; a missing mount is an
    /// empty inventory.
    pub async fn list_workspaces(&self) -> Result<Vec<WorkspaceInfo>, WorkspaceError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.metadata().await?.is_dir() {
                continue;
            }
            out.push(summarize(&entry.path(), &name));
        }
        out.sort_by(|a, b| a.workspace_id.cmp(&b.workspace_id));
        Ok(out)
    }

    /// Delete one workspace tree.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotFound`] for unknown workspaces.
    pub async fn delete_workspace(&self, workspace_id: &str) -> Result<(), WorkspaceError> {
        let path = self.dir_of(workspace_id)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(WorkspaceError::NotFound {
                what: "workspace".into(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete workspaces whose newest modification is older than `horizon`.
    /// Returns the ids removed.
    ///
    /// # Errors
    ///
    /// Returns an error when the mount cannot be enumerated; individual
    /// deletion failures are skipped.
    pub async fn cleanup_workspaces(
        &self,
        horizon: chrono::Duration,
    ) -> Result<Vec<String>, WorkspaceError> {
        let cutoff = tb_core::now_utc() - horizon;
        let mut removed = Vec::new();
        for info in self.list_workspaces().await? {
            if info.modified < cutoff
                && tokio::fs::remove_dir_all(self.root.join(&info.workspace_id))
                    .await
                    .is_ok()
            {
                removed.push(info.workspace_id);
            }
        }
        Ok(removed)
    }

    /// The session-audit store sharing this mount.
    #[must_use]
    pub fn session_audits(&self) -> SessionAuditStore {
        SessionAuditStore::new(&self.root)
    }
}

/// Initializes a git repo at `path` with a baseline commit if one does not
/// already exist. Failures are tolerated: a workspace without the marker
/// still serves files.
async fn ensure_vcs_marker(path: &Path) {
    if path.join(".git").exists() {
        return;
    }

    let _ = Command::new("git")
        .args(["init", "-q"])
        .current_dir(path)
        .status()
        .await;

    // Baseline commit with a local identity so later diffs are meaningful.
    let _ = Command::new("git")
        .args([
            "-c",
            "user.name=testbase",
            "-c",
            "user.email=testbase@local",
            "commit",
            "--allow-empty",
            "-qm",
            "workspace init",
        ])
        .current_dir(path)
        .status()
        .await;
}

fn modified_of(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| tb_core::now_utc())
}

fn summarize(path: &Path, name: &str) -> WorkspaceInfo {
    let mut newest = DateTime::<Utc>::MIN_UTC;
    let mut file_count = 0;
    let mut total_bytes = 0;
    for entry in WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e
                    .file_name()
                    .to_string_lossy()
                    .starts_with('.')
        })
        .flatten()
    {
        if let Ok(meta) = entry.metadata() {
            let modified = modified_of(&meta);
            if modified > newest {
                newest = modified;
            }
            if meta.is_file() {
                file_count += 1;
                total_bytes += meta.len();
            }
        }
    }
    if newest == DateTime::<Utc>::MIN_UTC {
        newest = tb_core::now_utc();
    }
    WorkspaceInfo {
        workspace_id: name.to_string(),
        modified: newest,
        file_count,
        total_bytes,
    }
}
