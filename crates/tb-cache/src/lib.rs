// SPDX-License-Identifier: MIT OR Apache-2.0
//! tb-cache
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Session-scoped cache of live engine threads.
//!
//! At most one live conversation exists per session id on this host. The
//! cache is a strict LRU with a hard capacity bound and idle TTL; every
//! mutation persists a small JSON metadata sidecar to the object mount so a
//! restarted host can tell "this session existed" apart from "never seen".
//! The engine handle itself is not persistable — after a restart the caller
//! opens a fresh thread and the sidecar is the audit trail.

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Persisted sidecar describing one session's thread.
///
/// Lives at `<mount>/.thread-cache/<session_id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMetadata {
    /// Engine-assigned thread id.
    pub thread_id: String,
    /// Caller-stable session id (the cache key).
    pub session_id: String,
    /// Workspace the thread is rooted at.
    pub workspace_id: String,
    /// When the thread was first opened.
    pub created: DateTime<Utc>,
    /// Last time the session was used.
    pub last_accessed: DateTime<Utc>,
}

/// Result of a cache lookup.
pub enum Lookup<T> {
    /// A live thread exists; the handle's mutex serializes turns.
    Live {
        /// Shared handle to the engine thread.
        handle: Arc<Mutex<T>>,
        /// Current metadata snapshot.
        meta: ThreadMetadata,
    },
    /// No live thread, but a fresh sidecar proves the session existed
    /// before a restart. The caller opens a new thread and logs recovery.
    Restartable(ThreadMetadata),
    /// The session is unknown (or its sidecar had expired and was removed).
    Miss,
}

struct Slot<T> {
    meta: ThreadMetadata,
    handle: Arc<Mutex<T>>,
}

/// Bounded LRU of live engine threads keyed by session id.
pub struct SessionCache<T> {
    inner: Mutex<LruCache<String, Slot<T>>>,
    metadata_dir: PathBuf,
    ttl: Duration,
}

impl<T: Send + 'static> SessionCache<T> {
    /// Directory name of the sidecars under the object mount.
    pub const METADATA_DIR: &'static str = ".thread-cache";

    /// Create a cache holding at most `capacity` sessions with the given
    /// idle TTL, persisting sidecars under `mount_root`.
    ///
    /// `capacity` is clamped to at least 1.
    #[must_use]
    pub fn new(mount_root: &Path, capacity: usize, ttl: std::time::Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            metadata_dir: mount_root.join(Self::METADATA_DIR),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(24)),
        }
    }

    /// Look up a session.
    ///
    /// A live hit refreshes recency and TTL. A miss consults the sidecar:
    /// fresh metadata yields [`Lookup::Restartable`]; expired metadata is
    /// deleted and reported as a miss.
    pub async fn get(&self, session_id: &str) -> Lookup<T> {
        let now = tb_core::now_utc();
        {
            let mut cache = self.inner.lock().await;
            if let Some(slot) = cache.get_mut(session_id) {
                if now - slot.meta.last_accessed <= self.ttl {
                    slot.meta.last_accessed = now;
                    return Lookup::Live {
                        handle: Arc::clone(&slot.handle),
                        meta: slot.meta.clone(),
                    };
                }
                // Idle too long: purge both memory and sidecar.
                debug!(session_id, "session expired, purging");
                cache.pop(session_id);
                self.spawn_delete_sidecar(session_id);
                return Lookup::Miss;
            }
        }

        match self.read_sidecar(session_id).await {
            Some(meta) if now - meta.last_accessed <= self.ttl => Lookup::Restartable(meta),
            Some(_) => {
                self.spawn_delete_sidecar(session_id);
                Lookup::Miss
            }
            None => Lookup::Miss,
        }
    }

    /// Insert or replace a session's thread and persist its sidecar.
    ///
    /// Returns the shared handle. When the cache is full the LRU entry is
    /// evicted and its dispose hook (a sidecar refresh) runs on a detached
    /// task.
    pub async fn set(
        &self,
        session_id: &str,
        thread_id: &str,
        workspace_id: &str,
        handle: T,
    ) -> Arc<Mutex<T>> {
        let now = tb_core::now_utc();
        let handle = Arc::new(Mutex::new(handle));
        let meta = {
            let mut cache = self.inner.lock().await;
            let created = cache
                .peek(session_id)
                .map(|slot| slot.meta.created)
                .unwrap_or(now);
            let meta = ThreadMetadata {
                thread_id: thread_id.to_string(),
                session_id: session_id.to_string(),
                workspace_id: workspace_id.to_string(),
                created,
                last_accessed: now,
            };
            let evicted = cache.push(
                session_id.to_string(),
                Slot {
                    meta: meta.clone(),
                    handle: Arc::clone(&handle),
                },
            );
            if let Some((old_key, old_slot)) = evicted
                && old_key != session_id
            {
                debug!(session_id = %old_key, "evicting least-recently-used session");
                self.spawn_persist_sidecar(old_slot.meta);
            }
            meta
        };

        // The inserted entry's sidecar is written inline: this path already
        // does I/O and the sidecar is what restart recovery depends on.
        if let Err(err) = self.persist_sidecar(&meta).await {
            warn!(session_id, error = %err, "failed to persist thread metadata");
        }
        handle
    }

    /// Refresh a live session after a turn: bump recency, adopt the
    /// engine-reported thread id, and rewrite the sidecar. No-op for
    /// sessions that are not live.
    pub async fn touch(&self, session_id: &str, thread_id: &str) {
        let meta = {
            let mut cache = self.inner.lock().await;
            let Some(slot) = cache.get_mut(session_id) else {
                return;
            };
            slot.meta.last_accessed = tb_core::now_utc();
            slot.meta.thread_id = thread_id.to_string();
            slot.meta.clone()
        };
        if let Err(err) = self.persist_sidecar(&meta).await {
            warn!(session_id, error = %err, "failed to refresh thread metadata");
        }
    }

    /// Remove a session from memory and best-effort remove its sidecar.
    ///
    /// Returns `true` when a live entry was removed.
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.inner.lock().await.pop(session_id).is_some();
        self.spawn_delete_sidecar(session_id);
        removed
    }

    /// Drop every in-memory entry, leaving sidecars in place. Returns the
    /// number of entries dropped.
    pub async fn clear(&self) -> usize {
        let mut cache = self.inner.lock().await;
        let n = cache.len();
        cache.clear();
        n
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// `true` when no session is live.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Metadata snapshots of every live session, most recently used first.
    pub async fn active_sessions(&self) -> Vec<ThreadMetadata> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|(_, slot)| slot.meta.clone())
            .collect()
    }

    /// Delete sidecars whose `created` is older than the cache TTL.
    /// Returns the number of files removed. Unreadable files are skipped.
    pub async fn cleanup_stale(&self) -> usize {
        let now = tb_core::now_utc();
        let mut removed = 0;
        let Ok(mut entries) = tokio::fs::read_dir(&self.metadata_dir).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let Ok(meta) = serde_json::from_slice::<ThreadMetadata>(&bytes) else {
                // Unparseable sidecars are junk; drop them too.
                if tokio::fs::remove_file(&path).await.is_ok() {
                    removed += 1;
                }
                continue;
            };
            if now - meta.created > self.ttl && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    fn sidecar_path(&self, session_id: &str) -> PathBuf {
        self.metadata_dir.join(format!("{session_id}.json"))
    }

    async fn read_sidecar(&self, session_id: &str) -> Option<ThreadMetadata> {
        let bytes = tokio::fs::read(self.sidecar_path(session_id)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn persist_sidecar(&self, meta: &ThreadMetadata) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.metadata_dir).await?;
        let bytes = serde_json::to_vec_pretty(meta).map_err(std::io::Error::other)?;
        tokio::fs::write(self.sidecar_path(&meta.session_id), bytes).await
    }

    fn spawn_persist_sidecar(&self, meta: ThreadMetadata) {
        let dir = self.metadata_dir.clone();
        tokio::spawn(async move {
            if let Err(err) = persist_to(&dir, &meta).await {
                warn!(session_id = %meta.session_id, error = %err,
                    "failed to persist thread metadata on evict");
            }
        });
    }

    fn spawn_delete_sidecar(&self, session_id: &str) {
        let path = self.sidecar_path(session_id);
        tokio::spawn(async move {
            let _ = tokio::fs::remove_file(path).await;
        });
    }
}

async fn persist_to(dir: &Path, meta: &ThreadMetadata) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let bytes = serde_json::to_vec_pretty(meta).map_err(std::io::Error::other)?;
    tokio::fs::write(dir.join(format!("{}.json", meta.session_id)), bytes).await
}
