// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workspace file surface, session inspection, and retention cleanup.

use crate::error::ApiError;
use crate::validation::validate_path;
use crate::AppState;
use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tb_error::ErrorCode;

/// Query for `GET /workspace/:id/files`.
#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    /// Optional subdirectory to list.
    #[serde(default)]
    path: Option<String>,
}

/// `GET /workspace/:id/files?path=`.
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(path) = query.path.as_deref()
        && !path.is_empty()
    {
        validate_path(path)?;
    }
    let files = state
        .workspaces
        .list_files(&workspace_id, query.path.as_deref())
        .await?;
    Ok(Json(json!({ "workspace_id": workspace_id, "files": files })))
}

/// `POST /workspace/:id/upload` — multipart file payload plus an optional
/// `path` field naming the target subpath (the part's filename otherwise).
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.workspaces.ensure(&workspace_id).await?;

    let mut target_path: Option<String> = None;
    let mut written: Vec<String> = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        ApiError::new(
            ErrorCode::PayloadTooLarge,
            format!("malformed or oversized upload: {err}"),
        )
    })? {
        let field_name = field.name().map(str::to_owned);
        match field_name.as_deref() {
            Some("path") => {
                let value = field
                    .text()
                    .await
                    .map_err(|_| ApiError::validation("path field must be text"))?;
                validate_path(&value)?;
                target_path = Some(value);
            }
            Some("file") | None => {
                let path = match target_path.take() {
                    Some(p) => p,
                    None => {
                        let name = field
                            .file_name()
                            .map(str::to_owned)
                            .ok_or_else(|| ApiError::validation("upload needs a path or filename"))?;
                        validate_path(&name)?;
                        name
                    }
                };
                let bytes = field.bytes().await.map_err(|err| {
                    ApiError::new(
                        ErrorCode::PayloadTooLarge,
                        format!("failed to read upload: {err}"),
                    )
                })?;
                state
                    .workspaces
                    .write_file(&workspace_id, &path, &bytes)
                    .await?;
                written.push(path);
            }
            Some(other) => {
                return Err(ApiError::validation(format!("unexpected field {other:?}")));
            }
        }
    }

    if written.is_empty() {
        return Err(ApiError::validation("upload contained no file"));
    }
    Ok(Json(json!({ "workspace_id": workspace_id, "uploaded": written })))
}

/// `GET /workspace/:id/download/*path`.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    validate_path(&path)?;
    let bytes = state.workspaces.read_file(&workspace_id, &path).await?;
    let filename = path.rsplit('/').next().unwrap_or("download");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

/// `DELETE /workspace/:id/files/*path`.
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, path)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_path(&path)?;
    state.workspaces.delete_file(&workspace_id, &path).await?;
    Ok(Json(json!({ "deleted": path })))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// `GET /sessions` — audit sidecars, newest activity first.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sessions = state.workspaces.session_audits().list().await?;
    Ok(Json(json!({ "sessions": sessions })))
}

/// `GET /sessions/:id`.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let audit = state
        .workspaces
        .session_audits()
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("session"))?;
    Ok(Json(json!({ "session": audit })))
}

/// `DELETE /sessions/:id` — drops the live thread (if any) and the audit
/// sidecar.
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let was_live = state.cache.remove(&session_id).await;
    let had_audit = state
        .workspaces
        .session_audits()
        .delete(&session_id)
        .await
        .is_ok();
    if !was_live && !had_audit {
        return Err(ApiError::not_found("session"));
    }
    Ok(Json(json!({ "deleted": session_id, "was_live": was_live })))
}

/// `GET /sessions/active/list` — in-memory cache entries only.
pub async fn active_sessions(
    State(state): State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let sessions = state.cache.active_sessions().await;
    Json(json!({ "sessions": sessions }))
}

// ---------------------------------------------------------------------------
// Workspaces
// ---------------------------------------------------------------------------

/// `GET /workspaces` — inventory of the object mount.
pub async fn list_workspaces(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let workspaces = state.workspaces.list_workspaces().await?;
    Ok(Json(json!({ "workspaces": workspaces })))
}

/// `DELETE /workspaces/:id`.
pub async fn delete_workspace(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.workspaces.delete_workspace(&workspace_id).await?;
    Ok(Json(json!({ "deleted": workspace_id })))
}

// ---------------------------------------------------------------------------
// Retention cleanup
// ---------------------------------------------------------------------------

/// Body of the cleanup endpoints.
#[derive(Debug, Deserialize)]
pub struct CleanupBody {
    /// Retention horizon in days.
    #[serde(default = "default_horizon_days")]
    older_than_days: u32,
}

fn default_horizon_days() -> u32 {
    7
}

impl Default for CleanupBody {
    fn default() -> Self {
        Self {
            older_than_days: default_horizon_days(),
        }
    }
}

/// `POST /cleanup/sessions` — delete audit sidecars idle past the horizon,
/// plus stale thread-cache metadata.
pub async fn cleanup_sessions(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CleanupBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = body.unwrap_or_default();
    let horizon = chrono::Duration::days(i64::from(body.older_than_days));
    let removed = state.workspaces.session_audits().cleanup(horizon).await?;
    let stale_metadata = state.cache.cleanup_stale().await;
    Ok(Json(json!({
        "removed_sessions": removed,
        "removed_thread_metadata": stale_metadata,
    })))
}

/// `POST /cleanup/workspaces` — delete workspaces untouched past the
/// horizon.
pub async fn cleanup_workspaces(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CleanupBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = body.unwrap_or_default();
    let horizon = chrono::Duration::days(i64::from(body.older_than_days));
    let removed = state.workspaces.cleanup_workspaces(horizon).await?;
    Ok(Json(json!({ "removed_workspaces": removed })))
}
