// SPDX-License-Identifier: MIT OR Apache-2.0
//! Admin key API. All routes sit behind the admin credential.
//!
//! The plaintext key appears exactly once, in the `create` response; every
//! other surface returns only the stored prefix.

use crate::error::ApiError;
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tb_store::{CreateKeyParams, keys::UpdateKeyParams};

/// Cap on `limit` query parameters.
const MAX_PAGE: u32 = 200;

/// Query for `GET /admin/keys`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
    #[serde(default)]
    include_inactive: bool,
}

fn default_limit() -> u32 {
    50
}

/// `POST /admin/keys`.
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(params): Json<CreateKeyParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if params.name.trim().is_empty() {
        return Err(ApiError::validation("name must not be empty"));
    }
    if let Some(prefix) = &params.prefix
        && prefix.len() > tb_core::ids::MAX_KEY_PREFIX_LEN
    {
        return Err(ApiError::validation(format!(
            "prefix exceeds maximum length of {}",
            tb_core::ids::MAX_KEY_PREFIX_LEN
        )));
    }

    let created = state.store.keys().create(params).await?;
    Ok(Json(json!({
        "id": created.key.id,
        "key": created.plaintext,
        "key_prefix": created.key.key_prefix,
        "key_type": created.key.key_type,
        "name": created.key.name,
        "created_at": created.key.created_at,
        "expires_at": created.key.expires_at,
        "permissions": created.key.permissions,
        "metadata": created.key.metadata,
        "warning": "Store this key now; it cannot be retrieved again.",
    })))
}

/// `GET /admin/keys`.
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query.limit.min(MAX_PAGE);
    let (keys, total) = state
        .store
        .keys()
        .list(limit, query.offset, query.include_inactive)
        .await?;
    Ok(Json(json!({
        "keys": keys,
        "total": total,
        "limit": limit,
        "offset": query.offset,
    })))
}

/// `GET /admin/keys/:id` — the key plus its usage summary.
pub async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = state.store.keys().get(&id).await?;
    let usage = state.store.keys().usage_summary(&id, None).await?;
    Ok(Json(json!({ "key": key, "usage": usage })))
}

/// `PATCH /admin/keys/:id`.
pub async fn update_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(params): Json<UpdateKeyParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if params.is_empty() {
        return Err(ApiError::validation("no fields to update"));
    }
    let key = state.store.keys().update(&id, params).await?;
    Ok(Json(json!({ "key": key })))
}

/// `POST /admin/keys/:id/revoke`.
pub async fn revoke_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = state.store.keys().revoke(&id).await?;
    Ok(Json(json!({ "key": key, "revoked": true })))
}

/// `DELETE /admin/keys/:id` — hard delete, cascades billing rows.
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.keys().delete(&id).await?;
    Ok(Json(json!({ "deleted": true })))
}

/// Query for `GET /admin/keys/:id/usage`.
#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    /// RFC 3339 lower bound.
    #[serde(default)]
    since: Option<String>,
}

/// `GET /admin/keys/:id/usage`.
pub async fn key_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // 404 for unknown keys, not an empty summary.
    state.store.keys().get(&id).await?;
    let since = query
        .since
        .as_deref()
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.to_utc())
                .map_err(|_| ApiError::validation("since must be an RFC 3339 timestamp"))
        })
        .transpose()?;
    let usage = state.store.keys().usage_summary(&id, since).await?;
    Ok(Json(json!({ "usage": usage })))
}
