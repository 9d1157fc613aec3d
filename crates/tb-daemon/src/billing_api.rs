// SPDX-License-Identifier: MIT OR Apache-2.0
//! Billing API.
//!
//! Caller-scoped views over the authenticated key's own account, plus
//! admin-scoped mutations. Allow-list and open-mode callers have no
//! database key and therefore no billing surface.

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tb_core::TransactionType;
use tb_error::ErrorCode;

const MAX_PAGE: u32 = 200;

fn caller_key_id(ctx: &AuthContext) -> Result<&str, ApiError> {
    ctx.key_id.as_deref().ok_or_else(|| {
        ApiError::new(
            ErrorCode::AuthFailed,
            "billing requires a database-backed API key",
        )
    })
}

fn parse_rfc3339(value: Option<&str>, field: &str) -> Result<Option<DateTime<chrono::Utc>>, ApiError> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.to_utc())
                .map_err(|_| ApiError::validation(format!("{field} must be an RFC 3339 timestamp")))
        })
        .transpose()
}

// ---------------------------------------------------------------------------
// Caller-scoped views
// ---------------------------------------------------------------------------

/// `GET /billing/account`.
pub async fn account(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key_id = caller_key_id(&ctx)?;
    let account = state.store.billing().get_or_create_account(key_id).await?;
    Ok(Json(json!({ "account": account })))
}

/// Query for `GET /billing/stats`.
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

/// `GET /billing/stats?from&to`.
pub async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key_id = caller_key_id(&ctx)?;
    let from = parse_rfc3339(query.from.as_deref(), "from")?;
    let to = parse_rfc3339(query.to.as_deref(), "to")?;
    let stats = state.store.billing().usage_stats(key_id, from, to).await?;
    Ok(Json(json!({ "stats": stats })))
}

/// Pagination query.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
    /// Transaction-type filter (transactions endpoint only).
    #[serde(default, rename = "type")]
    tx_type: Option<String>,
}

fn default_limit() -> u32 {
    50
}

/// `GET /billing/usage?limit&offset`.
pub async fn usage(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key_id = caller_key_id(&ctx)?;
    let records = state
        .store
        .billing()
        .usage_records(key_id, query.limit.min(MAX_PAGE), query.offset)
        .await?;
    Ok(Json(json!({ "records": records })))
}

/// `GET /billing/transactions?limit&offset&type`.
pub async fn transactions(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key_id = caller_key_id(&ctx)?;
    let tx_type = query
        .tx_type
        .as_deref()
        .map(|s| {
            TransactionType::parse(s)
                .ok_or_else(|| ApiError::validation(format!("unknown transaction type {s:?}")))
        })
        .transpose()?;
    let transactions = state
        .store
        .billing()
        .transactions(key_id, query.limit.min(MAX_PAGE), query.offset, tx_type)
        .await?;
    Ok(Json(json!({ "transactions": transactions })))
}

/// `GET /billing/workspaces` — per-workspace roll-up.
pub async fn workspaces(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key_id = caller_key_id(&ctx)?;
    let rollup = state.store.billing().usage_by_workspace(key_id).await?;
    Ok(Json(json!({ "workspaces": rollup })))
}

// ---------------------------------------------------------------------------
// Admin-scoped mutations
// ---------------------------------------------------------------------------

/// Body of `POST /billing/admin/:key_id/credits`.
#[derive(Debug, Deserialize)]
pub struct CreditsBody {
    /// Signed amount; positive adds credits.
    pub amount: f64,
    /// Operator note.
    #[serde(default)]
    pub description: Option<String>,
}

/// `POST /billing/admin/:key_id/credits`.
pub async fn add_credits(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<String>,
    Json(body): Json<CreditsBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.amount == 0.0 || !body.amount.is_finite() {
        return Err(ApiError::validation("amount must be a non-zero finite number"));
    }
    // 404 before touching the account.
    state.store.keys().get(&key_id).await?;
    let account = state
        .store
        .billing()
        .adjust_balance(&key_id, body.amount, body.description.as_deref())
        .await?;
    Ok(Json(json!({ "account": account })))
}

/// Body of `POST /billing/admin/:key_id/limits`.
#[derive(Debug, Deserialize)]
pub struct LimitsBody {
    /// Daily cap; `null` clears it.
    #[serde(default)]
    pub daily_limit: Option<f64>,
    /// Monthly cap; `null` clears it.
    #[serde(default)]
    pub monthly_limit: Option<f64>,
}

/// `POST /billing/admin/:key_id/limits`.
pub async fn set_limits(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<String>,
    Json(body): Json<LimitsBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    for limit in [body.daily_limit, body.monthly_limit].into_iter().flatten() {
        if limit < 0.0 || !limit.is_finite() {
            return Err(ApiError::validation("limits must be non-negative finite numbers"));
        }
    }
    state.store.keys().get(&key_id).await?;
    let account = state
        .store
        .billing()
        .set_limits(&key_id, body.daily_limit, body.monthly_limit)
        .await?;
    Ok(Json(json!({ "account": account })))
}

/// `GET /billing/admin/:key_id/stats`.
pub async fn admin_stats(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.keys().get(&key_id).await?;
    let account = state.store.billing().get_or_create_account(&key_id).await?;
    let stats = state.store.billing().usage_stats(&key_id, None, None).await?;
    let limits = state.store.billing().check_limits(&key_id).await?;
    Ok(Json(json!({
        "account": account,
        "stats": stats,
        "limits": limits,
    })))
}
