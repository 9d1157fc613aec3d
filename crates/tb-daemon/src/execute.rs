// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `/execute` hot path.
//!
//! validate → budget gate → workspace → resolve/open thread → run under the
//! deadline → session bookkeeping → usage + deduction → respond.
//!
//! Ordering rules:
//! - the engine call is the only step allowed to take minutes
//! - a budget violation always surfaces; a budget *bookkeeping* fault fails
//!   open (availability over perfect accounting)
//! - once the engine has run, billing failures no longer fail the request
//! - on deadline: 504, no usage record, no deduction; the abandoned thread
//!   is dropped from the cache

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::metrics::ExecutionRecord;
use crate::validation::{ExecuteRequest, validate_execute};
use crate::AppState;
use axum::extract::State;
use axum::{Extension, Json};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tb_cache::Lookup;
use tb_core::KeyType;
use tb_engine::{EngineThread, ThreadOptions};
use tb_error::ErrorCode;
use tb_store::{NewUsageRecord, RunStatus};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Token usage portion of the response.
#[derive(Debug, Serialize)]
pub struct UsageInfo {
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Completion-side tokens.
    pub output_tokens: u64,
    /// `input + output`.
    pub total_tokens: u64,
    /// Cost at the configured pricing.
    pub total_cost: f64,
}

/// Billing portion of the response (standard keys only).
#[derive(Debug, Serialize)]
pub struct BillingInfo {
    /// Balance after the deduction.
    pub balance_after: f64,
    /// Lifetime spend after the deduction.
    pub total_spent: f64,
}

/// Body of a successful `POST /execute`.
#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    /// Final engine text.
    pub output: String,
    /// Session id to echo back for continuity.
    pub session_id: String,
    /// Workspace the task ran against.
    pub workspace_id: String,
    /// Token usage, when the engine reported any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
    /// Billing outcome, for priced keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing: Option<BillingInfo>,
}

/// `POST /execute`.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    validate_execute(&req)?;
    enforce_budget(&state, &ctx).await?;

    let workspace_path = state.workspaces.ensure(&req.workspace_id).await?;
    let started = Instant::now();

    let (session_id, handle, is_new_session) =
        resolve_thread(&state, &req, &workspace_path).await?;

    let deadline = Duration::from_secs(state.config.execute.timeout_secs);
    let turn = {
        let mut thread = handle.lock().await;
        match tokio::time::timeout(deadline, thread.run(&req.task)).await {
            Err(_) => {
                // The engine call is abandoned; the thread's state is
                // unknown, so the session entry goes with it.
                state.metrics.record_timeout();
                state.cache.remove(&session_id).await;
                warn!(%session_id, workspace_id = %req.workspace_id,
                    "execute deadline elapsed, abandoning engine call");
                return Err(ApiError::new(
                    ErrorCode::ExecuteTimeout,
                    "execute deadline elapsed",
                ));
            }
            Ok(Err(engine_err)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                settle_failure(&state, &ctx, &req, &session_id, &engine_err, duration_ms).await;
                return Err(engine_err.into());
            }
            Ok(Ok(turn)) => turn,
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    state.cache.touch(&session_id, &turn.thread_id).await;

    // Session audit is best-effort: a sidecar failure never fails the task.
    if let Err(err) = state
        .workspaces
        .session_audits()
        .record_task(&session_id, &turn.thread_id, &req.workspace_id)
        .await
    {
        warn!(%session_id, error = %err, "failed to write session audit sidecar");
    }

    state
        .metrics
        .record(ExecutionRecord {
            timestamp: tb_core::now_utc(),
            workspace_id: req.workspace_id.clone(),
            session_id: session_id.clone(),
            duration_ms,
            total_tokens: turn.usage.total(),
            success: true,
        })
        .await;

    let costs = state
        .pricing
        .cost_of(turn.usage.input_tokens, turn.usage.output_tokens);
    let billing = settle_success(&state, &ctx, &req, &session_id, &turn, costs, duration_ms).await;

    info!(
        %session_id,
        workspace_id = %req.workspace_id,
        is_new_session,
        duration_ms,
        total_tokens = turn.usage.total(),
        "task executed"
    );

    let usage = (turn.usage.total() > 0).then(|| UsageInfo {
        input_tokens: turn.usage.input_tokens,
        output_tokens: turn.usage.output_tokens,
        total_tokens: turn.usage.total(),
        total_cost: costs.total_cost,
    });

    Ok(Json(ExecuteResponse {
        output: turn.final_text,
        session_id,
        workspace_id: req.workspace_id,
        usage,
        billing,
    }))
}

/// Pre-flight budget gate. Applies only to priced keys; violations surface,
/// bookkeeping faults fail open.
async fn enforce_budget(state: &AppState, ctx: &AuthContext) -> Result<(), ApiError> {
    if ctx.key_type != KeyType::Standard {
        return Ok(());
    }
    let Some(key_id) = &ctx.key_id else {
        return Ok(());
    };
    let billing = state.store.billing();

    let account = match billing.get_or_create_account(key_id).await {
        Ok(account) => account,
        Err(err) => {
            error!(%key_id, error = %err, "budget check unavailable, failing open");
            return Ok(());
        }
    };
    if account.credits_balance <= 0.0 {
        return Err(ApiError::new(
            ErrorCode::InsufficientCredits,
            "insufficient credits",
        )
        .with_detail("current_balance", account.credits_balance));
    }

    match billing.check_limits(key_id).await {
        Ok(check) if !check.within => {
            let reason = check
                .reason
                .unwrap_or_else(|| "spending limit reached".into());
            Err(ApiError::new(ErrorCode::BudgetLimitExceeded, reason.clone())
                .with_detail("reason", reason)
                .with_detail("daily_usage", check.daily_usage)
                .with_detail("monthly_usage", check.monthly_usage))
        }
        Ok(_) => Ok(()),
        Err(err) => {
            error!(%key_id, error = %err, "limit check unavailable, failing open");
            Ok(())
        }
    }
}

type ThreadHandle = Arc<Mutex<Box<dyn EngineThread>>>;

/// Find the session's live thread or open a fresh one, returning the
/// session id the response will carry.
async fn resolve_thread(
    state: &AppState,
    req: &ExecuteRequest,
    workspace_path: &Path,
) -> Result<(String, ThreadHandle, bool), ApiError> {
    if let Some(session_id) = &req.session_id {
        match state.cache.get(session_id).await {
            Lookup::Live { handle, .. } => return Ok((session_id.clone(), handle, false)),
            Lookup::Restartable(meta) => {
                warn!(
                    %session_id,
                    previous_thread = %meta.thread_id,
                    "session survived a host restart; opening a fresh engine thread"
                );
            }
            Lookup::Miss => {}
        }
        let thread = open_thread(state, req, workspace_path).await?;
        let thread_id = thread_id_of(thread.as_ref(), session_id);
        let handle = state
            .cache
            .set(session_id, &thread_id, &req.workspace_id, thread)
            .await;
        return Ok((session_id.clone(), handle, true));
    }

    // No session supplied: the engine-assigned thread id becomes the
    // session id the client stores.
    let thread = open_thread(state, req, workspace_path).await?;
    let session_id = thread
        .thread_id()
        .filter(|id| tb_core::validate_resource_id(id).is_ok())
        .map(str::to_string)
        .unwrap_or_else(tb_core::new_id);
    let thread_id = thread_id_of(thread.as_ref(), &session_id);
    let handle = state
        .cache
        .set(&session_id, &thread_id, &req.workspace_id, thread)
        .await;
    Ok((session_id, handle, true))
}

async fn open_thread(
    state: &AppState,
    req: &ExecuteRequest,
    workspace_path: &Path,
) -> Result<Box<dyn EngineThread>, ApiError> {
    let options = ThreadOptions::rooted_at(workspace_path)
        .with_mcp_servers(req.mcp_servers.clone());
    Ok(state.engine.open_thread(options).await?)
}

fn thread_id_of(thread: &dyn EngineThread, fallback: &str) -> String {
    thread
        .thread_id()
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}

/// Post-flight settlement of a successful turn. Billing failures are logged
/// loudly and never undo the execution.
async fn settle_success(
    state: &AppState,
    ctx: &AuthContext,
    req: &ExecuteRequest,
    session_id: &str,
    turn: &tb_engine::TurnResult,
    costs: tb_core::CostBreakdown,
    duration_ms: u64,
) -> Option<BillingInfo> {
    if ctx.key_type != KeyType::Standard || turn.usage.is_empty() {
        return None;
    }
    let key_id = ctx.key_id.as_deref()?;
    let billing = state.store.billing();

    if let Err(err) = billing
        .record_usage(NewUsageRecord {
            api_key_id: key_id.to_string(),
            session_id: Some(session_id.to_string()),
            workspace_id: req.workspace_id.clone(),
            input_tokens: turn.usage.input_tokens,
            output_tokens: turn.usage.output_tokens,
            input_cost: costs.input_cost,
            output_cost: costs.output_cost,
            model: turn.model.clone().unwrap_or_else(|| "unknown".into()),
            duration_ms,
            status: RunStatus::Success,
            endpoint: "/execute".into(),
        })
        .await
    {
        error!(key_id, error = %err, "failed to append usage record after execution");
    }

    match billing
        .deduct_usage(
            key_id,
            costs.total_cost,
            Some(&format!("Task execution: {}", req.workspace_id)),
        )
        .await
    {
        Ok(account) => Some(BillingInfo {
            balance_after: account.credits_balance,
            total_spent: account.total_spent,
        }),
        Err(err) => {
            // The task already ran; surface the output and reconcile later.
            error!(key_id, error = %err,
                "credit deduction failed after execution; balance not charged");
            None
        }
    }
}

/// Post-flight settlement of an engine failure: an error-status usage
/// record when token counts are available, never a deduction.
async fn settle_failure(
    state: &AppState,
    ctx: &AuthContext,
    req: &ExecuteRequest,
    session_id: &str,
    engine_err: &tb_engine::EngineError,
    duration_ms: u64,
) {
    let partial = engine_err.partial_usage();
    state
        .metrics
        .record(ExecutionRecord {
            timestamp: tb_core::now_utc(),
            workspace_id: req.workspace_id.clone(),
            session_id: session_id.to_string(),
            duration_ms,
            total_tokens: partial.map(|u| u.total()).unwrap_or(0),
            success: false,
        })
        .await;

    if ctx.key_type != KeyType::Standard {
        return;
    }
    let (Some(key_id), Some(usage)) = (ctx.key_id.as_deref(), partial) else {
        return;
    };
    let costs = state
        .pricing
        .cost_of(usage.input_tokens, usage.output_tokens);
    if let Err(err) = state
        .store
        .billing()
        .record_usage(NewUsageRecord {
            api_key_id: key_id.to_string(),
            session_id: Some(session_id.to_string()),
            workspace_id: req.workspace_id.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            input_cost: costs.input_cost,
            output_cost: costs.output_cost,
            model: "unknown".into(),
            duration_ms,
            status: RunStatus::Error,
            endpoint: "/execute".into(),
        })
        .await
    {
        error!(key_id, error = %err, "failed to append error usage record");
    }
}
