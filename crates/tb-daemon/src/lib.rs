// SPDX-License-Identifier: MIT OR Apache-2.0
//! tb-daemon
#![deny(unsafe_code)]
//!
//! The HTTP control plane: authentication, budgeting, workspace file
//! surface, session inspection, and the `/execute` hot path.
//!
//! Middleware runs outside-in: CORS, request id, audit log, global rate
//! limit, then (on protected routes) API-key auth and (on `/execute`) the
//! execute rate limit. Handlers return `Result<_, ApiError>`; the error
//! carries its own status via the taxonomy code.

/// Admin key API.
pub mod admin;
/// API-key authentication middleware.
pub mod auth;
/// Billing API (caller-scoped and admin-scoped).
pub mod billing_api;
/// Error envelope.
pub mod error;
/// The `/execute` hot path.
pub mod execute;
/// Workspace files, sessions, workspaces, cleanup.
pub mod files;
/// Health, metrics, and the execution history ring.
pub mod metrics;
/// Request ids, audit logging, rate limiting, CORS.
pub mod middleware;
/// Request validation.
pub mod validation;

pub use error::ApiError;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::{Next, from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use middleware::IpRateLimiter;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tb_cache::SessionCache;
use tb_config::ServerConfig;
use tb_core::Pricing;
use tb_engine::{Engine, EngineThread};
use tb_error::ErrorCode;
use tb_store::Store;
use tb_workspace::WorkspaceManager;

/// Maximum JSON body size (10 MiB).
pub const MAX_JSON_BODY: usize = 10 * 1024 * 1024;

/// Maximum upload size (100 MiB).
pub const MAX_UPLOAD_BODY: usize = 100 * 1024 * 1024;

/// Shared state behind every handler.
pub struct AppState {
    /// Daemon configuration.
    pub config: ServerConfig,
    /// Key and billing store.
    pub store: Store,
    /// Live engine threads keyed by session id.
    pub cache: SessionCache<Box<dyn EngineThread>>,
    /// Workspace directories on the object mount.
    pub workspaces: WorkspaceManager,
    /// The execution engine.
    pub engine: Arc<dyn Engine>,
    /// In-process counters and execution history.
    pub metrics: metrics::ServerMetrics,
    /// Token pricing for cost calculation.
    pub pricing: Pricing,
    /// Global per-IP limiter.
    pub global_limiter: IpRateLimiter,
    /// Additional per-IP limiter on `/execute`.
    pub execute_limiter: IpRateLimiter,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    /// Assemble state from its parts.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        store: Store,
        engine: Arc<dyn Engine>,
    ) -> Self {
        let mount = std::path::PathBuf::from(&config.storage.object_mount_path);
        let window = Duration::from_secs(config.rate_limit.window_secs);
        Self {
            cache: SessionCache::new(
                &mount,
                config.cache.max_sessions,
                Duration::from_secs(config.cache.ttl_hours * 3600),
            ),
            workspaces: WorkspaceManager::new(&mount),
            metrics: metrics::ServerMetrics::new(),
            pricing: Pricing {
                input_per_1k: config.pricing.input_per_1k,
                output_per_1k: config.pricing.output_per_1k,
            },
            global_limiter: IpRateLimiter::new(config.rate_limit.global_max, window),
            execute_limiter: IpRateLimiter::new(config.rate_limit.execute_max, window),
            started_at: Instant::now(),
            config,
            store,
            engine,
        }
    }
}

/// Build the full router.
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/health", get(metrics::health))
        .route("/metrics", get(metrics::metrics))
        .route("/metrics/history", get(metrics::metrics_history));

    // The execute limiter sits outside auth: quota is spent before the key
    // is even looked at, mirroring the global limiter.
    let execute = Router::new()
        .route("/execute", post(execute::handle))
        .layer(from_fn_with_state(Arc::clone(&state), auth::auth_middleware))
        .layer(from_fn_with_state(
            Arc::clone(&state),
            execute_rate_limit_middleware,
        ));

    let protected = Router::new()
        .route("/cache/clear", post(cache_clear))
        .route("/workspace/{id}/files", get(files::list_files))
        .route(
            "/workspace/{id}/upload",
            post(files::upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY)),
        )
        .route("/workspace/{id}/download/{*path}", get(files::download))
        .route("/workspace/{id}/files/{*path}", delete(files::delete_file))
        .route("/sessions", get(files::list_sessions))
        .route("/sessions/active/list", get(files::active_sessions))
        .route(
            "/sessions/{id}",
            get(files::get_session).delete(files::delete_session),
        )
        .route("/workspaces", get(files::list_workspaces))
        .route("/workspaces/{id}", delete(files::delete_workspace))
        .route("/cleanup/sessions", post(files::cleanup_sessions))
        .route("/cleanup/workspaces", post(files::cleanup_workspaces))
        .route("/billing/account", get(billing_api::account))
        .route("/billing/stats", get(billing_api::stats))
        .route("/billing/usage", get(billing_api::usage))
        .route("/billing/transactions", get(billing_api::transactions))
        .route("/billing/workspaces", get(billing_api::workspaces))
        .layer(from_fn_with_state(Arc::clone(&state), auth::auth_middleware));

    let protected = protected.merge(execute);

    let admin = Router::new()
        .route("/admin/keys", post(admin::create_key).get(admin::list_keys))
        .route(
            "/admin/keys/{id}",
            get(admin::get_key)
                .patch(admin::update_key)
                .delete(admin::delete_key),
        )
        .route("/admin/keys/{id}/revoke", post(admin::revoke_key))
        .route("/admin/keys/{id}/usage", get(admin::key_usage))
        .route("/billing/admin/{key_id}/credits", post(billing_api::add_credits))
        .route("/billing/admin/{key_id}/limits", post(billing_api::set_limits))
        .route("/billing/admin/{key_id}/stats", get(billing_api::admin_stats))
        .layer(from_fn_with_state(Arc::clone(&state), auth::admin_middleware));

    Router::new()
        .merge(public)
        .merge(protected)
        .merge(admin)
        .layer(from_fn_with_state(
            Arc::clone(&state),
            global_rate_limit_middleware,
        ))
        .layer(from_fn(middleware::audit_log_middleware))
        .layer(from_fn(middleware::request_id_middleware))
        .layer(middleware::cors_layer(&state.config.http.cors_origin))
        .layer(DefaultBodyLimit::max(MAX_JSON_BODY))
        .with_state(state)
}

async fn global_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let ip = middleware::client_ip(&req);
    if !state.global_limiter.check(&ip).await {
        return ApiError::new(ErrorCode::RateLimited, "too many requests").into_response();
    }
    next.run(req).await
}

async fn execute_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let ip = middleware::client_ip(&req);
    if !state.execute_limiter.check(&ip).await {
        return ApiError::new(ErrorCode::RateLimited, "execute rate limit exceeded")
            .into_response();
    }
    next.run(req).await
}

/// `POST /cache/clear` — drop every in-memory session (sidecars survive).
async fn cache_clear(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cleared = state.cache.clear().await;
    Json(json!({ "cleared": cleared }))
}
