// SPDX-License-Identifier: MIT OR Apache-2.0
//! API-key authentication.
//!
//! Credentials arrive as `Authorization: Bearer`, `X-API-Key`, or (when the
//! operator enables it) `?api_key=`. The hash lookup hits the key store
//! first; the legacy plaintext allow-list is a verbatim fallback; open mode
//! admits anonymous callers only when explicitly configured. Missing
//! credential is 401, present-but-invalid is 403.

use crate::error::ApiError;
use crate::middleware::client_ip;
use crate::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tb_core::KeyType;
use tb_error::ErrorCode;
use tb_store::UsageEvent;
use tracing::{error, warn};

/// Identity attached to every authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Database key id; `None` for allow-list and open-mode callers.
    pub key_id: Option<String>,
    /// Display name.
    pub key_name: String,
    /// Billing class. Allow-list and open-mode callers are `internal`:
    /// nothing to bill against.
    pub key_type: KeyType,
    /// Permission strings.
    pub permissions: Vec<String>,
}

impl AuthContext {
    fn legacy(prefix: &str) -> Self {
        Self {
            key_id: None,
            key_name: format!("legacy:{prefix}"),
            key_type: KeyType::Internal,
            permissions: tb_core::default_permissions(),
        }
    }

    fn anonymous() -> Self {
        Self {
            key_id: None,
            key_name: "open-mode".into(),
            key_type: KeyType::Internal,
            permissions: tb_core::default_permissions(),
        }
    }
}

/// Pull the credential out of a request, in preference order.
pub fn extract_credential(req: &Request, allow_query_param: bool) -> Option<String> {
    if let Some(value) = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.trim().to_string());
    }
    if let Some(value) = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        return Some(value.trim().to_string());
    }
    if allow_query_param
        && let Some(query) = req.uri().query()
    {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("api_key=") {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Authentication middleware for API-key routes.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&req);
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let endpoint = req.uri().path().to_owned();
    let method = req.method().to_string();

    let credential = extract_credential(&req, state.config.auth.allow_query_param);
    let ctx = match resolve(&state, credential).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    if let Some(key_id) = &ctx.key_id {
        let keys = state.store.keys();
        let id = key_id.clone();
        tokio::spawn(async move {
            if let Err(err) = keys.touch_last_used(&id).await {
                warn!(key_id = %id, error = %err, "failed to stamp last_used_at");
            }
        });
    }

    req.extensions_mut().insert(ctx.clone());
    let resp = next.run(req).await;

    // Audit row, off the request path. Only database-backed keys have a
    // row to attach it to.
    if let Some(key_id) = ctx.key_id {
        let keys = state.store.keys();
        let status_code = resp.status().as_u16();
        tokio::spawn(async move {
            let event = UsageEvent {
                key_id,
                endpoint,
                method,
                status_code,
                ip: Some(ip),
                user_agent,
            };
            if let Err(err) = keys.record_usage(event).await {
                warn!(error = %err, "failed to append api key usage row");
            }
        });
    }

    resp
}

async fn resolve(state: &AppState, credential: Option<String>) -> Result<AuthContext, ApiError> {
    let auth = &state.config.auth;
    let Some(credential) = credential else {
        if auth.open_mode {
            return Ok(AuthContext::anonymous());
        }
        return Err(ApiError::new(
            ErrorCode::Unauthenticated,
            "missing API key",
        ));
    };

    match state.store.keys().find_by_plaintext(&credential).await {
        Ok(Some(key)) => {
            if !key.is_usable(tb_core::now_utc()) {
                return Err(ApiError::new(ErrorCode::AuthFailed, "API key expired"));
            }
            Ok(AuthContext {
                key_id: Some(key.id),
                key_name: key.name,
                key_type: key.key_type,
                permissions: key.permissions,
            })
        }
        Ok(None) => legacy_or_reject(auth, &credential),
        Err(err) => {
            // The hash lookup failing is a storage fault, not an auth
            // verdict; the allow-list can still vouch for the caller.
            error!(error = %err, "key lookup failed during authentication");
            legacy_or_reject(auth, &credential).map_err(|_| {
                ApiError::new(ErrorCode::StorageFailed, "authentication unavailable")
            })
        }
    }
}

fn legacy_or_reject(
    auth: &tb_config::AuthConfig,
    credential: &str,
) -> Result<AuthContext, ApiError> {
    if auth
        .legacy_key_allowlist
        .iter()
        .any(|allowed| allowed == credential)
    {
        return Ok(AuthContext::legacy(&tb_core::key_prefix_of(credential)));
    }
    Err(ApiError::new(ErrorCode::AuthFailed, "invalid API key"))
}

/// Middleware guarding `/admin/*` and `/billing/admin/*`.
pub async fn admin_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.auth.admin_credential.as_deref() else {
        return ApiError::new(ErrorCode::AuthFailed, "admin API is disabled").into_response();
    };
    match extract_credential(&req, false) {
        None => ApiError::new(ErrorCode::Unauthenticated, "missing admin credential")
            .into_response(),
        Some(presented) if presented == expected => next.run(req).await,
        Some(_) => {
            ApiError::new(ErrorCode::AuthFailed, "invalid admin credential").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(headers: &[(&str, &str)], uri: &str) -> Request {
        let mut builder = Request::builder().uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn bearer_header_wins() {
        let req = request_with(
            &[("authorization", "Bearer tb_abc"), ("x-api-key", "tb_xyz")],
            "/execute",
        );
        assert_eq!(extract_credential(&req, false).as_deref(), Some("tb_abc"));
    }

    #[test]
    fn x_api_key_is_second_choice() {
        let req = request_with(&[("x-api-key", "tb_xyz")], "/execute");
        assert_eq!(extract_credential(&req, false).as_deref(), Some("tb_xyz"));
    }

    #[test]
    fn query_param_requires_opt_in() {
        let req = request_with(&[], "/execute?api_key=tb_q");
        assert_eq!(extract_credential(&req, false), None);
        let req = request_with(&[], "/execute?api_key=tb_q");
        assert_eq!(extract_credential(&req, true).as_deref(), Some("tb_q"));
    }

    #[test]
    fn missing_credential_is_none() {
        let req = request_with(&[], "/execute");
        assert_eq!(extract_credential(&req, false), None);
    }

    #[test]
    fn legacy_allowlist_matches_verbatim() {
        let auth = tb_config::AuthConfig {
            legacy_key_allowlist: vec!["tb_legacy_1".into()],
            ..Default::default()
        };
        let ctx = legacy_or_reject(&auth, "tb_legacy_1").unwrap();
        assert_eq!(ctx.key_type, KeyType::Internal);
        assert!(ctx.key_id.is_none());
        assert!(legacy_or_reject(&auth, "tb_legacy_2").is_err());
    }
}
