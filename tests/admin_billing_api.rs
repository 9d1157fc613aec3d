// SPDX-License-Identifier: MIT OR Apache-2.0
//! Admin key lifecycle and billing API through the router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{ADMIN_CREDENTIAL, harness};
use serde_json::json;
use tb_core::KeyType;

// ── Key lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn create_list_revoke_delete_key() {
    let h = harness().await;

    // Create: plaintext appears exactly once.
    let (status, created) = h
        .post_json(
            "/admin/keys",
            ADMIN_CREDENTIAL,
            json!({ "name": "ci-bot", "description": "CI automation" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {created}");
    let plaintext = created["key"].as_str().unwrap().to_string();
    let key_id = created["id"].as_str().unwrap().to_string();
    assert!(plaintext.starts_with("tb_"));
    assert_eq!(plaintext.len(), 3 + 64);
    assert!(created["warning"].as_str().unwrap().contains("cannot be retrieved"));

    // List: no plaintext anywhere.
    let (status, listed) = h.get("/admin/keys", ADMIN_CREDENTIAL).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["total"], 1);
    assert!(!listed.to_string().contains(&plaintext));

    // Get: embeds the usage summary.
    let (status, fetched) = h.get(&format!("/admin/keys/{key_id}"), ADMIN_CREDENTIAL).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["key"]["name"], "ci-bot");
    assert!(fetched["usage"]["total_requests"].is_number());

    // Patch.
    let req = Request::builder()
        .method("PATCH")
        .uri(format!("/admin/keys/{key_id}"))
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_CREDENTIAL}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "name": "ci-bot-renamed" }).to_string()))
        .unwrap();
    let (status, patched) = h.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["key"]["name"], "ci-bot-renamed");

    // Revoke: the key stops authenticating.
    let (status, _) = h
        .post_json(
            &format!("/admin/keys/{key_id}/revoke"),
            ADMIN_CREDENTIAL,
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = h.execute(&plaintext, "t", "w1", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Delete: the record is gone.
    let (status, _) = h
        .delete(&format!("/admin/keys/{key_id}"), ADMIN_CREDENTIAL)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = h.get(&format!("/admin/keys/{key_id}"), ADMIN_CREDENTIAL).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_routes_reject_wrong_credential() {
    let h = harness().await;
    let (status, _) = h.get("/admin/keys", "not-the-admin").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let req = Request::builder()
        .uri("/admin/keys")
        .body(Body::empty())
        .unwrap();
    let (status, _) = h.send(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_key_validates_name_and_prefix() {
    let h = harness().await;
    let (status, _) = h
        .post_json("/admin/keys", ADMIN_CREDENTIAL, json!({ "name": "  " }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .post_json(
            "/admin/keys",
            ADMIN_CREDENTIAL,
            json!({ "name": "k", "prefix": "waytoolongprefix" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn internal_key_type_is_honoured() {
    let h = harness().await;
    let (_, created) = h
        .post_json(
            "/admin/keys",
            ADMIN_CREDENTIAL,
            json!({ "name": "ops", "key_type": "internal" }),
        )
        .await;
    assert_eq!(created["key_type"], "internal");
}

// ── Billing ──────────────────────────────────────────────────────────

#[tokio::test]
async fn admin_credits_flow_into_the_callers_account() {
    let h = harness().await;
    let (key_id, plaintext) = h.key_with_credits(KeyType::Standard, 0.0).await;

    let (status, body) = h
        .post_json(
            &format!("/billing/admin/{key_id}/credits"),
            ADMIN_CREDENTIAL,
            json!({ "amount": 25.0, "description": "prepaid top-up" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["account"]["credits_balance"], 25.0);

    // The caller sees the same account.
    let (status, account) = h.get("/billing/account", &plaintext).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(account["account"]["credits_balance"], 25.0);

    // And the purchase shows up filtered by type.
    let (_, txs) = h
        .get("/billing/transactions?type=credit_purchase", &plaintext)
        .await;
    assert_eq!(txs["transactions"].as_array().unwrap().len(), 1);
    assert_eq!(txs["transactions"][0]["amount"], 25.0);
}

#[tokio::test]
async fn credits_for_unknown_key_is_404() {
    let h = harness().await;
    let (status, _) = h
        .post_json(
            "/billing/admin/ghost/credits",
            ADMIN_CREDENTIAL,
            json!({ "amount": 5.0 }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn zero_amount_is_rejected() {
    let h = harness().await;
    let (key_id, _) = h.key_with_credits(KeyType::Standard, 0.0).await;
    let (status, _) = h
        .post_json(
            &format!("/billing/admin/{key_id}/credits"),
            ADMIN_CREDENTIAL,
            json!({ "amount": 0.0 }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn limits_roundtrip_through_admin_stats() {
    let h = harness().await;
    let (key_id, _) = h.key_with_credits(KeyType::Standard, 10.0).await;

    let (status, _) = h
        .post_json(
            &format!("/billing/admin/{key_id}/limits"),
            ADMIN_CREDENTIAL,
            json!({ "daily_limit": 1.5, "monthly_limit": 20.0 }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, stats) = h
        .get(&format!("/billing/admin/{key_id}/stats"), ADMIN_CREDENTIAL)
        .await;
    assert_eq!(stats["account"]["daily_limit"], 1.5);
    assert_eq!(stats["limits"]["within"], true);
}

#[tokio::test]
async fn billing_views_track_usage_after_execution() {
    let h = harness().await;
    let (_, plaintext) = h.key_with_credits(KeyType::Standard, 10.0).await;
    h.engine.push_turn("done", 6548, 108).await;
    h.execute(&plaintext, "task", "w1", None).await;

    let (_, stats) = h.get("/billing/stats", &plaintext).await;
    assert_eq!(stats["stats"]["total_executions"], 1);
    assert_eq!(stats["stats"]["total_tokens"], 6656);

    let (_, usage) = h.get("/billing/usage", &plaintext).await;
    assert_eq!(usage["records"].as_array().unwrap().len(), 1);

    let (_, rollup) = h.get("/billing/workspaces", &plaintext).await;
    assert_eq!(rollup["workspaces"][0]["workspace_id"], "w1");
    assert_eq!(rollup["workspaces"][0]["executions"], 1);
}

#[tokio::test]
async fn legacy_callers_have_no_billing_surface() {
    let h = common::harness_with(|config| {
        config.auth.legacy_key_allowlist = vec!["tb_legacy".into()];
    })
    .await;
    let (status, _) = h.get("/billing/account", "tb_legacy").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
