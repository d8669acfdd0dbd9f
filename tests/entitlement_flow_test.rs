//! End-to-end flows through the HTTP surface: webhook delivery, status,
//! promo redemption, checkout, and cancellation against the in-memory
//! seams and the mock provider.

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use subgate::account::test::InMemoryAccountStore;
use subgate::account::Account;
use subgate::billing::provider::test::MockBillingProvider;
use subgate::billing::webhook::sign_payload;
use subgate::http::routes::SIGNATURE_HEADER;
use subgate::http::{router, AppState};
use subgate::session::{InMemorySessionStore, SessionData, SessionStore};
use subgate::testing;
use subgate::{ConfigBuilder, PromoCatalog};

const DAY: u64 = 86_400;
const SECRET: &str = "whsec_flow_test";
const SESSION_COOKIE: &str = "session_token";

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct TestApp {
    router: axum::Router,
    sessions: InMemorySessionStore,
    provider: MockBillingProvider,
}

async fn spawn_app() -> TestApp {
    let config = ConfigBuilder::new()
        .with_webhook_secret(SECRET)
        .with_price_ref("price_standard")
        .build();
    spawn_app_with(config).await
}

async fn spawn_app_with(config: subgate::SubgateConfig) -> TestApp {
    let store = subgate::entitlement::store::test::InMemoryEntitlementStore::new();
    let sessions = InMemorySessionStore::new();
    let accounts = InMemoryAccountStore::new();
    accounts
        .insert(Account {
            id: "acc_1".to_string(),
            email: "owner@example.com".to_string(),
        })
        .await;
    let provider = MockBillingProvider::new();
    let catalog = PromoCatalog::new().offer("SIXMONTHSFREE", 180, Some(100));

    let state = AppState::new(
        store,
        sessions.clone(),
        accounts,
        provider.clone(),
        catalog,
        config,
    )
    .unwrap();

    TestApp {
        router: router(state),
        sessions,
        provider,
    }
}

async fn log_in(app: &TestApp) {
    app.sessions
        .save(
            "tok_1",
            SessionData::for_account("acc_1", Duration::from_secs(3600)),
        )
        .await
        .unwrap();
}

fn subscription_payload(
    event_id: &str,
    event_type: &str,
    status: &str,
    period_end: Option<u64>,
) -> String {
    json!({
        "id": event_id,
        "type": event_type,
        "created": unix_now(),
        "data": {
            "object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": status,
                "current_period_end": period_end,
                "trial_end": null,
                "billing_cycle_anchor": null,
                "metadata": {"account_id": "acc_1"}
            }
        }
    })
    .to_string()
}

async fn deliver(app: &TestApp, payload: &str) -> testing::ScenarioAssert {
    let header = sign_payload(SECRET, payload.as_bytes(), unix_now() as i64);
    testing::post(app.router.clone(), "/webhooks/billing")
        .header(SIGNATURE_HEADER, &header)
        .raw_body(payload.to_owned())
        .execute()
        .await
}

fn status_request(app: &TestApp) -> testing::Scenario {
    testing::get(app.router.clone(), "/entitlement/status")
        .session_cookie(SESSION_COOKIE, "tok_1")
}

#[tokio::test]
async fn test_status_requires_session() {
    let app = spawn_app().await;

    testing::get(app.router.clone(), "/entitlement/status")
        .execute()
        .await
        .assert_unauthorized();
}

#[tokio::test]
async fn test_status_without_entitlement() {
    let app = spawn_app().await;
    log_in(&app).await;

    status_request(&app)
        .execute()
        .await
        .assert_ok()
        .assert_json_field("status", json!("none"))
        .await
        .assert_json_field("has_access", json!(false))
        .await
        .assert_json_field("reason", json!("subscriptionRequired"))
        .await;
}

#[tokio::test]
async fn test_webhook_rejects_missing_and_bad_signature() {
    let app = spawn_app().await;
    let payload = subscription_payload(
        "evt_1",
        "customer.subscription.created",
        "trialing",
        Some(unix_now() + 15 * DAY),
    );

    testing::post(app.router.clone(), "/webhooks/billing")
        .raw_body(payload.clone())
        .execute()
        .await
        .assert_bad_request();

    let forged = sign_payload("whsec_wrong", payload.as_bytes(), unix_now() as i64);
    testing::post(app.router.clone(), "/webhooks/billing")
        .header(SIGNATURE_HEADER, &forged)
        .raw_body(payload)
        .execute()
        .await
        .assert_bad_request();
}

#[tokio::test]
async fn test_webhook_establishes_trial() {
    let app = spawn_app().await;
    log_in(&app).await;

    let payload = subscription_payload(
        "evt_1",
        "customer.subscription.created",
        "trialing",
        Some(unix_now() + 15 * DAY),
    );
    deliver(&app, &payload)
        .await
        .assert_ok()
        .assert_json_field("received", json!(true))
        .await;

    status_request(&app)
        .execute()
        .await
        .assert_ok()
        .assert_json_field("status", json!("trial"))
        .await
        .assert_json_field("has_access", json!(true))
        .await
        .assert_json_field("is_trial", json!(true))
        .await
        .assert_json_field("days_remaining", json!(15))
        .await;
}

#[tokio::test]
async fn test_duplicate_webhook_delivery_is_acknowledged() {
    let app = spawn_app().await;
    let payload = subscription_payload(
        "evt_1",
        "customer.subscription.created",
        "trialing",
        Some(unix_now() + 15 * DAY),
    );

    deliver(&app, &payload).await.assert_ok();
    deliver(&app, &payload)
        .await
        .assert_ok()
        .assert_json_field("outcome", json!("already_processed"))
        .await;
}

#[tokio::test]
async fn test_out_of_order_webhooks_keep_newest_state() {
    let app = spawn_app().await;
    log_in(&app).await;
    let now = unix_now();

    let newer = subscription_payload(
        "evt_2",
        "customer.subscription.updated",
        "active",
        Some(now + 40 * DAY),
    );
    deliver(&app, &newer).await.assert_ok();

    let older = subscription_payload(
        "evt_1",
        "customer.subscription.updated",
        "trialing",
        Some(now + 15 * DAY),
    );
    deliver(&app, &older)
        .await
        .assert_ok()
        .assert_json_field("outcome", json!("stale"))
        .await;

    status_request(&app)
        .execute()
        .await
        .assert_ok()
        .assert_json_field("status", json!("active"))
        .await
        .assert_json_field("has_access", json!(true))
        .await;
}

#[tokio::test]
async fn test_deleted_webhook_revokes_access() {
    let app = spawn_app().await;
    log_in(&app).await;
    let now = unix_now();

    let active = subscription_payload(
        "evt_1",
        "customer.subscription.updated",
        "active",
        Some(now + 40 * DAY),
    );
    deliver(&app, &active).await.assert_ok();

    let deleted = subscription_payload(
        "evt_2",
        "customer.subscription.deleted",
        "canceled",
        Some(now),
    );
    deliver(&app, &deleted).await.assert_ok();

    status_request(&app)
        .execute()
        .await
        .assert_ok()
        .assert_json_field("status", json!("inactive"))
        .await
        .assert_json_field("has_access", json!(false))
        .await
        .assert_json_field("reason", json!("subscriptionRequired"))
        .await;
}

#[tokio::test]
async fn test_promo_redemption_flow() {
    let app = spawn_app().await;
    log_in(&app).await;

    testing::post(app.router.clone(), "/entitlement/promo")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .json_body(&json!({"code": "sixmonthsfree"}))
        .execute()
        .await
        .assert_ok()
        .assert_json_field("data.status", json!("free_access"))
        .await
        .assert_json_field("message", json!("Promo code applied"))
        .await;

    status_request(&app)
        .execute()
        .await
        .assert_ok()
        .assert_json_field("status", json!("free_access"))
        .await
        .assert_json_field("has_access", json!(true))
        .await
        .assert_json_field("days_remaining", json!(180))
        .await;

    // Same code again for the same account is rejected.
    testing::post(app.router.clone(), "/entitlement/promo")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .json_body(&json!({"code": "SIXMONTHSFREE"}))
        .execute()
        .await
        .assert_bad_request();
}

#[tokio::test]
async fn test_promo_unknown_and_empty_codes() {
    let app = spawn_app().await;
    log_in(&app).await;

    testing::post(app.router.clone(), "/entitlement/promo")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .json_body(&json!({"code": "BOGUS"}))
        .execute()
        .await
        .assert_not_found();

    testing::post(app.router.clone(), "/entitlement/promo")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .json_body(&json!({"code": "  "}))
        .execute()
        .await
        .assert_bad_request();
}

#[tokio::test]
async fn test_free_access_survives_cancellation_webhook() {
    let app = spawn_app().await;
    log_in(&app).await;

    testing::post(app.router.clone(), "/entitlement/promo")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .json_body(&json!({"code": "SIXMONTHSFREE"}))
        .execute()
        .await
        .assert_ok();

    let deleted = subscription_payload(
        "evt_1",
        "customer.subscription.deleted",
        "canceled",
        Some(unix_now()),
    );
    deliver(&app, &deleted).await.assert_ok();

    status_request(&app)
        .execute()
        .await
        .assert_ok()
        .assert_json_field("status", json!("free_access"))
        .await
        .assert_json_field("has_access", json!(true))
        .await;
}

#[tokio::test]
async fn test_checkout_starts_trial() {
    let app = spawn_app().await;
    log_in(&app).await;

    testing::post(app.router.clone(), "/entitlement/checkout")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .execute()
        .await
        .assert_ok()
        .assert_json_field("data.subscription_ref", json!("sub_mock_1"))
        .await
        .assert_json_field("data.client_secret", json!("pi_mock_secret"))
        .await;

    assert_eq!(app.provider.customers_created().await, 1);

    status_request(&app)
        .execute()
        .await
        .assert_ok()
        .assert_json_field("status", json!("trial"))
        .await
        .assert_json_field("is_trial", json!(true))
        .await;
}

#[tokio::test]
async fn test_checkout_rejected_when_already_active() {
    let app = spawn_app().await;
    log_in(&app).await;

    let active = subscription_payload(
        "evt_1",
        "customer.subscription.updated",
        "active",
        Some(unix_now() + 30 * DAY),
    );
    deliver(&app, &active).await.assert_ok();

    testing::post(app.router.clone(), "/entitlement/checkout")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .execute()
        .await
        .assert_bad_request();
}

#[tokio::test]
async fn test_cancel_subscription_flow() {
    let app = spawn_app().await;
    log_in(&app).await;

    testing::post(app.router.clone(), "/entitlement/checkout")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .execute()
        .await
        .assert_ok();

    testing::delete(app.router.clone(), "/entitlement/subscription")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .execute()
        .await
        .assert_ok()
        .assert_json_field("message", json!("Subscription will cancel at period end"))
        .await
        .assert_json_field("data.status", json!("trial"))
        .await;

    assert_eq!(
        app.provider.cancellations().await,
        vec!["sub_mock_1".to_string()]
    );

    // Access continues until the terminal webhook lands.
    status_request(&app)
        .execute()
        .await
        .assert_ok()
        .assert_json_field("has_access", json!(true))
        .await;
}

#[tokio::test]
async fn test_cancel_without_subscription_is_404() {
    let app = spawn_app().await;
    log_in(&app).await;

    testing::delete(app.router.clone(), "/entitlement/subscription")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .execute()
        .await
        .assert_not_found();
}

#[tokio::test]
async fn test_status_refresh_pulls_provider_state() {
    let app = spawn_app().await;
    log_in(&app).await;

    testing::post(app.router.clone(), "/entitlement/checkout")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .execute()
        .await
        .assert_ok();

    // Simulate the trial converting to paid on the provider side without
    // a webhook having arrived yet.
    app.provider
        .put_subscription(subgate::billing::ProviderSubscription {
            id: "sub_mock_1".to_string(),
            customer: Some("cus_mock_acc_1".to_string()),
            status: "active".to_string(),
            current_period_end: Some(unix_now() + 45 * DAY),
            trial_end: None,
            billing_cycle_anchor: None,
            cancel_at_period_end: false,
            metadata: std::collections::HashMap::new(),
        })
        .await;

    status_request(&app)
        .with_query(&[("refresh", "true")])
        .execute()
        .await
        .assert_ok()
        .assert_json_field("status", json!("active"))
        .await
        .assert_json_field("is_trial", json!(false))
        .await;
}

#[tokio::test]
async fn test_dev_mode_controls_error_detail() {
    let prod = spawn_app().await;
    log_in(&prod).await;
    prod.provider
        .fail_next(subgate::entitlement::error::EntitlementError::Internal {
            message: "provider wiring came apart".to_string(),
        })
        .await;

    let body: serde_json::Value = testing::post(prod.router.clone(), "/entitlement/checkout")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .execute()
        .await
        .assert_status(StatusCode::INTERNAL_SERVER_ERROR)
        .json()
        .await;
    assert_eq!(body["error"], "Internal server error");

    let dev = spawn_app_with(
        ConfigBuilder::new()
            .with_webhook_secret(SECRET)
            .with_price_ref("price_standard")
            .with_dev_mode(true)
            .build(),
    )
    .await;
    log_in(&dev).await;
    dev.provider
        .fail_next(subgate::entitlement::error::EntitlementError::Internal {
            message: "provider wiring came apart".to_string(),
        })
        .await;

    let body: serde_json::Value = testing::post(dev.router.clone(), "/entitlement/checkout")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .execute()
        .await
        .assert_status(StatusCode::INTERNAL_SERVER_ERROR)
        .json()
        .await;
    let detail = body["error"].as_str().unwrap_or_default();
    assert!(detail.contains("provider wiring came apart"), "got: {detail}");
}

#[tokio::test]
async fn test_status_refresh_degrades_on_provider_failure() {
    let app = spawn_app().await;
    log_in(&app).await;

    testing::post(app.router.clone(), "/entitlement/checkout")
        .session_cookie(SESSION_COOKIE, "tok_1")
        .execute()
        .await
        .assert_ok();

    app.provider
        .fail_next(subgate::entitlement::error::EntitlementError::ProviderUnavailable {
            operation: "get_subscription".to_string(),
        })
        .await;

    // The stored record is served instead of surfacing the provider error.
    status_request(&app)
        .with_query(&[("refresh", "true")])
        .execute()
        .await
        .assert_ok()
        .assert_json_field("status", json!("trial"))
        .await;
}
