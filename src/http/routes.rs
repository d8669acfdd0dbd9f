//! Router and handlers for the entitlement endpoints.
//!
//! The webhook endpoint sits outside the session gate and authenticates
//! by signature instead. The remaining endpoints require a session but
//! deliberately not an entitlement, since they exist for accounts that
//! are trying to get one.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::account::AccountStore;
use crate::billing::checkout::{CheckoutManager, CheckoutStart};
use crate::billing::provider::BillingProvider;
use crate::billing::reconciler::EventReconciler;
use crate::billing::webhook::SignatureVerifier;
use crate::config::SubgateConfig;
use crate::entitlement::evaluator::{evaluate, DenialReason};
use crate::entitlement::promo::{PromoCatalog, PromoManager};
use crate::entitlement::store::{Entitlement, EntitlementStatus, EntitlementStore};
use crate::error::{Result, SubgateError};
use crate::middleware::{persist_lazy_expiry, AccessGate, CurrentAccount};
use crate::session::SessionStore;
use crate::util::unix_now;

use super::response::ApiResponse;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "billing-signature";

/// Shared state behind every entitlement endpoint.
pub struct AppState<St, Se, A, P> {
    pub store: St,
    pub config: Arc<SubgateConfig>,
    pub reconciler: EventReconciler<St, A>,
    pub promo: PromoManager<St>,
    pub checkout: CheckoutManager<St, A, P>,
    pub gate: AccessGate<Se, A, St>,
}

impl<St, Se, A, P> Clone for AppState<St, Se, A, P>
where
    St: Clone,
    Se: Clone,
    A: Clone,
    P: Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            reconciler: self.reconciler.clone(),
            promo: self.promo.clone(),
            checkout: self.checkout.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl<St, Se, A, P> AppState<St, Se, A, P>
where
    St: EntitlementStore + Clone + Send + Sync + 'static,
    Se: SessionStore + Clone + Send + Sync + 'static,
    A: AccountStore + Clone + Send + Sync + 'static,
    P: BillingProvider + Clone + Send + Sync + 'static,
{
    /// Wire up the managers from the injected seams.
    ///
    /// # Errors
    ///
    /// Fails when the config is missing the webhook secret or price ref.
    pub fn new(
        store: St,
        sessions: Se,
        accounts: A,
        provider: P,
        catalog: PromoCatalog,
        config: SubgateConfig,
    ) -> Result<Self> {
        let secret = config
            .webhook_secret
            .clone()
            .ok_or_else(|| SubgateError::internal("Webhook secret is not configured"))?;
        let price_ref = config
            .price_ref
            .clone()
            .ok_or_else(|| SubgateError::internal("Price ref is not configured"))?;

        let verifier = SignatureVerifier::new(secret, config.webhook_tolerance_secs);
        let reconciler = EventReconciler::new(
            store.clone(),
            accounts.clone(),
            verifier,
            config.event_retention_days,
        );
        let promo = PromoManager::new(store.clone(), catalog, config.promo_window_days);
        let checkout = CheckoutManager::new(
            store.clone(),
            accounts.clone(),
            provider,
            price_ref,
            config.trial_days,
        );
        let gate = AccessGate::new(
            sessions,
            accounts,
            store.clone(),
            config.session_cookie.clone(),
        );

        Ok(Self {
            store,
            config: Arc::new(config),
            reconciler,
            promo,
            checkout,
            gate,
        })
    }
}

/// Build the entitlement router.
///
/// The host application nests or merges this into its own router and
/// wraps its protected routes with
/// [`AccessGate::require_entitlement`].
pub fn router<St, Se, A, P>(state: AppState<St, Se, A, P>) -> Router
where
    St: EntitlementStore + Clone + Send + Sync + 'static,
    Se: SessionStore + Clone + Send + Sync + 'static,
    A: AccountStore + Clone + Send + Sync + 'static,
    P: BillingProvider + Clone + Send + Sync + 'static,
{
    let gate = state.gate.clone();

    let authed = Router::new()
        .route("/entitlement/status", get(entitlement_status::<St, Se, A, P>))
        .route("/entitlement/promo", post(redeem_promo::<St, Se, A, P>))
        .route("/entitlement/checkout", post(start_checkout::<St, Se, A, P>))
        .route(
            "/entitlement/subscription",
            delete(cancel_subscription::<St, Se, A, P>),
        )
        .layer(axum::middleware::from_fn(move |req, next| {
            let gate = gate.clone();
            async move { gate.require_session(req, next).await }
        }));

    Router::new()
        .route("/webhooks/billing", post(billing_webhook::<St, Se, A, P>))
        .merge(authed)
        .with_state(state)
}

/// Serialize a handler result, including internal error detail only when
/// dev mode is on.
fn respond<T: Serialize>(result: Result<T>, dev_mode: bool) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => e.into_response_with_detail(dev_mode),
    }
}

/// `POST /webhooks/billing`
///
/// Returns 200 for every resolved outcome so the provider stops
/// redelivering; 400 only for signature or payload failures, 5xx only
/// for store failures (which the provider should retry).
async fn billing_webhook<St, Se, A, P>(
    State(state): State<AppState<St, Se, A, P>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    St: EntitlementStore + Clone + Send + Sync + 'static,
    Se: SessionStore + Clone + Send + Sync + 'static,
    A: AccountStore + Clone + Send + Sync + 'static,
    P: BillingProvider + Clone + Send + Sync + 'static,
{
    let result: Result<serde_json::Value> = async {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SubgateError::bad_request("Missing signature header"))?;

        let event = state.reconciler.verify_signature(&body, signature)?;
        let outcome = state.reconciler.process(&event).await?;

        Ok(json!({
            "received": true,
            "outcome": outcome.as_str(),
        }))
    }
    .await;

    respond(result, state.config.dev_mode)
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: EntitlementStatus,
    has_access: bool,
    is_trial: bool,
    days_remaining: Option<u64>,
    end_date: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<DenialReason>,
}

/// `GET /entitlement/status`
///
/// With `?refresh=true` the provider is re-queried first; a provider
/// failure degrades to the stored record rather than failing the call.
async fn entitlement_status<St, Se, A, P>(
    State(state): State<AppState<St, Se, A, P>>,
    Extension(CurrentAccount(account)): Extension<CurrentAccount>,
    Query(query): Query<StatusQuery>,
) -> Response
where
    St: EntitlementStore + Clone + Send + Sync + 'static,
    Se: SessionStore + Clone + Send + Sync + 'static,
    A: AccountStore + Clone + Send + Sync + 'static,
    P: BillingProvider + Clone + Send + Sync + 'static,
{
    let result: Result<StatusResponse> = async {
        let entitlement = if query.refresh {
            match state.checkout.refresh(&account.id).await {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    tracing::warn!(
                        target: "subgate::http",
                        account_id = %account.id,
                        error = %e,
                        "Provider refresh failed, serving stored entitlement"
                    );
                    state.store.get(&account.id).await?
                }
            }
        } else {
            state.store.get(&account.id).await?
        };

        let entitlement = entitlement.unwrap_or_else(|| Entitlement::none(&account.id));
        let evaluation = evaluate(&entitlement, unix_now());
        persist_lazy_expiry(&state.store, &entitlement, &evaluation);

        Ok(StatusResponse {
            status: evaluation.status,
            has_access: evaluation.has_access,
            is_trial: evaluation.is_trial,
            days_remaining: evaluation.days_remaining,
            end_date: entitlement.status_valid_until,
            reason: evaluation.denial_reason,
        })
    }
    .await;

    respond(result, state.config.dev_mode)
}

#[derive(Debug, Deserialize)]
struct PromoRequest {
    code: String,
}

/// `POST /entitlement/promo`
async fn redeem_promo<St, Se, A, P>(
    State(state): State<AppState<St, Se, A, P>>,
    Extension(CurrentAccount(account)): Extension<CurrentAccount>,
    Json(request): Json<PromoRequest>,
) -> Response
where
    St: EntitlementStore + Clone + Send + Sync + 'static,
    Se: SessionStore + Clone + Send + Sync + 'static,
    A: AccountStore + Clone + Send + Sync + 'static,
    P: BillingProvider + Clone + Send + Sync + 'static,
{
    let result: Result<ApiResponse<serde_json::Value>> = async {
        if request.code.trim().is_empty() {
            return Err(SubgateError::bad_request("Promo code is required"));
        }

        let entitlement = state.promo.redeem(&account.id, request.code.trim()).await?;

        Ok(ApiResponse::success_with_message(
            json!({
                "status": entitlement.status,
                "end_date": entitlement.status_valid_until,
            }),
            "Promo code applied",
        ))
    }
    .await;

    respond(result, state.config.dev_mode)
}

/// `POST /entitlement/checkout`
async fn start_checkout<St, Se, A, P>(
    State(state): State<AppState<St, Se, A, P>>,
    Extension(CurrentAccount(account)): Extension<CurrentAccount>,
) -> Response
where
    St: EntitlementStore + Clone + Send + Sync + 'static,
    Se: SessionStore + Clone + Send + Sync + 'static,
    A: AccountStore + Clone + Send + Sync + 'static,
    P: BillingProvider + Clone + Send + Sync + 'static,
{
    let result: Result<ApiResponse<CheckoutStart>> = async {
        let start = state.checkout.start_subscription(&account.id).await?;
        Ok(ApiResponse::success(start))
    }
    .await;

    respond(result, state.config.dev_mode)
}

/// `DELETE /entitlement/subscription`
async fn cancel_subscription<St, Se, A, P>(
    State(state): State<AppState<St, Se, A, P>>,
    Extension(CurrentAccount(account)): Extension<CurrentAccount>,
) -> Response
where
    St: EntitlementStore + Clone + Send + Sync + 'static,
    Se: SessionStore + Clone + Send + Sync + 'static,
    A: AccountStore + Clone + Send + Sync + 'static,
    P: BillingProvider + Clone + Send + Sync + 'static,
{
    let result: Result<ApiResponse<serde_json::Value>> = async {
        let entitlement = state.checkout.cancel_at_period_end(&account.id).await?;
        Ok(ApiResponse::success_with_message(
            json!({
                "status": entitlement.status,
                "end_date": entitlement.status_valid_until,
            }),
            "Subscription will cancel at period end",
        ))
    }
    .await;

    respond(result, state.config.dev_mode)
}
