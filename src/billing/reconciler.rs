//! Webhook event reconciliation.
//!
//! The reconciler is the only writer of provider-derived entitlement
//! state. Every event goes through the same pipeline: idempotency check,
//! account resolution, status mapping, validity derivation, ordering
//! guard, one atomic store write.
//!
//! Delivery is at-least-once and unordered, so handlers never assume they
//! are seeing events in the order the provider emitted them. The ordering
//! guard compares the event's derived validity window against the stored
//! one and drops older information on the floor, acknowledged but unapplied.

use tracing::{debug, info, warn};

use super::provider::ProviderSubscription;
use super::webhook::{SignatureVerifier, WebhookEvent};
use crate::account::AccountStore;
use crate::entitlement::store::{
    Entitlement, EntitlementStatus, EntitlementStore, ReconciledUpdate,
};
use crate::error::Result;

/// Terminal event type. Always applied regardless of timestamps, because
/// a deletion is the provider's final word on a subscription.
const EVENT_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

/// Outcome of reconciling one webhook event.
///
/// Everything here is a resolved state, not an error: the webhook handler
/// returns 200 for all of them so the provider stops redelivering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Local state was updated to the given status.
    Applied(EntitlementStatus),
    /// The event was understood and needed no state change.
    Acknowledged,
    /// This event id was already processed.
    AlreadyProcessed,
    /// The event carried older information than the stored record.
    Stale,
    /// The event type is not one this subsystem handles.
    Ignored,
    /// No account could be resolved from the payload.
    AccountNotFound,
    /// The provider sent a status string outside the known vocabulary.
    UnrecognizedStatus,
}

impl ReconcileOutcome {
    /// Wire name, as returned by the webhook endpoint.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Acknowledged => "acknowledged",
            Self::AlreadyProcessed => "already_processed",
            Self::Stale => "stale",
            Self::Ignored => "ignored",
            Self::AccountNotFound => "account_not_found",
            Self::UnrecognizedStatus => "unrecognized_status",
        }
    }
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciles provider webhook events into the entitlement store.
#[derive(Clone)]
pub struct EventReconciler<S, A> {
    store: S,
    accounts: A,
    verifier: SignatureVerifier,
    /// How long processed-event markers are kept, in days. Must exceed the
    /// provider's redelivery window.
    retention_days: u32,
}

impl<S: EntitlementStore, A: AccountStore> EventReconciler<S, A> {
    #[must_use]
    pub fn new(store: S, accounts: A, verifier: SignatureVerifier, retention_days: u32) -> Self {
        Self {
            store,
            accounts,
            verifier,
            retention_days,
        }
    }

    /// Verify the signature header and parse the raw body into an event.
    ///
    /// This is the only reconciliation step that produces a client error;
    /// the webhook endpoint turns it into a 400.
    pub fn verify_signature(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent> {
        self.verifier.verify(payload, signature_header)
    }

    /// Process a verified event.
    ///
    /// There is a window between the ordering-guard read and the store
    /// write in which a concurrent event can land first. Entitlement
    /// updates are low-frequency and self-correcting on the next event,
    /// so this is tolerated rather than locked around.
    pub async fn process(&self, event: &WebhookEvent) -> Result<ReconcileOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            debug!(
                target: "subgate::reconciler",
                event_id = %event.id,
                "Duplicate webhook delivery, skipping"
            );
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        let outcome = match event.event_type.as_str() {
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.reconcile_subscription(event, false).await?
            }
            EVENT_SUBSCRIPTION_DELETED => self.reconcile_subscription(event, true).await?,
            "invoice.paid" => self.handle_invoice_paid(event).await?,
            "invoice.payment_failed" => self.handle_payment_failed(event).await?,
            // The subscription.created event carries the authoritative
            // state for a completed checkout.
            "checkout.session.completed" => ReconcileOutcome::Acknowledged,
            other => {
                debug!(
                    target: "subgate::reconciler",
                    event_id = %event.id,
                    event_type = other,
                    "Ignoring unhandled event type"
                );
                ReconcileOutcome::Ignored
            }
        };

        // Resolved outcomes are marked so redeliveries short-circuit.
        // Unresolved ones (unknown account, unknown status) are left
        // unmarked so a redelivery after a fix can still apply.
        if matches!(
            outcome,
            ReconcileOutcome::Applied(_) | ReconcileOutcome::Acknowledged | ReconcileOutcome::Stale
        ) {
            self.store.mark_event_processed(&event.id).await?;

            // Opportunistic retention sweep; the marker table stays bounded
            // without a separate scheduled job.
            let removed = self.store.cleanup_old_events(self.retention_days).await?;
            if removed > 0 {
                debug!(
                    target: "subgate::reconciler",
                    removed,
                    retention_days = self.retention_days,
                    "Pruned processed-event markers past retention"
                );
            }
        }

        Ok(outcome)
    }

    /// Reconcile a subscription lifecycle event.
    async fn reconcile_subscription(
        &self,
        event: &WebhookEvent,
        terminal: bool,
    ) -> Result<ReconcileOutcome> {
        let subscription: ProviderSubscription =
            match serde_json::from_value(event.data.object.clone()) {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(
                        target: "subgate::reconciler",
                        event_id = %event.id,
                        error = %e,
                        "Malformed subscription object in webhook"
                    );
                    return Err(crate::entitlement::error::EntitlementError::InvalidPayload {
                        message: "malformed subscription object".to_string(),
                    }
                    .into());
                }
            };

        let Some(account_id) = self.resolve_account(event, &subscription).await? else {
            warn!(
                target: "subgate::reconciler",
                event_id = %event.id,
                subscription_ref = %subscription.id,
                customer_ref = subscription.customer.as_deref().unwrap_or("<none>"),
                "Webhook could not be resolved to an account"
            );
            return Ok(ReconcileOutcome::AccountNotFound);
        };

        // Deleted subscriptions map straight to Inactive; the payload
        // status on a deleted event is historical.
        let status = if terminal {
            EntitlementStatus::Inactive
        } else {
            match EntitlementStatus::from_provider(&subscription.status) {
                Some(status) => status,
                None => {
                    warn!(
                        target: "subgate::reconciler",
                        event_id = %event.id,
                        account_id = %account_id,
                        provider_status = %subscription.status,
                        payload = %event.data.object,
                        "Unrecognized provider status, leaving local state unchanged"
                    );
                    return Ok(ReconcileOutcome::UnrecognizedStatus);
                }
            }
        };

        let valid_until = derive_valid_until(&subscription);
        if valid_until.is_none() && !terminal {
            warn!(
                target: "subgate::reconciler",
                event_id = %event.id,
                account_id = %account_id,
                subscription_ref = %subscription.id,
                "No usable period timestamp in payload, persisting without a validity window"
            );
        }

        let stored = self.store.get(&account_id).await?;

        // An open free-access window is not provider state and no
        // subscription event, terminal included, may claw it back. The
        // refs are still recorded so later events keep resolving.
        if let Some(stored) = &stored {
            if stored.status == EntitlementStatus::FreeAccess
                && stored
                    .status_valid_until
                    .map_or(true, |v| v >= crate::util::unix_now())
            {
                self.store
                    .set_provider_refs(
                        &account_id,
                        subscription.customer.clone(),
                        Some(subscription.id.clone()),
                    )
                    .await?;
                info!(
                    target: "subgate::reconciler",
                    event_id = %event.id,
                    account_id = %account_id,
                    "Free access window active, provider event acknowledged without applying"
                );
                return Ok(ReconcileOutcome::Acknowledged);
            }
        }

        if !supersedes_stored(stored.as_ref(), valid_until, terminal) {
            info!(
                target: "subgate::reconciler",
                event_id = %event.id,
                account_id = %account_id,
                "Out-of-order event carries older validity, not applied"
            );
            return Ok(ReconcileOutcome::Stale);
        }

        let update = ReconciledUpdate {
            status,
            status_valid_until: valid_until,
            customer_ref: subscription.customer.clone(),
            subscription_ref: Some(subscription.id.clone()),
        };
        self.store.apply(&account_id, update).await?;

        info!(
            target: "subgate::reconciler",
            event_id = %event.id,
            account_id = %account_id,
            status = %status,
            valid_until = valid_until,
            "Entitlement reconciled from webhook"
        );
        Ok(ReconcileOutcome::Applied(status))
    }

    /// `invoice.paid` restores an account from `PastDue`; any other stored
    /// state means the payment changed nothing we track, and the
    /// subscription.updated event carries the new period end.
    async fn handle_invoice_paid(&self, event: &WebhookEvent) -> Result<ReconcileOutcome> {
        let Some(entitlement) = self.resolve_invoice_account(event).await? else {
            return Ok(ReconcileOutcome::AccountNotFound);
        };

        if entitlement.status != EntitlementStatus::PastDue {
            return Ok(ReconcileOutcome::Acknowledged);
        }

        let period_end = event
            .data
            .object
            .get("period_end")
            .and_then(serde_json::Value::as_u64)
            .or(entitlement.status_valid_until);

        self.store
            .apply(
                &entitlement.account_id,
                ReconciledUpdate {
                    status: EntitlementStatus::Active,
                    status_valid_until: period_end,
                    customer_ref: None,
                    subscription_ref: None,
                },
            )
            .await?;

        info!(
            target: "subgate::reconciler",
            event_id = %event.id,
            account_id = %entitlement.account_id,
            "Payment recovered, account restored to active"
        );
        Ok(ReconcileOutcome::Applied(EntitlementStatus::Active))
    }

    async fn handle_payment_failed(&self, event: &WebhookEvent) -> Result<ReconcileOutcome> {
        let Some(entitlement) = self.resolve_invoice_account(event).await? else {
            return Ok(ReconcileOutcome::AccountNotFound);
        };

        // Free access is never clawed back by payment failures.
        if entitlement.status == EntitlementStatus::FreeAccess {
            return Ok(ReconcileOutcome::Acknowledged);
        }

        self.store
            .apply(
                &entitlement.account_id,
                ReconciledUpdate {
                    status: EntitlementStatus::PastDue,
                    status_valid_until: entitlement.status_valid_until,
                    customer_ref: None,
                    subscription_ref: None,
                },
            )
            .await?;

        info!(
            target: "subgate::reconciler",
            event_id = %event.id,
            account_id = %entitlement.account_id,
            "Payment failed, account marked past due"
        );
        Ok(ReconcileOutcome::Applied(EntitlementStatus::PastDue))
    }

    /// Resolve the account for a subscription event.
    ///
    /// Chain: subscription metadata, then the stored customer ref, then
    /// the payload's customer email.
    async fn resolve_account(
        &self,
        event: &WebhookEvent,
        subscription: &ProviderSubscription,
    ) -> Result<Option<String>> {
        if let Some(account_id) = subscription.account_id() {
            if let Some(account) = self.accounts.get_account(account_id).await? {
                return Ok(Some(account.id));
            }
            warn!(
                target: "subgate::reconciler",
                event_id = %event.id,
                account_id = %account_id,
                "Webhook metadata names an account that does not exist"
            );
        }

        if let Some(customer_ref) = &subscription.customer {
            if let Some(entitlement) = self.store.find_by_customer_ref(customer_ref).await? {
                return Ok(Some(entitlement.account_id));
            }
        }

        if let Some(email) = event
            .data
            .object
            .get("customer_email")
            .and_then(serde_json::Value::as_str)
        {
            if let Some(account) = self.accounts.get_account_by_email(email).await? {
                return Ok(Some(account.id));
            }
        }

        Ok(None)
    }

    /// Resolve the entitlement for an invoice event via its subscription
    /// ref, falling back to the customer ref.
    async fn resolve_invoice_account(&self, event: &WebhookEvent) -> Result<Option<Entitlement>> {
        if let Some(subscription_ref) = event
            .data
            .object
            .get("subscription")
            .and_then(serde_json::Value::as_str)
        {
            if let Some(entitlement) = self.store.find_by_subscription_ref(subscription_ref).await?
            {
                return Ok(Some(entitlement));
            }
        }

        if let Some(customer_ref) = event
            .data
            .object
            .get("customer")
            .and_then(serde_json::Value::as_str)
        {
            if let Some(entitlement) = self.store.find_by_customer_ref(customer_ref).await? {
                return Ok(Some(entitlement));
            }
        }

        warn!(
            target: "subgate::reconciler",
            event_id = %event.id,
            "Invoice webhook could not be resolved to an account"
        );
        Ok(None)
    }
}

/// Derive the validity window end from a subscription payload.
///
/// Fallback chain: `current_period_end`, then `trial_end`, then
/// `billing_cycle_anchor`. `None` when the payload carries no usable
/// timestamp at all.
pub(crate) fn derive_valid_until(subscription: &ProviderSubscription) -> Option<u64> {
    subscription
        .current_period_end
        .or(subscription.trial_end)
        .or(subscription.billing_cycle_anchor)
}

/// The ordering guard: may an event with `derived_valid_until` overwrite
/// `stored`?
///
/// Yes when there is nothing stored to compare against, when the derived
/// window is absent or at least as new as the stored one, or when the
/// event is terminal.
pub(crate) fn supersedes_stored(
    stored: Option<&Entitlement>,
    derived_valid_until: Option<u64>,
    terminal: bool,
) -> bool {
    if terminal {
        return true;
    }
    let Some(stored) = stored else {
        return true;
    };
    match (derived_valid_until, stored.status_valid_until) {
        (Some(derived), Some(current)) => derived >= current,
        // An event without a window cannot be ordered, and stale data is
        // preferable to silently dropping a real state change.
        _ => true,
    }
}
