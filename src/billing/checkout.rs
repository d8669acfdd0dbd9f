//! Interactive subscription lifecycle: start, refresh, cancel.
//!
//! These paths are the synchronous counterpart to the webhook reconciler.
//! Anything they learn from the provider is written back through the same
//! ordering guard, so a webhook that raced ahead is never overwritten with
//! older state.

use tracing::info;

use super::provider::{BillingProvider, NewSubscription, ProviderSubscription};
use super::reconciler::{derive_valid_until, supersedes_stored};
use crate::account::AccountStore;
use crate::entitlement::store::{Entitlement, EntitlementStatus, EntitlementStore, ReconciledUpdate};
use crate::error::{Result, SubgateError};

/// Response to a checkout start: what the client needs to confirm payment.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutStart {
    pub subscription_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Drives subscription creation and cancellation against the provider.
#[derive(Clone)]
pub struct CheckoutManager<S, A, P> {
    store: S,
    accounts: A,
    provider: P,
    price_ref: String,
    trial_days: u32,
}

impl<S, A, P> CheckoutManager<S, A, P>
where
    S: EntitlementStore,
    A: AccountStore,
    P: BillingProvider,
{
    #[must_use]
    pub fn new(
        store: S,
        accounts: A,
        provider: P,
        price_ref: impl Into<String>,
        trial_days: u32,
    ) -> Self {
        Self {
            store,
            accounts,
            provider,
            price_ref: price_ref.into(),
            trial_days,
        }
    }

    /// Start a subscription for an account.
    ///
    /// Reuses the stored customer ref when one exists, creating a provider
    /// customer otherwise. The created subscription's state is persisted
    /// immediately; the webhook that follows is a no-op or a refinement.
    pub async fn start_subscription(&self, account_id: &str) -> Result<CheckoutStart> {
        let account = self
            .accounts
            .get_account(account_id)
            .await?
            .ok_or_else(|| SubgateError::not_found(format!("No account: {}", account_id)))?;

        let stored = self.store.get(account_id).await?;
        if let Some(stored) = &stored {
            let eval = crate::entitlement::evaluate(stored, crate::util::unix_now());
            if eval.has_access && !eval.is_trial {
                return Err(SubgateError::bad_request(
                    "Account already has an active entitlement".to_string(),
                ));
            }
        }

        let customer_ref = match stored.as_ref().and_then(|e| e.customer_ref.clone()) {
            Some(customer_ref) => customer_ref,
            None => {
                let customer_ref = self
                    .provider
                    .create_customer(&account.email, account_id)
                    .await?;
                self.store
                    .set_provider_refs(account_id, Some(customer_ref.clone()), None)
                    .await?;
                customer_ref
            }
        };

        let NewSubscription {
            subscription,
            client_secret,
        } = self
            .provider
            .create_subscription(&customer_ref, &self.price_ref, account_id, self.trial_days)
            .await?;

        self.write_back(account_id, &subscription).await?;

        info!(
            target: "subgate::checkout",
            account_id = %account_id,
            subscription_ref = %subscription.id,
            trial_days = self.trial_days,
            "Subscription started"
        );

        Ok(CheckoutStart {
            subscription_ref: subscription.id,
            client_secret,
        })
    }

    /// Re-query the provider and reconcile the freshest subscription state
    /// into the store. Used by the status endpoint's `refresh` flag.
    ///
    /// A record with a customer ref but no subscription ref is recovered by
    /// listing the customer's subscriptions and adopting the one with the
    /// latest validity window.
    pub async fn refresh(&self, account_id: &str) -> Result<Option<Entitlement>> {
        let Some(stored) = self.store.get(account_id).await? else {
            return Ok(None);
        };

        let subscription = match stored.subscription_ref.clone() {
            Some(subscription_ref) => self.provider.get_subscription(&subscription_ref).await?,
            None => {
                let Some(customer_ref) = stored.customer_ref.clone() else {
                    return Ok(Some(stored));
                };
                let mut subscriptions = self.provider.list_subscriptions(&customer_ref).await?;
                subscriptions.sort_by_key(|s| std::cmp::Reverse(derive_valid_until(s)));
                match subscriptions.into_iter().next() {
                    Some(subscription) => subscription,
                    None => return Ok(Some(stored)),
                }
            }
        };

        self.write_back(account_id, &subscription).await?;
        self.store.get(account_id).await
    }

    /// Request cancellation at period end. Local state keeps its current
    /// status; the provider's terminal webhook flips it when the period
    /// actually ends.
    pub async fn cancel_at_period_end(&self, account_id: &str) -> Result<Entitlement> {
        let stored = self
            .store
            .get(account_id)
            .await?
            .filter(|e| e.subscription_ref.is_some())
            .ok_or_else(|| {
                SubgateError::not_found(format!("No subscription for account: {}", account_id))
            })?;

        // filter() above guarantees the ref is present
        let subscription_ref = stored.subscription_ref.clone().unwrap_or_default();
        let subscription = self.provider.cancel_at_period_end(&subscription_ref).await?;
        self.write_back(account_id, &subscription).await?;

        info!(
            target: "subgate::checkout",
            account_id = %account_id,
            subscription_ref = %subscription_ref,
            "Cancellation scheduled for period end"
        );

        self.store
            .get(account_id)
            .await?
            .ok_or_else(|| SubgateError::internal("Entitlement vanished during cancel".to_string()))
    }

    /// Persist provider state through the same ordering guard the
    /// reconciler uses.
    async fn write_back(&self, account_id: &str, subscription: &ProviderSubscription) -> Result<()> {
        let Some(status) = EntitlementStatus::from_provider(&subscription.status) else {
            tracing::warn!(
                target: "subgate::checkout",
                account_id = %account_id,
                provider_status = %subscription.status,
                "Unrecognized provider status on interactive path, not persisted"
            );
            return Ok(());
        };

        let valid_until = derive_valid_until(subscription);
        let stored = self.store.get(account_id).await?;
        if !supersedes_stored(stored.as_ref(), valid_until, false) {
            return Ok(());
        }

        self.store
            .apply(
                account_id,
                ReconciledUpdate {
                    status,
                    status_valid_until: valid_until,
                    customer_ref: subscription.customer.clone(),
                    subscription_ref: Some(subscription.id.clone()),
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::test::InMemoryAccountStore;
    use crate::account::Account;
    use crate::billing::provider::test::MockBillingProvider;
    use crate::entitlement::store::test::InMemoryEntitlementStore;
    use crate::util::unix_now;
    use std::collections::HashMap;

    const DAY: u64 = 86_400;

    async fn setup() -> (
        CheckoutManager<InMemoryEntitlementStore, InMemoryAccountStore, MockBillingProvider>,
        InMemoryEntitlementStore,
        MockBillingProvider,
    ) {
        let store = InMemoryEntitlementStore::new();
        let accounts = InMemoryAccountStore::new();
        accounts
            .insert(Account {
                id: "acc_1".to_string(),
                email: "owner@example.com".to_string(),
            })
            .await;
        let provider = MockBillingProvider::new();
        let manager = CheckoutManager::new(
            store.clone(),
            accounts,
            provider.clone(),
            "price_standard",
            15,
        );
        (manager, store, provider)
    }

    #[tokio::test]
    async fn test_start_subscription_creates_customer_and_trial() {
        let (manager, store, provider) = setup().await;

        let start = manager.start_subscription("acc_1").await.unwrap();
        assert!(start.client_secret.is_some());

        let entitlement = store.get("acc_1").await.unwrap().unwrap();
        assert_eq!(entitlement.status, EntitlementStatus::Trial);
        assert_eq!(
            entitlement.subscription_ref.as_deref(),
            Some(start.subscription_ref.as_str())
        );
        assert!(entitlement.customer_ref.is_some());
        assert_eq!(provider.customers_created().await, 1);
    }

    #[tokio::test]
    async fn test_start_subscription_reuses_stored_customer() {
        let (manager, store, provider) = setup().await;
        store
            .set_provider_refs("acc_1", Some("cus_existing".to_string()), None)
            .await
            .unwrap();

        manager.start_subscription("acc_1").await.unwrap();
        assert_eq!(provider.customers_created().await, 0);

        let entitlement = store.get("acc_1").await.unwrap().unwrap();
        assert_eq!(entitlement.customer_ref.as_deref(), Some("cus_existing"));
    }

    #[tokio::test]
    async fn test_start_subscription_rejects_active_account() {
        let (manager, store, _provider) = setup().await;
        store
            .apply(
                "acc_1",
                ReconciledUpdate {
                    status: EntitlementStatus::Active,
                    status_valid_until: Some(unix_now() + 30 * DAY),
                    customer_ref: Some("cus_1".to_string()),
                    subscription_ref: Some("sub_1".to_string()),
                },
            )
            .await
            .unwrap();

        let err = manager.start_subscription("acc_1").await.unwrap_err();
        assert!(matches!(err, SubgateError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_start_subscription_unknown_account() {
        let (manager, _store, _provider) = setup().await;
        let err = manager.start_subscription("acc_missing").await.unwrap_err();
        assert!(matches!(err, SubgateError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_requires_subscription() {
        let (manager, _store, _provider) = setup().await;
        let err = manager.cancel_at_period_end("acc_1").await.unwrap_err();
        assert!(matches!(err, SubgateError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_flags_provider_and_keeps_status() {
        let (manager, store, provider) = setup().await;
        let now = unix_now();
        provider
            .put_subscription(ProviderSubscription {
                id: "sub_1".to_string(),
                customer: Some("cus_1".to_string()),
                status: "active".to_string(),
                current_period_end: Some(now + 20 * DAY),
                trial_end: None,
                billing_cycle_anchor: None,
                cancel_at_period_end: false,
                metadata: HashMap::new(),
            })
            .await;
        store
            .apply(
                "acc_1",
                ReconciledUpdate {
                    status: EntitlementStatus::Active,
                    status_valid_until: Some(now + 20 * DAY),
                    customer_ref: Some("cus_1".to_string()),
                    subscription_ref: Some("sub_1".to_string()),
                },
            )
            .await
            .unwrap();

        let entitlement = manager.cancel_at_period_end("acc_1").await.unwrap();
        assert_eq!(entitlement.status, EntitlementStatus::Active);
        assert_eq!(provider.cancellations().await, vec!["sub_1".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_respects_ordering_guard() {
        let (manager, store, provider) = setup().await;
        let now = unix_now();

        // Stored state is newer than what the provider returns.
        provider
            .put_subscription(ProviderSubscription {
                id: "sub_1".to_string(),
                customer: Some("cus_1".to_string()),
                status: "trialing".to_string(),
                current_period_end: Some(now + 5 * DAY),
                trial_end: None,
                billing_cycle_anchor: None,
                cancel_at_period_end: false,
                metadata: HashMap::new(),
            })
            .await;
        store
            .apply(
                "acc_1",
                ReconciledUpdate {
                    status: EntitlementStatus::Active,
                    status_valid_until: Some(now + 40 * DAY),
                    customer_ref: Some("cus_1".to_string()),
                    subscription_ref: Some("sub_1".to_string()),
                },
            )
            .await
            .unwrap();

        let refreshed = manager.refresh("acc_1").await.unwrap().unwrap();
        assert_eq!(refreshed.status, EntitlementStatus::Active);
        assert_eq!(refreshed.status_valid_until, Some(now + 40 * DAY));
    }

    #[tokio::test]
    async fn test_refresh_recovers_subscription_from_customer_listing() {
        let (manager, store, provider) = setup().await;
        let now = unix_now();

        // The store knows the customer but lost the subscription ref.
        store
            .set_provider_refs("acc_1", Some("cus_1".to_string()), None)
            .await
            .unwrap();
        provider
            .put_subscription(ProviderSubscription {
                id: "sub_old".to_string(),
                customer: Some("cus_1".to_string()),
                status: "canceled".to_string(),
                current_period_end: Some(now - 30 * DAY),
                trial_end: None,
                billing_cycle_anchor: None,
                cancel_at_period_end: false,
                metadata: HashMap::new(),
            })
            .await;
        provider
            .put_subscription(ProviderSubscription {
                id: "sub_new".to_string(),
                customer: Some("cus_1".to_string()),
                status: "active".to_string(),
                current_period_end: Some(now + 25 * DAY),
                trial_end: None,
                billing_cycle_anchor: None,
                cancel_at_period_end: false,
                metadata: HashMap::new(),
            })
            .await;

        let refreshed = manager.refresh("acc_1").await.unwrap().unwrap();
        assert_eq!(refreshed.status, EntitlementStatus::Active);
        assert_eq!(refreshed.subscription_ref.as_deref(), Some("sub_new"));
    }

    #[tokio::test]
    async fn test_refresh_without_record_is_none() {
        let (manager, _store, _provider) = setup().await;
        assert!(manager.refresh("acc_1").await.unwrap().is_none());
    }
}
