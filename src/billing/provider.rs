//! Billing provider adapter trait.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

/// A provider subscription, normalized to the fields the reconciler needs.
///
/// Field names match the provider's wire format so webhook payloads
/// deserialize directly; the live provider constructs the same shape from
/// typed API responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    /// Provider customer reference.
    pub customer: Option<String>,
    /// Raw provider status string; mapped by the reconciler, never stored.
    pub status: String,
    pub current_period_end: Option<u64>,
    pub trial_end: Option<u64>,
    pub billing_cycle_anchor: Option<u64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ProviderSubscription {
    /// The account id the application attached when creating the
    /// subscription, if present.
    #[must_use]
    pub fn account_id(&self) -> Option<&str> {
        self.metadata.get("account_id").map(String::as_str)
    }
}

/// A freshly created subscription, plus the secret the client needs to
/// confirm the first payment.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub subscription: ProviderSubscription,
    /// Payment confirmation secret from the first invoice, when the
    /// provider requires client-side confirmation.
    pub client_secret: Option<String>,
}

/// Client interface to the billing provider.
///
/// No business logic lives here. Provider failures surface as
/// `ProviderApiError` and are interpreted by the callers.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Create a customer, returning its provider reference. The account id
    /// is attached as metadata so webhooks can be resolved back.
    async fn create_customer(&self, email: &str, account_id: &str) -> Result<String>;

    /// Create a subscription on `price_ref` with a trial window.
    async fn create_subscription(
        &self,
        customer_ref: &str,
        price_ref: &str,
        account_id: &str,
        trial_days: u32,
    ) -> Result<NewSubscription>;

    /// Fetch a subscription by reference.
    async fn get_subscription(&self, subscription_ref: &str) -> Result<ProviderSubscription>;

    /// List a customer's subscriptions, most recent first.
    async fn list_subscriptions(&self, customer_ref: &str) -> Result<Vec<ProviderSubscription>>;

    /// Flag a subscription to cancel when the current period ends,
    /// returning its updated state.
    async fn cancel_at_period_end(&self, subscription_ref: &str) -> Result<ProviderSubscription>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;
    use crate::entitlement::error::EntitlementError;

    #[derive(Default)]
    struct MockState {
        subscriptions: HashMap<String, ProviderSubscription>,
        customers_created: u32,
        subscriptions_created: u32,
        cancellations: Vec<String>,
        fail_next: Option<EntitlementError>,
    }

    /// Scriptable in-memory provider for tests.
    #[derive(Clone, Default)]
    pub struct MockBillingProvider {
        state: Arc<Mutex<MockState>>,
    }

    impl MockBillingProvider {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn put_subscription(&self, subscription: ProviderSubscription) {
            let mut state = self.state.lock().await;
            state
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        }

        /// Make the next provider call fail with `err`.
        pub async fn fail_next(&self, err: EntitlementError) {
            self.state.lock().await.fail_next = Some(err);
        }

        pub async fn cancellations(&self) -> Vec<String> {
            self.state.lock().await.cancellations.clone()
        }

        pub async fn customers_created(&self) -> u32 {
            self.state.lock().await.customers_created
        }
    }

    #[async_trait]
    impl BillingProvider for MockBillingProvider {
        async fn create_customer(&self, _email: &str, account_id: &str) -> Result<String> {
            let mut state = self.state.lock().await;
            if let Some(err) = state.fail_next.take() {
                return Err(err.into());
            }
            state.customers_created += 1;
            Ok(format!("cus_mock_{}", account_id))
        }

        async fn create_subscription(
            &self,
            customer_ref: &str,
            _price_ref: &str,
            account_id: &str,
            trial_days: u32,
        ) -> Result<NewSubscription> {
            let mut state = self.state.lock().await;
            if let Some(err) = state.fail_next.take() {
                return Err(err.into());
            }
            state.subscriptions_created += 1;

            let now = crate::util::unix_now();
            let trial_end = now + u64::from(trial_days) * 86_400;
            let mut metadata = HashMap::new();
            metadata.insert("account_id".to_string(), account_id.to_string());

            let subscription = ProviderSubscription {
                id: format!("sub_mock_{}", state.subscriptions_created),
                customer: Some(customer_ref.to_string()),
                status: "trialing".to_string(),
                current_period_end: Some(trial_end),
                trial_end: Some(trial_end),
                billing_cycle_anchor: Some(trial_end),
                cancel_at_period_end: false,
                metadata,
            };
            state
                .subscriptions
                .insert(subscription.id.clone(), subscription.clone());

            Ok(NewSubscription {
                subscription,
                client_secret: Some("pi_mock_secret".to_string()),
            })
        }

        async fn get_subscription(&self, subscription_ref: &str) -> Result<ProviderSubscription> {
            let mut state = self.state.lock().await;
            if let Some(err) = state.fail_next.take() {
                return Err(err.into());
            }
            state.subscriptions.get(subscription_ref).cloned().ok_or_else(|| {
                EntitlementError::ProviderApiError {
                    operation: "get_subscription".to_string(),
                    message: format!("No such subscription: {}", subscription_ref),
                    code: Some("resource_missing".to_string()),
                    http_status: Some(404),
                }
                .into()
            })
        }

        async fn list_subscriptions(&self, customer_ref: &str) -> Result<Vec<ProviderSubscription>> {
            let state = self.state.lock().await;
            Ok(state
                .subscriptions
                .values()
                .filter(|s| s.customer.as_deref() == Some(customer_ref))
                .cloned()
                .collect())
        }

        async fn cancel_at_period_end(
            &self,
            subscription_ref: &str,
        ) -> Result<ProviderSubscription> {
            let mut state = self.state.lock().await;
            if let Some(err) = state.fail_next.take() {
                return Err(err.into());
            }
            state.cancellations.push(subscription_ref.to_string());
            let subscription = state.subscriptions.get_mut(subscription_ref).ok_or_else(|| {
                crate::error::SubgateError::from(EntitlementError::ProviderApiError {
                    operation: "cancel_at_period_end".to_string(),
                    message: format!("No such subscription: {}", subscription_ref),
                    code: Some("resource_missing".to_string()),
                    http_status: Some(404),
                })
            })?;
            subscription.cancel_at_period_end = true;
            Ok(subscription.clone())
        }
    }

}
