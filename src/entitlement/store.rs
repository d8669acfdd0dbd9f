//! Entitlement persistence.
//!
//! One record per account, written through a small set of atomic
//! operations. Writes are last-write-wins per record; ordering correctness
//! for webhook-driven writes belongs to the reconciler, which decides
//! before calling [`EntitlementStore::apply`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::util::unix_now;

/// Entitlement status of an account.
///
/// This is a closed vocabulary. Provider statuses are mapped through
/// [`EntitlementStatus::from_provider`] at the reconciler boundary; nothing
/// else in the crate ever sees a raw provider string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    /// No entitlement record has ever been established.
    None,
    /// Subscription ended or was never completed.
    Inactive,
    /// In a trial window.
    Trial,
    /// Paying subscriber in good standing.
    Active,
    /// Payment failed; in the provider's grace period.
    PastDue,
    /// Canceled and past its final period.
    Canceled,
    /// Promo or manual override, independent of any provider state.
    FreeAccess,
    /// A trial or free-access window lapsed.
    Expired,
    /// Checkout started but payment was never confirmed.
    Incomplete,
}

impl EntitlementStatus {
    /// Map a provider status string into the closed vocabulary.
    ///
    /// Accepts both the provider's subscription statuses and this crate's
    /// own serialized names, so reconciling a record we wrote ourselves is
    /// a no-op. Returns `None` for unrecognized strings; the caller decides
    /// how loudly to complain.
    #[must_use]
    pub fn from_provider(status: &str) -> Option<Self> {
        match status {
            "trialing" | "trial" => Some(Self::Trial),
            "active" => Some(Self::Active),
            "past_due" => Some(Self::PastDue),
            "canceled" | "unpaid" | "incomplete_expired" | "inactive" => Some(Self::Inactive),
            "incomplete" => Some(Self::Incomplete),
            "free_access" => Some(Self::FreeAccess),
            "expired" => Some(Self::Expired),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Serialized name, as stored and as returned by the status endpoint.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Inactive => "inactive",
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::FreeAccess => "free_access",
            Self::Expired => "expired",
            Self::Incomplete => "incomplete",
        }
    }
}

impl std::fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The entitlement record for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub account_id: String,
    pub status: EntitlementStatus,
    /// End of the current validity window, unix seconds. `None` means the
    /// status has no expiry (e.g. `Active`) or the provider supplied no
    /// usable timestamp (a logged, degraded state).
    pub status_valid_until: Option<u64>,
    /// Provider customer reference, if one exists.
    pub customer_ref: Option<String>,
    /// Provider subscription reference, if one exists.
    pub subscription_ref: Option<String>,
    /// When this record was last written, unix seconds.
    pub updated_at: u64,
}

impl Entitlement {
    /// The empty record used for accounts that have never touched billing.
    #[must_use]
    pub fn none(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            status: EntitlementStatus::None,
            status_valid_until: None,
            customer_ref: None,
            subscription_ref: None,
            updated_at: unix_now(),
        }
    }
}

/// A fully-derived update, produced by the reconciler or promo manager and
/// applied in one store write.
#[derive(Debug, Clone)]
pub struct ReconciledUpdate {
    pub status: EntitlementStatus,
    pub status_valid_until: Option<u64>,
    /// `Some` overwrites the stored ref, `None` leaves it untouched.
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
}

/// Outcome of a transactional promo redemption.
#[derive(Debug, Clone)]
pub enum PromoOutcome {
    Redeemed(Entitlement),
    AlreadyRedeemed,
    LimitExceeded,
}

/// Persistence seam for entitlement records, webhook idempotency markers,
/// and promo redemptions.
///
/// Implementations must make [`apply`](EntitlementStore::apply) a single
/// atomic write and [`redeem_promo`](EntitlementStore::redeem_promo) a
/// single critical section (a transaction, for database-backed stores).
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Fetch the entitlement for an account. `Ok(None)` when no record exists.
    async fn get(&self, account_id: &str) -> Result<Option<Entitlement>>;

    /// Upsert the full derived state for an account in one write.
    async fn apply(&self, account_id: &str, update: ReconciledUpdate) -> Result<Entitlement>;

    /// Overwrite just the status and validity window. Used by lazy expiry.
    async fn set_status(
        &self,
        account_id: &str,
        status: EntitlementStatus,
        status_valid_until: Option<u64>,
    ) -> Result<()>;

    /// Record provider references after checkout, leaving status untouched.
    async fn set_provider_refs(
        &self,
        account_id: &str,
        customer_ref: Option<String>,
        subscription_ref: Option<String>,
    ) -> Result<()>;

    /// Find the account owning a provider customer reference.
    async fn find_by_customer_ref(&self, customer_ref: &str) -> Result<Option<Entitlement>>;

    /// Find the account owning a provider subscription reference.
    async fn find_by_subscription_ref(&self, subscription_ref: &str)
        -> Result<Option<Entitlement>>;

    /// Whether a webhook event id has already been processed.
    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    /// Mark a webhook event id as processed.
    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;

    /// Drop processed-event markers older than `days`. Returns how many
    /// were removed. Retention must comfortably exceed the provider's
    /// redelivery window.
    async fn cleanup_old_events(&self, days: u32) -> Result<u64>;

    /// Redeem a promo code for an account: exactly once per account per
    /// code, bounded by `max_redemptions` across all accounts, and the
    /// redemption marker plus the entitlement write commit together.
    async fn redeem_promo(
        &self,
        account_id: &str,
        code: &str,
        update: ReconciledUpdate,
        max_redemptions: Option<u32>,
    ) -> Result<PromoOutcome>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct State {
        entitlements: HashMap<String, Entitlement>,
        processed_events: HashMap<String, u64>,
        // code -> set of account ids that redeemed it
        redemptions: HashMap<String, HashSet<String>>,
    }

    /// In-memory entitlement store.
    ///
    /// A single mutex over all state makes `apply` and `redeem_promo`
    /// trivially atomic, standing in for the transaction a database-backed
    /// implementation would use.
    #[derive(Clone, Default)]
    pub struct InMemoryEntitlementStore {
        state: Arc<Mutex<State>>,
    }

    impl InMemoryEntitlementStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a record directly, bypassing the reconciler. Test setup only.
        pub async fn insert(&self, entitlement: Entitlement) {
            let mut state = self.state.lock().await;
            state
                .entitlements
                .insert(entitlement.account_id.clone(), entitlement);
        }

        /// Rewrite an event marker's timestamp. Test setup only.
        pub async fn backdate_event(&self, event_id: &str, at: u64) {
            let mut state = self.state.lock().await;
            state.processed_events.insert(event_id.to_string(), at);
        }

        /// Total redemptions recorded for a code, across all accounts.
        pub async fn redemption_count(&self, code: &str) -> usize {
            let state = self.state.lock().await;
            state.redemptions.get(code).map_or(0, HashSet::len)
        }
    }

    fn apply_update(
        entitlements: &mut HashMap<String, Entitlement>,
        account_id: &str,
        update: ReconciledUpdate,
    ) -> Entitlement {
        let entry = entitlements
            .entry(account_id.to_string())
            .or_insert_with(|| Entitlement::none(account_id));
        entry.status = update.status;
        entry.status_valid_until = update.status_valid_until;
        if update.customer_ref.is_some() {
            entry.customer_ref = update.customer_ref;
        }
        if update.subscription_ref.is_some() {
            entry.subscription_ref = update.subscription_ref;
        }
        entry.updated_at = unix_now();
        entry.clone()
    }

    #[async_trait]
    impl EntitlementStore for InMemoryEntitlementStore {
        async fn get(&self, account_id: &str) -> Result<Option<Entitlement>> {
            let state = self.state.lock().await;
            Ok(state.entitlements.get(account_id).cloned())
        }

        async fn apply(&self, account_id: &str, update: ReconciledUpdate) -> Result<Entitlement> {
            let mut state = self.state.lock().await;
            Ok(apply_update(&mut state.entitlements, account_id, update))
        }

        async fn set_status(
            &self,
            account_id: &str,
            status: EntitlementStatus,
            status_valid_until: Option<u64>,
        ) -> Result<()> {
            let mut state = self.state.lock().await;
            let entry = state
                .entitlements
                .entry(account_id.to_string())
                .or_insert_with(|| Entitlement::none(account_id));
            entry.status = status;
            entry.status_valid_until = status_valid_until;
            entry.updated_at = unix_now();
            Ok(())
        }

        async fn set_provider_refs(
            &self,
            account_id: &str,
            customer_ref: Option<String>,
            subscription_ref: Option<String>,
        ) -> Result<()> {
            let mut state = self.state.lock().await;
            let entry = state
                .entitlements
                .entry(account_id.to_string())
                .or_insert_with(|| Entitlement::none(account_id));
            if customer_ref.is_some() {
                entry.customer_ref = customer_ref;
            }
            if subscription_ref.is_some() {
                entry.subscription_ref = subscription_ref;
            }
            entry.updated_at = unix_now();
            Ok(())
        }

        async fn find_by_customer_ref(&self, customer_ref: &str) -> Result<Option<Entitlement>> {
            let state = self.state.lock().await;
            Ok(state
                .entitlements
                .values()
                .find(|e| e.customer_ref.as_deref() == Some(customer_ref))
                .cloned())
        }

        async fn find_by_subscription_ref(
            &self,
            subscription_ref: &str,
        ) -> Result<Option<Entitlement>> {
            let state = self.state.lock().await;
            Ok(state
                .entitlements
                .values()
                .find(|e| e.subscription_ref.as_deref() == Some(subscription_ref))
                .cloned())
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            let state = self.state.lock().await;
            Ok(state.processed_events.contains_key(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            let mut state = self.state.lock().await;
            state
                .processed_events
                .insert(event_id.to_string(), unix_now());
            Ok(())
        }

        async fn cleanup_old_events(&self, days: u32) -> Result<u64> {
            let cutoff = unix_now().saturating_sub(u64::from(days) * 86400);
            let mut state = self.state.lock().await;
            let before = state.processed_events.len();
            state.processed_events.retain(|_, at| *at >= cutoff);
            Ok((before - state.processed_events.len()) as u64)
        }

        async fn redeem_promo(
            &self,
            account_id: &str,
            code: &str,
            update: ReconciledUpdate,
            max_redemptions: Option<u32>,
        ) -> Result<PromoOutcome> {
            let mut state = self.state.lock().await;

            let redeemed = state.redemptions.entry(code.to_string()).or_default();
            if redeemed.contains(account_id) {
                return Ok(PromoOutcome::AlreadyRedeemed);
            }
            if let Some(max) = max_redemptions {
                if redeemed.len() as u32 >= max {
                    return Ok(PromoOutcome::LimitExceeded);
                }
            }
            redeemed.insert(account_id.to_string());

            let entitlement = apply_update(&mut state.entitlements, account_id, update);
            Ok(PromoOutcome::Redeemed(entitlement))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn free_access_update(until: u64) -> ReconciledUpdate {
            ReconciledUpdate {
                status: EntitlementStatus::FreeAccess,
                status_valid_until: Some(until),
                customer_ref: None,
                subscription_ref: None,
            }
        }

        #[tokio::test]
        async fn test_apply_preserves_refs_when_update_has_none() {
            let store = InMemoryEntitlementStore::new();
            store
                .apply(
                    "acc_1",
                    ReconciledUpdate {
                        status: EntitlementStatus::Trial,
                        status_valid_until: Some(1_000),
                        customer_ref: Some("cus_1".to_string()),
                        subscription_ref: Some("sub_1".to_string()),
                    },
                )
                .await
                .unwrap();

            let updated = store
                .apply(
                    "acc_1",
                    ReconciledUpdate {
                        status: EntitlementStatus::Active,
                        status_valid_until: Some(2_000),
                        customer_ref: None,
                        subscription_ref: None,
                    },
                )
                .await
                .unwrap();

            assert_eq!(updated.status, EntitlementStatus::Active);
            assert_eq!(updated.customer_ref.as_deref(), Some("cus_1"));
            assert_eq!(updated.subscription_ref.as_deref(), Some("sub_1"));
        }

        #[tokio::test]
        async fn test_find_by_refs() {
            let store = InMemoryEntitlementStore::new();
            store
                .apply(
                    "acc_1",
                    ReconciledUpdate {
                        status: EntitlementStatus::Active,
                        status_valid_until: None,
                        customer_ref: Some("cus_1".to_string()),
                        subscription_ref: Some("sub_1".to_string()),
                    },
                )
                .await
                .unwrap();

            let by_customer = store.find_by_customer_ref("cus_1").await.unwrap().unwrap();
            assert_eq!(by_customer.account_id, "acc_1");
            let by_sub = store.find_by_subscription_ref("sub_1").await.unwrap().unwrap();
            assert_eq!(by_sub.account_id, "acc_1");
            assert!(store.find_by_customer_ref("cus_2").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_event_idempotency_markers() {
            let store = InMemoryEntitlementStore::new();
            assert!(!store.is_event_processed("evt_1").await.unwrap());
            store.mark_event_processed("evt_1").await.unwrap();
            assert!(store.is_event_processed("evt_1").await.unwrap());

            // A fresh marker survives a 30-day cleanup.
            assert_eq!(store.cleanup_old_events(30).await.unwrap(), 0);
            assert!(store.is_event_processed("evt_1").await.unwrap());
            // A zero-day retention drops everything at or before now minus zero.
            assert_eq!(store.cleanup_old_events(0).await.unwrap(), 0);
        }

        #[tokio::test]
        async fn test_redeem_promo_once_per_account() {
            let store = InMemoryEntitlementStore::new();

            let first = store
                .redeem_promo("acc_1", "SIXMONTHSFREE", free_access_update(9_999), Some(100))
                .await
                .unwrap();
            assert!(matches!(first, PromoOutcome::Redeemed(_)));

            let second = store
                .redeem_promo("acc_1", "SIXMONTHSFREE", free_access_update(9_999), Some(100))
                .await
                .unwrap();
            assert!(matches!(second, PromoOutcome::AlreadyRedeemed));
            assert_eq!(store.redemption_count("SIXMONTHSFREE").await, 1);
        }

        #[tokio::test]
        async fn test_redeem_promo_global_cap() {
            let store = InMemoryEntitlementStore::new();
            for account in ["acc_1", "acc_2"] {
                let outcome = store
                    .redeem_promo(account, "CAPPED", free_access_update(9_999), Some(2))
                    .await
                    .unwrap();
                assert!(matches!(outcome, PromoOutcome::Redeemed(_)));
            }

            let third = store
                .redeem_promo("acc_3", "CAPPED", free_access_update(9_999), Some(2))
                .await
                .unwrap();
            assert!(matches!(third, PromoOutcome::LimitExceeded));
        }

        #[tokio::test]
        async fn test_concurrent_redemptions_stay_exactly_once() {
            let store = InMemoryEntitlementStore::new();
            let mut handles = Vec::new();
            for _ in 0..16 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    store
                        .redeem_promo("acc_1", "RACE", free_access_update(9_999), Some(100))
                        .await
                        .unwrap()
                }));
            }

            let mut redeemed = 0;
            for handle in handles {
                if matches!(handle.await.unwrap(), PromoOutcome::Redeemed(_)) {
                    redeemed += 1;
                }
            }
            assert_eq!(redeemed, 1);
            assert_eq!(store.redemption_count("RACE").await, 1);
        }
    }

    #[cfg(test)]
    mod status_tests {
        use super::*;

        #[test]
        fn test_from_provider_mapping() {
            assert_eq!(
                EntitlementStatus::from_provider("trialing"),
                Some(EntitlementStatus::Trial)
            );
            assert_eq!(
                EntitlementStatus::from_provider("active"),
                Some(EntitlementStatus::Active)
            );
            assert_eq!(
                EntitlementStatus::from_provider("past_due"),
                Some(EntitlementStatus::PastDue)
            );
            assert_eq!(
                EntitlementStatus::from_provider("canceled"),
                Some(EntitlementStatus::Inactive)
            );
            assert_eq!(
                EntitlementStatus::from_provider("unpaid"),
                Some(EntitlementStatus::Inactive)
            );
            assert_eq!(
                EntitlementStatus::from_provider("incomplete"),
                Some(EntitlementStatus::Incomplete)
            );
            // Our own names round-trip.
            assert_eq!(
                EntitlementStatus::from_provider("free_access"),
                Some(EntitlementStatus::FreeAccess)
            );
            assert_eq!(EntitlementStatus::from_provider("paused"), None);
        }

        #[test]
        fn test_serialized_names() {
            assert_eq!(EntitlementStatus::FreeAccess.as_str(), "free_access");
            assert_eq!(
                serde_json::to_string(&EntitlementStatus::PastDue).unwrap(),
                "\"past_due\""
            );
        }
    }
}
