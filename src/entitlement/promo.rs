//! Promo codes and manual free-access overrides.
//!
//! A redeemed promo writes `FreeAccess` with a fixed validity window. The
//! record carries no provider references, so a later provider event about
//! a canceled subscription cannot claw the window back; the evaluator's
//! priority rules keep free access first.

use std::collections::HashMap;

use tracing::info;

use super::error::EntitlementError;
use super::store::{
    Entitlement, EntitlementStatus, EntitlementStore, PromoOutcome, ReconciledUpdate,
};
use crate::error::Result;
use crate::util::unix_now;

const SECONDS_PER_DAY: u64 = 86_400;

/// A redeemable promo offer.
#[derive(Debug, Clone)]
pub struct PromoOffer {
    pub code: String,
    /// Free-access window granted on redemption, in days. `None` falls back
    /// to the manager's configured default window.
    pub window_days: Option<u32>,
    /// Global cap across all accounts. `None` means unlimited.
    pub max_redemptions: Option<u32>,
}

/// The set of promo codes an application honors.
///
/// Codes are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct PromoCatalog {
    offers: HashMap<String, PromoOffer>,
}

impl PromoCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn offer(
        mut self,
        code: impl Into<String>,
        window_days: impl Into<Option<u32>>,
        max_redemptions: Option<u32>,
    ) -> Self {
        let code = code.into().to_uppercase();
        self.offers.insert(
            code.clone(),
            PromoOffer {
                code,
                window_days: window_days.into(),
                max_redemptions,
            },
        );
        self
    }

    #[must_use]
    pub fn get(&self, code: &str) -> Option<&PromoOffer> {
        self.offers.get(&code.to_uppercase())
    }
}

/// Redeems promo codes against the entitlement store.
#[derive(Clone)]
pub struct PromoManager<S> {
    store: S,
    catalog: PromoCatalog,
    /// Window applied to offers that don't set their own, in days.
    default_window_days: u32,
}

impl<S: EntitlementStore> PromoManager<S> {
    #[must_use]
    pub fn new(store: S, catalog: PromoCatalog, default_window_days: u32) -> Self {
        Self {
            store,
            catalog,
            default_window_days,
        }
    }

    /// Redeem `code` for `account_id`.
    ///
    /// Exactly-once per account per code and the global cap are both
    /// enforced inside a single store critical section, so concurrent
    /// redemption attempts cannot double-grant.
    pub async fn redeem(&self, account_id: &str, code: &str) -> Result<Entitlement> {
        let offer = self
            .catalog
            .get(code)
            .ok_or_else(|| EntitlementError::InvalidCode {
                code: code.to_string(),
            })?;

        let window_days = offer.window_days.unwrap_or(self.default_window_days);
        let valid_until = unix_now() + u64::from(window_days) * SECONDS_PER_DAY;
        let update = ReconciledUpdate {
            status: EntitlementStatus::FreeAccess,
            status_valid_until: Some(valid_until),
            customer_ref: None,
            subscription_ref: None,
        };

        let outcome = self
            .store
            .redeem_promo(account_id, &offer.code, update, offer.max_redemptions)
            .await?;

        match outcome {
            PromoOutcome::Redeemed(entitlement) => {
                info!(
                    target: "subgate::promo",
                    account_id = %account_id,
                    code = %offer.code,
                    valid_until = valid_until,
                    "Promo code redeemed"
                );
                Ok(entitlement)
            }
            PromoOutcome::AlreadyRedeemed => Err(EntitlementError::AlreadyRedeemed {
                code: offer.code.clone(),
            }
            .into()),
            PromoOutcome::LimitExceeded => Err(EntitlementError::RedemptionLimitExceeded {
                code: offer.code.clone(),
            }
            .into()),
        }
    }
}
