//! Entitlement state, evaluation, and promo overrides.
//!
//! The entitlement record is the local source of truth for what an account
//! may access. It is written only by the webhook reconciler, the promo
//! manager, and the lazy-expiry path; everything else reads it through the
//! pure [`evaluator`].

pub mod error;
pub mod evaluator;
pub mod promo;
pub mod store;

pub use error::EntitlementError;
pub use evaluator::{evaluate, DenialReason, Evaluation};
pub use promo::{PromoCatalog, PromoManager, PromoOffer};
pub use store::{Entitlement, EntitlementStatus, EntitlementStore, PromoOutcome, ReconciledUpdate};
