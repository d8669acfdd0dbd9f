//! Billing provider integration.
//!
//! The provider adapter is deliberately thin: it signs and ships API calls
//! and normalizes responses into [`provider::ProviderSubscription`]. All
//! interpretation of provider state happens in the [`reconciler`], which is
//! the single writer of provider-derived entitlement state.

pub mod checkout;
pub mod live_provider;
pub mod provider;
pub mod reconciler;
pub mod webhook;

pub use checkout::{CheckoutManager, CheckoutStart};
pub use live_provider::{LiveBillingProvider, LiveProviderConfig};
pub use provider::{BillingProvider, NewSubscription, ProviderSubscription};
pub use reconciler::{EventReconciler, ReconcileOutcome};
pub use webhook::{SignatureVerifier, WebhookEvent, WebhookEventData};
