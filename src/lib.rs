//! # subgate
//!
//! Subscription entitlement reconciliation and access gating for
//! Stripe-backed SaaS backends.
//!
//! subgate keeps one entitlement record per account consistent with the
//! billing provider's asynchronous webhook stream, evaluates access from
//! that record with a pure function, and gates HTTP routes on the result.
//!
//! The crate is organized around trait seams so the host application owns
//! persistence and auth:
//!
//! - [`entitlement::EntitlementStore`] — the entitlement record, webhook
//!   idempotency markers, and promo redemptions
//! - [`account::AccountStore`] — lookup of accounts by id or email, owned
//!   by the host's auth subsystem
//! - [`session::SessionStore`] — session token to account id resolution
//! - [`billing::BillingProvider`] — the thin provider adapter; the
//!   production implementation talks to Stripe via `async-stripe`
//!
//! In-memory implementations of every seam ship under `pub mod test`
//! (enabled for tests or via the `test-support` feature) so the whole
//! HTTP surface can be exercised without a database or network.
//!
//! # Example
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() {
//!     subgate::init_tracing();
//!     // Build stores, a provider, and the router; see `http::router`.
//! }
//! ```

pub mod account;
pub mod billing;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod http;
pub mod middleware;
pub mod session;
pub mod testing;
mod util;

// Re-exports for public API
pub use account::{Account, AccountStore};
pub use billing::provider::{BillingProvider, ProviderSubscription};
pub use billing::reconciler::{EventReconciler, ReconcileOutcome};
pub use config::{ConfigBuilder, SubgateConfig};
pub use entitlement::evaluator::{evaluate, DenialReason, Evaluation};
pub use entitlement::promo::{PromoCatalog, PromoManager};
pub use entitlement::store::{Entitlement, EntitlementStatus, EntitlementStore};
pub use error::{Result, SubgateError};
pub use middleware::AccessGate;
pub use session::{SessionData, SessionStore};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main().
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "subgate=debug")
/// - `SUBGATE_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("SUBGATE_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
