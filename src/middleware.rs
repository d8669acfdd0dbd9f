//! Access control middleware.
//!
//! Two distinct gates per request, in order:
//!
//! 1. Authentication: a valid session resolving to an account, else 401.
//! 2. Entitlement: the evaluator grants access, else 402 with a
//!    machine-readable reason.
//!
//! Conflating the two would strand clients: a 401 means "log in again", a
//! 402 means "the login is fine, the subscription isn't".

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{debug, warn};

use crate::account::{Account, AccountStore};
use crate::entitlement::evaluator::evaluate;
use crate::entitlement::store::{EntitlementStatus, EntitlementStore};
use crate::error::SubgateError;
use crate::session::{extract_token, SessionStore};
use crate::util::unix_now;

/// The authenticated account, inserted into request extensions for
/// downstream handlers.
#[derive(Debug, Clone)]
pub struct CurrentAccount(pub Account);

/// Gate that authenticates the session and checks the entitlement.
///
/// # Example
///
/// ```rust,ignore
/// let gate = AccessGate::new(sessions, accounts, store, "session_token");
/// let protected = Router::new()
///     .route("/api/records", get(records))
///     .layer(axum::middleware::from_fn(move |req, next| {
///         let gate = gate.clone();
///         async move { gate.require_entitlement(req, next).await }
///     }));
/// ```
pub struct AccessGate<Se, A, St> {
    sessions: Se,
    accounts: A,
    store: St,
    cookie_name: String,
}

impl<Se, A, St> Clone for AccessGate<Se, A, St>
where
    Se: Clone,
    A: Clone,
    St: Clone,
{
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            accounts: self.accounts.clone(),
            store: self.store.clone(),
            cookie_name: self.cookie_name.clone(),
        }
    }
}

impl<Se, A, St> AccessGate<Se, A, St>
where
    Se: SessionStore + Clone + Send + Sync + 'static,
    A: AccountStore + Clone + Send + Sync + 'static,
    St: EntitlementStore + Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(sessions: Se, accounts: A, store: St, cookie_name: impl Into<String>) -> Self {
        Self {
            sessions,
            accounts,
            store,
            cookie_name: cookie_name.into(),
        }
    }

    /// Resolve the session to an account or fail with 401.
    async fn authenticate(
        &self,
        headers: &axum::http::HeaderMap,
    ) -> Result<Account, SubgateError> {
        let token = extract_token(headers, &self.cookie_name)
            .ok_or_else(|| SubgateError::unauthenticated("No session token"))?;

        let session = self
            .sessions
            .load(&token)
            .await?
            .ok_or_else(|| SubgateError::unauthenticated("Session expired or unknown"))?;

        let account_id = session
            .account_id()
            .ok_or_else(|| SubgateError::unauthenticated("Session has no account"))?;

        self.accounts
            .get_account(account_id)
            .await?
            .ok_or_else(|| SubgateError::unauthenticated("Account no longer exists"))
    }

    /// Authentication only: 401 or pass, with [`CurrentAccount`] inserted.
    ///
    /// Used by routes that must be reachable without an entitlement, like
    /// the status, promo, and checkout endpoints.
    pub async fn require_session(
        &self,
        mut request: Request,
        next: Next,
    ) -> Result<Response, SubgateError> {
        let account = self.authenticate(request.headers()).await?;
        request.extensions_mut().insert(CurrentAccount(account));
        Ok(next.run(request).await)
    }

    /// Full gate: 401 without a session, 402 without an entitlement.
    pub async fn require_entitlement(
        &self,
        mut request: Request,
        next: Next,
    ) -> Result<Response, SubgateError> {
        let account = self.authenticate(request.headers()).await?;

        let entitlement = self
            .store
            .get(&account.id)
            .await?
            .unwrap_or_else(|| crate::entitlement::store::Entitlement::none(&account.id));

        let evaluation = evaluate(&entitlement, unix_now());
        persist_lazy_expiry(&self.store, &entitlement, &evaluation);

        if !evaluation.has_access {
            debug!(
                target: "subgate::gate",
                account_id = %account.id,
                status = %evaluation.status,
                "Entitlement check denied request"
            );
            // Evaluations that deny always carry a reason.
            let reason = evaluation
                .denial_reason
                .unwrap_or(crate::entitlement::evaluator::DenialReason::SubscriptionRequired);
            return Err(SubgateError::EntitlementRequired(reason));
        }

        request.extensions_mut().insert(CurrentAccount(account));
        Ok(next.run(request).await)
    }
}

/// Persist an observed expiry crossing from a spawned task.
///
/// The caller's response never waits on this write; a failure is logged
/// and the next evaluation retries implicitly.
pub(crate) fn persist_lazy_expiry<St>(
    store: &St,
    entitlement: &crate::entitlement::store::Entitlement,
    evaluation: &crate::entitlement::evaluator::Evaluation,
) where
    St: EntitlementStore + Clone + Send + Sync + 'static,
{
    if evaluation.status != EntitlementStatus::Expired
        || entitlement.status == EntitlementStatus::Expired
    {
        return;
    }

    let store = store.clone();
    let account_id = entitlement.account_id.clone();
    let observed_status = entitlement.status;
    let valid_until = entitlement.status_valid_until;
    tokio::spawn(async move {
        // A reconciler write can land between the evaluation read and this
        // task running; only persist the crossing while the record is still
        // the one that was evaluated.
        let current = match store.get(&account_id).await {
            Ok(current) => current,
            Err(e) => {
                warn!(
                    target: "subgate::gate",
                    account_id = %account_id,
                    error = %e,
                    "Failed to re-read entitlement for lazy expiry"
                );
                return;
            }
        };
        let unchanged = current
            .map_or(false, |c| c.status == observed_status && c.status_valid_until == valid_until);
        if !unchanged {
            return;
        }

        if let Err(e) = store
            .set_status(&account_id, EntitlementStatus::Expired, valid_until)
            .await
        {
            warn!(
                target: "subgate::gate",
                account_id = %account_id,
                error = %e,
                "Failed to persist lazy expiry"
            );
        }
    });
}
