//! Account lookup seam.
//!
//! subgate never creates or mutates accounts. The host application's auth
//! subsystem owns them; this trait is the minimal read surface the
//! reconciler and middleware need to resolve webhook payloads and sessions
//! to an account.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A host-application account, as seen by the entitlement subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
}

/// Read access to host accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetch an account by its id. `Ok(None)` when no such account exists.
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>>;

    /// Fetch an account by email, used as the last resort when a webhook
    /// payload carries no account metadata.
    async fn get_account_by_email(&self, email: &str) -> Result<Option<Account>>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::sync::RwLock;

    use super::*;

    /// In-memory account store for tests.
    #[derive(Clone, Default)]
    pub struct InMemoryAccountStore {
        accounts: Arc<RwLock<HashMap<String, Account>>>,
    }

    impl InMemoryAccountStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn insert(&self, account: Account) {
            self.accounts
                .write()
                .await
                .insert(account.id.clone(), account);
        }
    }

    #[async_trait]
    impl AccountStore for InMemoryAccountStore {
        async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
            Ok(self.accounts.read().await.get(account_id).cloned())
        }

        async fn get_account_by_email(&self, email: &str) -> Result<Option<Account>> {
            Ok(self
                .accounts
                .read()
                .await
                .values()
                .find(|a| a.email.eq_ignore_ascii_case(email))
                .cloned())
        }
    }

}
