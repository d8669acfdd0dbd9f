//! Session storage trait
//!
//! The access gate resolves a session token to an account id through this
//! seam. The host application decides where sessions actually live; an
//! in-memory implementation is provided for tests.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Key under which the authenticated account id is stored in a session.
pub const ACCOUNT_ID_KEY: &str = "account_id";

/// Session data stored in the session store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    /// Session data as key-value pairs
    pub data: HashMap<String, String>,

    /// When the session was created
    pub created_at: SystemTime,

    /// When the session expires
    pub expires_at: SystemTime,
}

impl SessionData {
    /// Create a new session with expiration
    pub fn new(ttl: Duration) -> Self {
        let now = SystemTime::now();
        Self {
            data: HashMap::new(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Create a session already bound to an account.
    pub fn for_account(account_id: impl Into<String>, ttl: Duration) -> Self {
        let mut session = Self::new(ttl);
        session.set(ACCOUNT_ID_KEY.to_string(), account_id.into());
        session
    }

    /// Check if the session has expired
    pub fn is_expired(&self) -> bool {
        SystemTime::now() > self.expires_at
    }

    /// Get a value from the session
    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    /// Set a value in the session
    pub fn set(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    /// The account this session authenticates, if any.
    pub fn account_id(&self) -> Option<&String> {
        self.data.get(ACCOUNT_ID_KEY)
    }
}

/// Session storage trait
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load session data by session token
    ///
    /// Returns `Ok(None)` if the session doesn't exist or has expired.
    async fn load(&self, token: &str) -> Result<Option<SessionData>>;

    /// Save session data under a token
    async fn save(&self, token: &str, data: SessionData) -> Result<()>;

    /// Delete a session
    async fn delete(&self, token: &str) -> Result<()>;

    /// Clean up expired sessions, returning how many were removed
    async fn cleanup_expired(&self) -> Result<usize>;
}

/// In-memory session store backed by a `RwLock<HashMap>`.
///
/// Suitable for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: std::sync::Arc<tokio::sync::RwLock<HashMap<String, SessionData>>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, token: &str) -> Result<Option<SessionData>> {
        let sessions = self.sessions.read().await;
        match sessions.get(token) {
            Some(data) if !data.is_expired() => Ok(Some(data.clone())),
            _ => Ok(None),
        }
    }

    async fn save(&self, token: &str, data: SessionData) -> Result<()> {
        self.sessions.write().await.insert(token.to_string(), data);
        Ok(())
    }

    async fn delete(&self, token: &str) -> Result<()> {
        self.sessions.write().await.remove(token);
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, data| !data.is_expired());
        Ok(before - sessions.len())
    }
}

/// Extract a session token from a request: the configured cookie first,
/// then `Authorization: Bearer`.
pub fn extract_token(headers: &axum::http::HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(cookie_header) = headers.get(axum::http::header::COOKIE) {
        if let Ok(cookies) = cookie_header.to_str() {
            for cookie in cookies.split(';') {
                let cookie = cookie.trim();
                if let Some(value) = cookie.strip_prefix(cookie_name) {
                    if let Some(value) = value.strip_prefix('=') {
                        if !value.is_empty() {
                            return Some(value.to_string());
                        }
                    }
                }
            }
        }
    }

    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}
