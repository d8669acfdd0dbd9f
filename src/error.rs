use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::entitlement::evaluator::DenialReason;

/// The main error type for subgate operations.
///
/// Variants map one-to-one onto HTTP statuses. The crucial distinction for
/// clients is [`SubgateError::Unauthenticated`] (401, no valid session) versus
/// [`SubgateError::EntitlementRequired`] (402, valid session but no access) —
/// the latter carries a machine-readable reason so the client can route to
/// the correct upsell path.
#[derive(Debug, thiserror::Error)]
pub enum SubgateError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Entitlement required: {0}")]
    EntitlementRequired(DenialReason),

    #[error("Billing provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Structured error body returned to clients.
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<DenialReason>,
}

impl SubgateError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn provider_unavailable(msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::EntitlementRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Self::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a message safe to expose to clients in production.
    ///
    /// Client errors (4xx) keep their message — the caller needs to know what
    /// went wrong. Server errors (5xx) collapse to a generic message; the
    /// full detail is logged server-side only.
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Unauthenticated(msg) => format!("Unauthenticated: {}", msg),
            Self::EntitlementRequired(reason) => format!("Entitlement required: {}", reason),
            Self::ProviderUnavailable(_) => "Billing provider unavailable".to_string(),
            Self::Internal(_) | Self::Anyhow(_) => "Internal server error".to_string(),
        }
    }

    /// Convert into a response, optionally exposing internal detail.
    pub fn into_response_with_detail(self, dev_mode: bool) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        let reason = match &self {
            Self::EntitlementRequired(reason) => Some(*reason),
            _ => None,
        };

        let error = if dev_mode {
            self.to_string()
        } else {
            self.safe_message()
        };

        tracing::error!(
            target: "subgate::http",
            status = status.as_u16(),
            error_id = %error_id,
            error = %self,
            "Request failed"
        );

        let body = Json(ErrorResponse {
            error,
            error_id,
            reason,
        });
        (status, body).into_response()
    }
}

impl IntoResponse for SubgateError {
    fn into_response(self) -> Response {
        self.into_response_with_detail(false)
    }
}

/// Result type alias for subgate operations.
pub type Result<T> = std::result::Result<T, SubgateError>;

impl From<serde_json::Error> for SubgateError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            SubgateError::BadRequest(format!("JSON error: {}", err))
        } else {
            SubgateError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}
