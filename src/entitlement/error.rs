//! Entitlement-specific error types.
//!
//! Granular errors for webhook processing, promo redemption, and provider
//! calls. These convert to `SubgateError` for HTTP responses.

use std::fmt;

/// Entitlement-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitlementError {
    // Webhook errors
    /// Webhook signature is invalid or missing.
    SignatureInvalid,
    /// Webhook timestamp is too old (replay attack protection).
    TimestampExpired { age_seconds: i64 },
    /// Webhook event data is malformed.
    InvalidPayload { message: String },

    // Promo errors
    /// The promo code does not exist.
    InvalidCode { code: String },
    /// The account already redeemed this code.
    AlreadyRedeemed { code: String },
    /// The code's global redemption cap is exhausted.
    RedemptionLimitExceeded { code: String },

    // Provider errors
    /// The provider API returned an error.
    ProviderApiError {
        operation: String,
        message: String,
        code: Option<String>,
        http_status: Option<u16>,
    },
    /// The operation failed after multiple retries.
    RetryLimitExceeded { operation: String },
    /// A provider call timed out or the provider is unreachable.
    ProviderUnavailable { operation: String },

    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl fmt::Display for EntitlementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignatureInvalid => {
                write!(f, "Invalid webhook signature")
            }
            Self::TimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::InvalidPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::InvalidCode { code } => {
                write!(f, "Unknown promo code '{}'", code)
            }
            Self::AlreadyRedeemed { code } => {
                write!(f, "Promo code '{}' was already redeemed by this account", code)
            }
            Self::RedemptionLimitExceeded { code } => {
                write!(f, "Promo code '{}' has no redemptions left", code)
            }
            Self::ProviderApiError {
                operation,
                message,
                code,
                http_status,
            } => {
                write!(f, "Provider API error during '{}': {}", operation, message)?;
                if let Some(code) = code {
                    write!(f, " (code: {})", code)?;
                }
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::RetryLimitExceeded { operation } => {
                write!(f, "Operation '{}' failed after multiple retries", operation)
            }
            Self::ProviderUnavailable { operation } => {
                write!(f, "Billing provider unavailable during '{}'", operation)
            }
            Self::Internal { message } => {
                write!(f, "Internal entitlement error: {}", message)
            }
        }
    }
}

impl std::error::Error for EntitlementError {}

impl From<EntitlementError> for crate::error::SubgateError {
    fn from(err: EntitlementError) -> Self {
        match &err {
            // Map to BadRequest (client errors)
            EntitlementError::SignatureInvalid
            | EntitlementError::TimestampExpired { .. }
            | EntitlementError::InvalidPayload { .. }
            | EntitlementError::AlreadyRedeemed { .. }
            | EntitlementError::RedemptionLimitExceeded { .. } => {
                crate::error::SubgateError::BadRequest(err.to_string())
            }

            // Map to NotFound
            EntitlementError::InvalidCode { .. } => {
                crate::error::SubgateError::NotFound(err.to_string())
            }

            EntitlementError::ProviderUnavailable { .. }
            | EntitlementError::RetryLimitExceeded { .. } => {
                crate::error::SubgateError::ProviderUnavailable(err.to_string())
            }

            // Map provider API errors based on HTTP status
            EntitlementError::ProviderApiError { http_status, .. } => match http_status {
                Some(400..=499) => crate::error::SubgateError::BadRequest(err.to_string()),
                _ => crate::error::SubgateError::ProviderUnavailable(err.to_string()),
            },

            EntitlementError::Internal { .. } => {
                crate::error::SubgateError::Internal(err.to_string())
            }
        }
    }
}

impl EntitlementError {
    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::SignatureInvalid
            | Self::TimestampExpired { .. }
            | Self::InvalidPayload { .. }
            | Self::InvalidCode { .. }
            | Self::AlreadyRedeemed { .. }
            | Self::RedemptionLimitExceeded { .. } => true,
            Self::ProviderApiError { http_status, .. } => {
                matches!(http_status, Some(400..=499))
            }
            _ => false,
        }
    }

    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderUnavailable { .. } => true,
            Self::ProviderApiError { http_status, .. } => {
                // Rate limit (429) and server errors (5xx) are retryable
                matches!(http_status, Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EntitlementError::InvalidCode {
            code: "NOPE".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown promo code 'NOPE'");

        let err = EntitlementError::TimestampExpired { age_seconds: 301 };
        assert_eq!(err.to_string(), "Webhook timestamp expired (301 seconds old)");
    }

    #[test]
    fn test_error_classification() {
        let err = EntitlementError::SignatureInvalid;
        assert!(err.is_client_error());
        assert!(!err.is_retryable());

        let err = EntitlementError::ProviderApiError {
            operation: "get_subscription".to_string(),
            message: "rate limited".to_string(),
            code: None,
            http_status: Some(429),
        };
        assert!(err.is_client_error());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_convert_to_subgate_error() {
        let err = EntitlementError::SignatureInvalid;
        let top: crate::error::SubgateError = err.into();
        assert!(matches!(top, crate::error::SubgateError::BadRequest(_)));

        let err = EntitlementError::InvalidCode {
            code: "X".to_string(),
        };
        let top: crate::error::SubgateError = err.into();
        assert!(matches!(top, crate::error::SubgateError::NotFound(_)));

        let err = EntitlementError::RetryLimitExceeded {
            operation: "create_subscription".to_string(),
        };
        let top: crate::error::SubgateError = err.into();
        assert!(matches!(top, crate::error::SubgateError::ProviderUnavailable(_)));
    }
}
