//! Webhook signature verification and event parsing.
//!
//! Verification fails closed: any malformed header, stale timestamp, or
//! mismatched digest rejects the request before the payload is parsed.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::entitlement::error::EntitlementError;
use crate::error::Result;
use crate::util::unix_now;

/// Parsed webhook event.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEvent {
    /// Provider-assigned event id, the idempotency key.
    pub id: String,
    /// Event type (e.g., "customer.subscription.updated").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: WebhookEventData,
    /// Timestamp when the event was created.
    pub created: u64,
}

/// Webhook event data.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
}

/// Verifies `Billing-Signature` headers.
///
/// The secret is held as [`SecretString`] so it cannot leak through debug
/// output.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: SecretString,
    /// Maximum accepted clock skew between the signed timestamp and now.
    tolerance_secs: u64,
}

impl SignatureVerifier {
    #[must_use]
    pub fn new(secret: impl Into<SecretString>, tolerance_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Verify the signature header and parse the event.
    ///
    /// The signed message is `"{timestamp}.{payload}"`; the digest is
    /// compared in constant time. Timestamps older than the tolerance are
    /// rejected to bound replay.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent> {
        let sig_parts = parse_signature_header(signature_header)?;

        let now = unix_now() as i64;
        let age = (now - sig_parts.timestamp).abs();
        if age > self.tolerance_secs as i64 {
            return Err(EntitlementError::TimestampExpired { age_seconds: age }.into());
        }

        let signed_payload = format!(
            "{}.{}",
            sig_parts.timestamp,
            String::from_utf8_lossy(payload)
        );
        let expected_sig =
            compute_signature(self.secret.expose_secret(), signed_payload.as_bytes())?;

        let expected_bytes = hex::decode(&expected_sig)
            .map_err(|_| crate::error::SubgateError::Internal("Hex decode error".to_string()))?;
        let provided_bytes =
            hex::decode(&sig_parts.signature).map_err(|_| EntitlementError::SignatureInvalid)?;

        if expected_bytes.ct_eq(&provided_bytes).unwrap_u8() != 1 {
            return Err(EntitlementError::SignatureInvalid.into());
        }

        let event: WebhookEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "subgate::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            EntitlementError::InvalidPayload {
                message: "malformed JSON payload".to_string(),
            }
        })?;

        Ok(event)
    }
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: i64,
    signature: String,
}

/// Parse the signature header (`t=<unix>,v1=<hex digest>`).
fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or(EntitlementError::SignatureInvalid)?;

        match key.trim() {
            "t" => timestamp = value.parse().ok(),
            "v1" => signature = Some(value.to_string()),
            _ => {} // Ignore other versions
        }
    }

    Ok(SignatureParts {
        timestamp: timestamp.ok_or(EntitlementError::SignatureInvalid)?,
        signature: signature.ok_or(EntitlementError::SignatureInvalid)?,
    })
}

/// Compute HMAC-SHA256 signature, hex encoded.
fn compute_signature(secret: &str, payload: &[u8]) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| crate::error::SubgateError::Internal("HMAC error".to_string()))?;

    mac.update(payload);
    let result = mac.finalize();

    Ok(hex::encode(result.into_bytes()))
}

/// Build a valid signature header for a payload. Exposed for tests and
/// local webhook simulation.
#[cfg(any(test, feature = "test-support"))]
pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    // HMAC-SHA256 accepts keys of any length, so this cannot fail.
    let sig = compute_signature(secret, signed_payload.as_bytes()).unwrap_or_default();
    format!("t={},v1={}", timestamp, sig)
}
