//! Live billing provider on the Stripe API.
//!
//! Production client with retry logic, secure API key handling, and error
//! mapping into the entitlement error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::provider::{BillingProvider, NewSubscription, ProviderSubscription};
use crate::entitlement::error::EntitlementError;
use crate::error::Result;

/// Metadata key linking provider objects back to a host account.
const META_ACCOUNT_ID: &str = "account_id";

/// Configuration for the live provider.
#[derive(Debug, Clone)]
pub struct LiveProviderConfig {
    /// Maximum number of retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveProviderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_seconds: 10,
        }
    }
}

impl From<&crate::config::SubgateConfig> for LiveProviderConfig {
    /// Lift the provider knobs out of the application config, keeping the
    /// backoff shape at its defaults.
    fn from(config: &crate::config::SubgateConfig) -> Self {
        Self {
            max_retries: config.provider_max_retries,
            timeout_seconds: config.provider_timeout_secs,
            ..Self::default()
        }
    }
}

impl LiveProviderConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Error returned when API key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidApiKeyError {
    pub reason: String,
}

impl std::fmt::Display for InvalidApiKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid provider API key: {}", self.reason)
    }
}

impl std::error::Error for InvalidApiKeyError {}

/// Validate a Stripe API key format.
///
/// Valid formats are `sk_test_*`, `sk_live_*`, `rk_test_*`, `rk_live_*`.
fn validate_api_key(key: &str) -> std::result::Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidApiKeyError {
            reason: "API key cannot be empty".to_string(),
        });
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_"
                .to_string(),
        });
    }

    Ok(())
}

#[inline]
fn parse_customer_id(id: &str) -> Result<stripe::CustomerId> {
    id.parse()
        .map_err(|_| crate::error::SubgateError::BadRequest(format!("Invalid customer ref: {}", id)))
}

#[inline]
fn parse_subscription_id(id: &str) -> Result<stripe::SubscriptionId> {
    id.parse().map_err(|_| {
        crate::error::SubgateError::BadRequest(format!("Invalid subscription ref: {}", id))
    })
}

/// Live Stripe-backed provider.
///
/// The API key is validated up front and held as a [`SecretString`];
/// mutating calls carry idempotency keys so retried requests cannot
/// double-create.
#[derive(Clone)]
pub struct LiveBillingProvider {
    client: stripe::Client,
    config: LiveProviderConfig,
    api_key: SecretString,
}

impl LiveBillingProvider {
    /// Create a new live provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn new(
        api_key: impl Into<SecretString>,
        config: LiveProviderConfig,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        let api_key: SecretString = api_key.into();
        validate_api_key(api_key.expose_secret())?;

        let client = stripe::Client::new(api_key.expose_secret());

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// Create a provider with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn with_default_config(
        api_key: impl Into<SecretString>,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        Self::new(api_key, LiveProviderConfig::default())
    }

    /// Check if the provider is using a test mode API key.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    #[inline]
    fn idempotent_client(&self, operation: &str) -> stripe::Client {
        let key = format!("{}_{}", operation, uuid::Uuid::new_v4());
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key))
    }
}

// Debug implementation that doesn't expose the API key
impl std::fmt::Debug for LiveBillingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBillingProvider")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

/// Execute an operation with timeout, retrying 429s, 5xx and timeouts.
async fn with_retry<T, F, Fut>(
    config: &LiveProviderConfig,
    operation: &str,
    operation_fn: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, stripe::StripeError>>,
{
    let timeout_duration = Duration::from_secs(config.timeout_seconds);
    let mut attempts = 0;

    loop {
        let result = tokio::time::timeout(timeout_duration, operation_fn()).await;

        match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                if !is_retryable_error(&e) || attempts >= config.max_retries {
                    return Err(map_stripe_error(e, operation));
                }

                let delay = calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
                tracing::warn!(
                    target: "subgate::provider",
                    operation = operation,
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying provider API call after transient error"
                );
                tokio::time::sleep(delay).await;
                attempts += 1;
            }
            Err(_timeout) => {
                if attempts >= config.max_retries {
                    return Err(EntitlementError::ProviderUnavailable {
                        operation: operation.to_string(),
                    }
                    .into());
                }

                tracing::warn!(
                    target: "subgate::provider",
                    operation = operation,
                    attempt = attempts + 1,
                    timeout_seconds = config.timeout_seconds,
                    "Provider API request timed out, retrying"
                );
                let delay = calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
                tokio::time::sleep(delay).await;
                attempts += 1;
            }
        }
    }
}

#[inline]
fn is_retryable_error(error: &stripe::StripeError) -> bool {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            status == 429 || (500..600).contains(&status)
        }
        stripe::StripeError::Timeout => true,
        _ => false,
    }
}

/// Exponential backoff with jitter (0-25% of the delay).
#[inline]
fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

/// Map Stripe errors into the entitlement error taxonomy.
fn map_stripe_error(error: stripe::StripeError, operation: &str) -> crate::error::SubgateError {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let http_status = request_error.http_status;
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            let code = request_error.code.as_ref().map(|c| format!("{c:?}"));

            EntitlementError::ProviderApiError {
                operation: operation.to_string(),
                message,
                code,
                http_status: Some(http_status),
            }
            .into()
        }
        stripe::StripeError::QueryStringSerialize(e) => EntitlementError::Internal {
            message: format!("Failed to serialize request: {e}"),
        }
        .into(),
        stripe::StripeError::JSONSerialize(e) => EntitlementError::Internal {
            message: format!("Failed to serialize JSON: {e}"),
        }
        .into(),
        stripe::StripeError::UnsupportedVersion => EntitlementError::Internal {
            message: "Unsupported provider API version".to_string(),
        }
        .into(),
        stripe::StripeError::ClientError(msg) => EntitlementError::Internal {
            message: format!("HTTP client error: {msg}"),
        }
        .into(),
        stripe::StripeError::Timeout => EntitlementError::ProviderUnavailable {
            operation: operation.to_string(),
        }
        .into(),
    }
}

/// Normalize a provider subscription into the wire shape the reconciler
/// consumes.
fn map_subscription(sub: stripe::Subscription) -> ProviderSubscription {
    let status = match sub.status {
        stripe::SubscriptionStatus::Active => "active",
        stripe::SubscriptionStatus::Canceled => "canceled",
        stripe::SubscriptionStatus::Incomplete => "incomplete",
        stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        stripe::SubscriptionStatus::PastDue => "past_due",
        stripe::SubscriptionStatus::Trialing => "trialing",
        stripe::SubscriptionStatus::Unpaid => "unpaid",
        stripe::SubscriptionStatus::Paused => "paused",
    };

    let customer = match &sub.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    };

    ProviderSubscription {
        id: sub.id.to_string(),
        customer: Some(customer),
        status: status.to_string(),
        current_period_end: u64::try_from(sub.current_period_end).ok(),
        trial_end: sub.trial_end.and_then(|t| u64::try_from(t).ok()),
        billing_cycle_anchor: u64::try_from(sub.billing_cycle_anchor).ok(),
        cancel_at_period_end: sub.cancel_at_period_end,
        metadata: sub.metadata,
    }
}

/// Pull the first invoice's payment confirmation secret out of an expanded
/// subscription, when present.
fn extract_client_secret(sub: &stripe::Subscription) -> Option<String> {
    let invoice = match sub.latest_invoice.as_ref()? {
        stripe::Expandable::Object(invoice) => invoice,
        stripe::Expandable::Id(_) => return None,
    };
    let payment_intent = match invoice.payment_intent.as_ref()? {
        stripe::Expandable::Object(pi) => pi,
        stripe::Expandable::Id(_) => return None,
    };
    payment_intent.client_secret.clone()
}

#[async_trait]
impl BillingProvider for LiveBillingProvider {
    async fn create_customer(&self, email: &str, account_id: &str) -> Result<String> {
        let client = self.idempotent_client("create_customer");

        let mut params = stripe::CreateCustomer::new();
        params.email = Some(email);
        let mut meta = std::collections::HashMap::new();
        meta.insert(META_ACCOUNT_ID.to_string(), account_id.to_string());
        params.metadata = Some(meta);

        let customer = with_retry(&self.config, "create_customer", || {
            let client = client.clone();
            let params = params.clone();
            async move { stripe::Customer::create(&client, params).await }
        })
        .await?;

        Ok(customer.id.to_string())
    }

    async fn create_subscription(
        &self,
        customer_ref: &str,
        price_ref: &str,
        account_id: &str,
        trial_days: u32,
    ) -> Result<NewSubscription> {
        let client = self.idempotent_client("create_subscription");
        let customer_id = parse_customer_id(customer_ref)?;

        let mut params = stripe::CreateSubscription::new(customer_id);
        params.items = Some(vec![stripe::CreateSubscriptionItems {
            price: Some(price_ref.to_string()),
            ..Default::default()
        }]);
        params.trial_period_days = Some(trial_days);
        // DefaultIncomplete defers payment to the client, which confirms
        // with the secret we hand back.
        params.payment_behavior =
            Some(stripe::SubscriptionPaymentBehavior::DefaultIncomplete);
        let mut meta = std::collections::HashMap::new();
        meta.insert(META_ACCOUNT_ID.to_string(), account_id.to_string());
        params.metadata = Some(meta);
        params.expand = &["latest_invoice.payment_intent"];

        let subscription = with_retry(&self.config, "create_subscription", || {
            let client = client.clone();
            let params = params.clone();
            async move { stripe::Subscription::create(&client, params).await }
        })
        .await?;

        let client_secret = extract_client_secret(&subscription);
        Ok(NewSubscription {
            subscription: map_subscription(subscription),
            client_secret,
        })
    }

    async fn get_subscription(&self, subscription_ref: &str) -> Result<ProviderSubscription> {
        let sub_id = parse_subscription_id(subscription_ref)?;

        let subscription = with_retry(&self.config, "get_subscription", || {
            let client = self.client.clone();
            let sub_id = sub_id.clone();
            async move { stripe::Subscription::retrieve(&client, &sub_id, &[]).await }
        })
        .await?;

        Ok(map_subscription(subscription))
    }

    async fn list_subscriptions(&self, customer_ref: &str) -> Result<Vec<ProviderSubscription>> {
        let customer_id = parse_customer_id(customer_ref)?;

        let subscriptions = with_retry(&self.config, "list_subscriptions", || {
            let client = self.client.clone();
            let customer_id = customer_id.clone();
            async move {
                let mut params = stripe::ListSubscriptions::new();
                params.customer = Some(customer_id);
                stripe::Subscription::list(&client, &params).await
            }
        })
        .await?;

        Ok(subscriptions.data.into_iter().map(map_subscription).collect())
    }

    async fn cancel_at_period_end(&self, subscription_ref: &str) -> Result<ProviderSubscription> {
        let client = self.idempotent_client("cancel_at_period_end");
        let sub_id = parse_subscription_id(subscription_ref)?;

        let mut params = stripe::UpdateSubscription::new();
        params.cancel_at_period_end = Some(true);

        let subscription = with_retry(&self.config, "cancel_at_period_end", || {
            let client = client.clone();
            let sub_id = sub_id.clone();
            let params = params.clone();
            async move { stripe::Subscription::update(&client, &sub_id, params).await }
        })
        .await?;

        Ok(map_subscription(subscription))
    }
}
