use secrecy::SecretString;
use serde::Deserialize;

/// Main configuration for the entitlement subsystem.
///
/// Secrets are held as [`SecretString`] so they never appear in `Debug`
/// output or serialized logs.
#[derive(Debug, Clone, Deserialize)]
pub struct SubgateConfig {
    /// Shared secret used to verify webhook signatures.
    #[serde(skip)]
    pub webhook_secret: Option<SecretString>,
    /// Provider price reference used when creating subscriptions.
    #[serde(default)]
    pub price_ref: Option<String>,
    /// Trial length granted on new subscriptions, in days.
    #[serde(default = "default_trial_days")]
    pub trial_days: u32,
    /// Free-access window granted by promo redemption, in days.
    #[serde(default = "default_promo_window_days")]
    pub promo_window_days: u32,
    /// How long processed webhook event ids are retained, in days.
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: u32,
    /// Per-call timeout for provider API requests, in seconds.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// Retry attempts for transient provider failures.
    #[serde(default = "default_provider_max_retries")]
    pub provider_max_retries: u32,
    /// Maximum age of a webhook timestamp before it is rejected as a replay.
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,
    /// Name of the session cookie checked by the access gate.
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
    /// When true, error responses include internal detail.
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for SubgateConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            price_ref: None,
            trial_days: default_trial_days(),
            promo_window_days: default_promo_window_days(),
            event_retention_days: default_event_retention_days(),
            provider_timeout_secs: default_provider_timeout_secs(),
            provider_max_retries: default_provider_max_retries(),
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            session_cookie: default_session_cookie(),
            dev_mode: false,
        }
    }
}

fn default_trial_days() -> u32 {
    15
}

fn default_promo_window_days() -> u32 {
    180
}

fn default_event_retention_days() -> u32 {
    30
}

fn default_provider_timeout_secs() -> u64 {
    10
}

fn default_provider_max_retries() -> u32 {
    3
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_session_cookie() -> String {
    "session_token".to_string()
}

/// Builder for [`SubgateConfig`] with environment variable support.
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: SubgateConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SubgateConfig::default(),
        }
    }

    /// Load overrides from `SUBGATE_`-prefixed environment variables.
    pub fn from_env(mut self) -> Self {
        if let Ok(secret) = std::env::var("SUBGATE_WEBHOOK_SECRET") {
            self.config.webhook_secret = Some(secret.into());
        }
        if let Ok(price) = std::env::var("SUBGATE_PRICE_REF") {
            self.config.price_ref = Some(price);
        }
        if let Ok(days) = std::env::var("SUBGATE_TRIAL_DAYS") {
            if let Ok(days) = days.parse() {
                self.config.trial_days = days;
            }
        }
        if let Ok(dev) = std::env::var("SUBGATE_DEV_MODE") {
            self.config.dev_mode = dev.parse().unwrap_or(false);
        }
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<SecretString>) -> Self {
        self.config.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_price_ref(mut self, price_ref: impl Into<String>) -> Self {
        self.config.price_ref = Some(price_ref.into());
        self
    }

    pub fn with_trial_days(mut self, days: u32) -> Self {
        self.config.trial_days = days;
        self
    }

    pub fn with_promo_window_days(mut self, days: u32) -> Self {
        self.config.promo_window_days = days;
        self
    }

    pub fn with_event_retention_days(mut self, days: u32) -> Self {
        self.config.event_retention_days = days;
        self
    }

    pub fn with_provider_timeout_secs(mut self, secs: u64) -> Self {
        self.config.provider_timeout_secs = secs;
        self
    }

    pub fn with_provider_max_retries(mut self, retries: u32) -> Self {
        self.config.provider_max_retries = retries;
        self
    }

    pub fn with_webhook_tolerance_secs(mut self, secs: u64) -> Self {
        self.config.webhook_tolerance_secs = secs;
        self
    }

    pub fn with_session_cookie(mut self, name: impl Into<String>) -> Self {
        self.config.session_cookie = name.into();
        self
    }

    pub fn with_dev_mode(mut self, enabled: bool) -> Self {
        self.config.dev_mode = enabled;
        self
    }

    pub fn build(self) -> SubgateConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
