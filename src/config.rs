//! Provider configuration.

use std::time::Duration;

use url::Url;

use crate::store::DEFAULT_STORAGE_KEY;

/// Default margin before expiry at which a credential counts as stale.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(300);

/// Configuration for the authentication-state provider.
/// All fields have sensible defaults that can be overridden via environment
/// variables or code.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Key under which the credential is persisted.
    pub storage_key: String,
    /// Margin before expiry at which a background refresh is triggered.
    pub refresh_skew: Duration,
    /// Base address of the sign-in endpoint, if one is configured.
    pub endpoint_url: Option<Url>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            refresh_skew: DEFAULT_REFRESH_SKEW,
            endpoint_url: None,
        }
    }
}

impl ProviderConfig {
    /// Create configuration with defaults, then apply environment variable
    /// overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(key) = std::env::var("AUTH_STATE_STORAGE_KEY") {
            config.storage_key = key;
        }
        if let Ok(secs) = std::env::var("AUTH_STATE_REFRESH_SKEW_SECS")
            && let Ok(secs) = secs.parse()
        {
            config.refresh_skew = Duration::from_secs(secs);
        }
        if let Ok(url) = std::env::var("AUTH_STATE_ENDPOINT_URL")
            && let Ok(url) = Url::parse(&url)
        {
            config.endpoint_url = Some(url);
        }

        config
    }

    /// Create a builder for custom configuration.
    pub fn builder() -> ProviderConfigBuilder {
        ProviderConfigBuilder::default()
    }
}

/// Builder for [`ProviderConfig`].
pub struct ProviderConfigBuilder {
    config: ProviderConfig,
}

impl Default for ProviderConfigBuilder {
    fn default() -> Self {
        Self {
            config: ProviderConfig::from_env(),
        }
    }
}

impl ProviderConfigBuilder {
    /// Set the storage key.
    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.config.storage_key = key.into();
        self
    }

    /// Set the refresh skew.
    pub fn refresh_skew(mut self, skew: Duration) -> Self {
        self.config.refresh_skew = skew;
        self
    }

    /// Set the sign-in endpoint base address.
    pub fn endpoint_url(mut self, url: Url) -> Self {
        self.config.endpoint_url = Some(url);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProviderConfig {
        self.config
    }
}
