//! etcd adapter configuration.

use keel_core::ConfigError;
use std::env;
use std::time::Duration;

/// Default cluster endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";

/// Dial timeout for establishing the channel.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline applied to unary calls. Watch streams are exempt.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for an etcd cluster member.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// gRPC endpoint, scheme included.
    pub endpoint: String,
    /// Timeout for dialing the endpoint.
    pub connect_timeout: Duration,
    /// Per-call deadline for unary requests.
    pub request_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        EtcdConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl EtcdConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        EtcdConfig {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Read configuration from `KEEL_ETCD_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = EtcdConfig::default();
        if let Ok(endpoint) = env::var("KEEL_ETCD_ENDPOINT") {
            if !endpoint.is_empty() {
                config.endpoint = endpoint;
            }
        }
        if let Ok(secs) = env::var("KEEL_ETCD_CONNECT_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                config.connect_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(secs) = env::var("KEEL_ETCD_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                config.request_timeout = Duration::from_secs(secs);
            }
        }
        config
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "endpoint".to_string(),
            });
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "endpoint".to_string(),
                value: self.endpoint.clone(),
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "connect_timeout".to_string(),
                value: "0s".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout".to_string(),
                value: "0s".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
