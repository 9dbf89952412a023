//! Consul adapter configuration.

use keel_core::ConfigError;
use secrecy::SecretString;
use std::env;
use std::fmt;
use std::time::Duration;

/// Default agent address.
pub const DEFAULT_ADDRESS: &str = "http://127.0.0.1:8500";

/// Request timeout for plain (non-blocking) calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a blocking query waits for a change before returning.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(55);

/// Connection settings for a Consul agent.
#[derive(Clone)]
pub struct ConsulConfig {
    /// Agent base URL, scheme included.
    pub address: String,
    /// ACL token sent as `X-Consul-Token`.
    pub token: Option<SecretString>,
    /// Datacenter override (`dc` query parameter).
    pub datacenter: Option<String>,
    /// Timeout for non-blocking requests.
    pub timeout: Duration,
    /// Blocking query wait duration for watches.
    pub wait: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        ConsulConfig {
            address: DEFAULT_ADDRESS.to_string(),
            token: None,
            datacenter: None,
            timeout: DEFAULT_TIMEOUT,
            wait: DEFAULT_WAIT,
        }
    }
}

impl ConsulConfig {
    pub fn new(address: impl Into<String>) -> Self {
        ConsulConfig {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Read configuration from `KEEL_CONSUL_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = ConsulConfig::default();
        if let Ok(address) = env::var("KEEL_CONSUL_ADDR") {
            config.address = address;
        }
        if let Ok(token) = env::var("KEEL_CONSUL_TOKEN") {
            if !token.is_empty() {
                config.token = Some(SecretString::from(token));
            }
        }
        if let Ok(dc) = env::var("KEEL_CONSUL_DATACENTER") {
            if !dc.is_empty() {
                config.datacenter = Some(dc);
            }
        }
        if let Ok(secs) = env::var("KEEL_CONSUL_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                config.timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(secs) = env::var("KEEL_CONSUL_WAIT_SECS") {
            if let Ok(secs) = secs.parse() {
                config.wait = Duration::from_secs(secs);
            }
        }
        config
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(SecretString::from(token.into()));
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "address".to_string(),
            });
        }
        if !self.address.starts_with("http://") && !self.address.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "address".to_string(),
                value: self.address.clone(),
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "timeout".to_string(),
                value: "0s".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.wait.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "wait".to_string(),
                value: "0s".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ConsulConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsulConfig")
            .field("address", &self.address)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("datacenter", &self.datacenter)
            .field("timeout", &self.timeout)
            .field("wait", &self.wait)
            .finish()
    }
}
