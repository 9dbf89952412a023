//! Cache layer configuration.
//!
//! [`CacheSettings`] describes a whole cache deployment: which provider
//! backs it, how the redis tier is reached, the circuit breaker
//! thresholds, and per-cache overrides keyed by cache name. Settings are
//! plain data; building a live manager from them happens in
//! [`CacheFactory`](crate::factory::CacheFactory).

use keel_core::ConfigError;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Application namespace used as the leading key segment.
pub const DEFAULT_APPLICATION: &str = "keel";

/// Default redis endpoint.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Per-command timeout for redis calls.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for establishing the redis connection at build time.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time-to-live for cached values.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default entry bound for local tiers.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

// ============================================================================
// PROVIDER
// ============================================================================

/// Which tier arrangement backs the caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheProvider {
    /// In-process moka tier only.
    Local,
    /// Redis tier only.
    Distributed,
    /// Local L1 in front of a redis L2.
    TwoLevel,
    /// Always-miss no-op tier.
    Disabled,
}

impl CacheProvider {
    /// True when this provider requires a live redis connection.
    pub fn needs_redis(&self) -> bool {
        matches!(self, CacheProvider::Distributed | CacheProvider::TwoLevel)
    }
}

impl fmt::Display for CacheProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheProvider::Local => "local",
            CacheProvider::Distributed => "distributed",
            CacheProvider::TwoLevel => "two-level",
            CacheProvider::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

impl FromStr for CacheProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(CacheProvider::Local),
            "distributed" => Ok(CacheProvider::Distributed),
            "two-level" | "two_level" => Ok(CacheProvider::TwoLevel),
            "disabled" => Ok(CacheProvider::Disabled),
            other => Err(ConfigError::ProviderNotSupported {
                provider: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// PER-CACHE SPEC
// ============================================================================

/// Behavior of one named cache.
#[derive(Debug, Clone)]
pub struct CacheSpec {
    /// Time-to-live for entries in every tier.
    pub ttl: Duration,
    /// Entry bound for local tiers.
    pub max_entries: u64,
    /// Whether JSON `null` payloads are stored. Disabling this turns off
    /// negative caching for the cache.
    pub allow_null_values: bool,
    /// Pin this cache to a provider other than the manager's.
    pub provider_override: Option<CacheProvider>,
    /// Key schema version; bump to orphan all existing entries.
    pub version: u32,
    /// Gzip payloads before storing.
    pub compression: bool,
}

impl Default for CacheSpec {
    fn default() -> Self {
        CacheSpec {
            ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
            allow_null_values: true,
            provider_override: None,
            version: 1,
            compression: false,
        }
    }
}

impl CacheSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_allow_null_values(mut self, allow: bool) -> Self {
        self.allow_null_values = allow;
        self
    }

    pub fn with_provider_override(mut self, provider: CacheProvider) -> Self {
        self.provider_override = Some(provider);
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    fn validate(&self, cache: &str) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: format!("caches.{cache}.ttl"),
                value: "0s".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("caches.{cache}.max_entries"),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// REDIS SETTINGS
// ============================================================================

/// Connection settings for the redis tier.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    /// Endpoint URL, `redis://` or `rediss://`.
    pub url: String,
    /// Per-command timeout; an elapsed timeout counts as a breaker failure.
    pub operation_timeout: Duration,
    /// Timeout for the initial connection at build time.
    pub connect_timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        RedisSettings {
            url: DEFAULT_REDIS_URL.to_string(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// ============================================================================
// CIRCUIT BREAKER CONFIG
// ============================================================================

/// Thresholds for the redis circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// How many recent call outcomes the failure rate is computed over.
    pub sliding_window_size: u32,
    /// Outcomes required in the window before the breaker may trip.
    pub minimum_calls: u32,
    /// Failure percentage, in `(0, 100]`, at which the breaker opens.
    pub failure_rate_threshold: f64,
    /// How long an open breaker short-circuits before probing.
    pub wait_in_open: Duration,
    /// Probe calls admitted while half-open.
    pub half_open_permits: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            sliding_window_size: 100,
            minimum_calls: 10,
            failure_rate_threshold: 50.0,
            wait_in_open: Duration::from_secs(30),
            half_open_permits: 3,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.minimum_calls == 0 {
            return Err(ConfigError::InvalidValue {
                field: "breaker.minimum_calls".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sliding_window_size < self.minimum_calls {
            return Err(ConfigError::InvalidValue {
                field: "breaker.sliding_window_size".to_string(),
                value: self.sliding_window_size.to_string(),
                reason: format!("must be at least minimum_calls ({})", self.minimum_calls),
            });
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(ConfigError::InvalidValue {
                field: "breaker.failure_rate_threshold".to_string(),
                value: self.failure_rate_threshold.to_string(),
                reason: "must be within (0, 100]".to_string(),
            });
        }
        if self.wait_in_open.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "breaker.wait_in_open".to_string(),
                value: "0s".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.half_open_permits == 0 {
            return Err(ConfigError::InvalidValue {
                field: "breaker.half_open_permits".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// SETTINGS
// ============================================================================

/// Full configuration for a cache deployment.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Application namespace; the leading segment of every key.
    pub application: String,
    /// Default provider for caches without an override.
    pub provider: CacheProvider,
    /// Serve redis-tier reads from a private local tier while redis is
    /// unreachable or the breaker is open.
    pub fallback_to_local: bool,
    /// Redis connection settings.
    pub redis: RedisSettings,
    /// Circuit breaker thresholds for the redis tier.
    pub breaker: BreakerConfig,
    /// Spec applied to caches without an entry in `caches`.
    pub default_spec: CacheSpec,
    /// Per-cache overrides, keyed by cache name.
    pub caches: BTreeMap<String, CacheSpec>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            application: DEFAULT_APPLICATION.to_string(),
            provider: CacheProvider::Local,
            fallback_to_local: true,
            redis: RedisSettings::default(),
            breaker: BreakerConfig::default(),
            default_spec: CacheSpec::default(),
            caches: BTreeMap::new(),
        }
    }
}

impl CacheSettings {
    pub fn new(provider: CacheProvider) -> Self {
        CacheSettings {
            provider,
            ..Default::default()
        }
    }

    /// Read settings from `KEEL_CACHE_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut settings = CacheSettings::default();
        if let Ok(application) = env::var("KEEL_CACHE_APPLICATION") {
            if !application.is_empty() {
                settings.application = application;
            }
        }
        if let Ok(provider) = env::var("KEEL_CACHE_PROVIDER") {
            if let Ok(provider) = provider.parse() {
                settings.provider = provider;
            }
        }
        if let Ok(url) = env::var("KEEL_CACHE_REDIS_URL") {
            if !url.is_empty() {
                settings.redis.url = url;
            }
        }
        if let Ok(fallback) = env::var("KEEL_CACHE_FALLBACK_TO_LOCAL") {
            if let Ok(fallback) = fallback.parse() {
                settings.fallback_to_local = fallback;
            }
        }
        if let Ok(secs) = env::var("KEEL_CACHE_TTL_SECS") {
            if let Ok(secs) = secs.parse() {
                settings.default_spec.ttl = Duration::from_secs(secs);
            }
        }
        settings
    }

    /// The spec a cache named `name` is built from.
    pub fn spec_for(&self, name: &str) -> CacheSpec {
        self.caches
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_spec.clone())
    }

    /// True when any cache built from these settings reaches redis.
    pub fn needs_redis(&self) -> bool {
        self.provider.needs_redis()
            || self
                .caches
                .values()
                .any(|spec| spec.provider_override.is_some_and(|p| p.needs_redis()))
    }

    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = application.into();
        self
    }

    pub fn with_provider(mut self, provider: CacheProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_fallback_to_local(mut self, fallback: bool) -> Self {
        self.fallback_to_local = fallback;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis.url = url.into();
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_default_spec(mut self, spec: CacheSpec) -> Self {
        self.default_spec = spec;
        self
    }

    pub fn with_cache(mut self, name: impl Into<String>, spec: CacheSpec) -> Self {
        self.caches.insert(name.into(), spec);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "application".to_string(),
            });
        }
        if self.application.contains("::") {
            return Err(ConfigError::InvalidValue {
                field: "application".to_string(),
                value: self.application.clone(),
                reason: "must not contain the `::` key delimiter".to_string(),
            });
        }
        self.default_spec.validate("default")?;
        for (name, spec) in &self.caches {
            spec.validate(name)?;
        }
        self.breaker.validate()?;
        if self.needs_redis() {
            if self.redis.url.is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "redis.url".to_string(),
                });
            }
            if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
                return Err(ConfigError::InvalidValue {
                    field: "redis.url".to_string(),
                    value: self.redis.url.clone(),
                    reason: "must start with redis:// or rediss://".to_string(),
                });
            }
            if self.redis.operation_timeout.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "redis.operation_timeout".to_string(),
                    value: "0s".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
            if self.redis.connect_timeout.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "redis.connect_timeout".to_string(),
                    value: "0s".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse_and_display() {
        for (text, provider) in [
            ("local", CacheProvider::Local),
            ("distributed", CacheProvider::Distributed),
            ("two-level", CacheProvider::TwoLevel),
            ("two_level", CacheProvider::TwoLevel),
            ("Disabled", CacheProvider::Disabled),
            ("  LOCAL ", CacheProvider::Local),
        ] {
            assert_eq!(text.parse::<CacheProvider>().ok(), Some(provider), "{text}");
        }
        assert_eq!(CacheProvider::TwoLevel.to_string(), "two-level");
        assert!(matches!(
            "memcached".parse::<CacheProvider>(),
            Err(ConfigError::ProviderNotSupported { .. })
        ));
    }

    #[test]
    fn test_defaults_validate() {
        let settings = CacheSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.application, DEFAULT_APPLICATION);
        assert_eq!(settings.provider, CacheProvider::Local);
        assert!(settings.fallback_to_local);
        assert_eq!(settings.default_spec.ttl, DEFAULT_TTL);
        assert_eq!(settings.default_spec.version, 1);
        assert!(settings.default_spec.allow_null_values);
        assert!(!settings.default_spec.compression);
    }

    #[test]
    fn test_spec_for_prefers_named_override() {
        let settings = CacheSettings::default().with_cache(
            "sessions",
            CacheSpec::new()
                .with_ttl(Duration::from_secs(30))
                .with_version(4),
        );
        assert_eq!(settings.spec_for("sessions").ttl, Duration::from_secs(30));
        assert_eq!(settings.spec_for("sessions").version, 4);
        assert_eq!(settings.spec_for("anything-else").ttl, DEFAULT_TTL);
    }

    #[test]
    fn test_needs_redis_considers_overrides() {
        let local = CacheSettings::default();
        assert!(!local.needs_redis());

        let distributed = CacheSettings::new(CacheProvider::Distributed);
        assert!(distributed.needs_redis());

        let pinned = CacheSettings::default().with_cache(
            "hot",
            CacheSpec::new().with_provider_override(CacheProvider::TwoLevel),
        );
        assert!(pinned.needs_redis());
    }

    #[test]
    fn test_validate_rejects_bad_redis_url() {
        let settings =
            CacheSettings::new(CacheProvider::Distributed).with_redis_url("localhost:6379");
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "redis.url"
        ));

        // A local-only deployment never touches redis, so the URL is not
        // validated there.
        let local = CacheSettings::default().with_redis_url("localhost:6379");
        assert!(local.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_application() {
        assert!(CacheSettings::default()
            .with_application("")
            .validate()
            .is_err());
        assert!(CacheSettings::default()
            .with_application("a::b")
            .validate()
            .is_err());
    }

    #[test]
    fn test_breaker_validation() {
        assert!(BreakerConfig::default().validate().is_ok());

        let mut breaker = BreakerConfig::default();
        breaker.minimum_calls = 0;
        assert!(breaker.validate().is_err());

        let mut breaker = BreakerConfig::default();
        breaker.sliding_window_size = 5;
        breaker.minimum_calls = 10;
        assert!(breaker.validate().is_err());

        let mut breaker = BreakerConfig::default();
        breaker.failure_rate_threshold = 0.0;
        assert!(breaker.validate().is_err());
        breaker.failure_rate_threshold = 100.5;
        assert!(breaker.validate().is_err());
        breaker.failure_rate_threshold = 100.0;
        assert!(breaker.validate().is_ok());

        let mut breaker = BreakerConfig::default();
        breaker.half_open_permits = 0;
        assert!(breaker.validate().is_err());
    }

    #[test]
    fn test_spec_validation_through_settings() {
        let settings = CacheSettings::default()
            .with_cache("broken", CacheSpec::new().with_ttl(Duration::ZERO));
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "caches.broken.ttl"
        ));
    }
}
