//! The live cache manager.
//!
//! A [`CacheManager`] is an immutable deployment of one provider: the
//! settings it was built from, the optional redis connection, one
//! shared circuit breaker, and the named caches built on first use.
//! Settings changes never mutate a manager; the
//! [`DelegatingCacheManager`](crate::delegating::DelegatingCacheManager)
//! builds a replacement and swaps it in.

use crate::breaker::{BreakerMetrics, CircuitBreaker};
use crate::config::{CacheProvider, CacheSettings, CacheSpec};
use crate::disabled::DisabledTier;
use crate::keys::KeyGenerator;
use crate::local::MokaTier;
use crate::named::NamedCache;
use crate::redis::RedisTier;
use crate::stats::CacheStats;
use crate::tier::CacheTier;
use crate::two_level::TwoLevelTier;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// One built cache deployment.
pub struct CacheManager {
    settings: CacheSettings,
    redis: Option<ConnectionManager>,
    breaker: Arc<CircuitBreaker>,
    keys: KeyGenerator,
    caches: DashMap<String, Arc<NamedCache>>,
}

impl CacheManager {
    pub(crate) fn new(settings: CacheSettings, redis: Option<ConnectionManager>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(settings.breaker.clone()));
        let keys = KeyGenerator::new(settings.application.clone());
        CacheManager {
            settings,
            redis,
            breaker,
            keys,
            caches: DashMap::new(),
        }
    }

    pub fn provider(&self) -> CacheProvider {
        self.settings.provider
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn key_generator(&self) -> &KeyGenerator {
        &self.keys
    }

    /// The cache named `name`, built from `spec_for(name)` on first
    /// use. Concurrent first calls may both build; the map keeps one.
    pub fn cache(&self, name: &str) -> Arc<NamedCache> {
        if let Some(cache) = self.caches.get(name) {
            return Arc::clone(&cache);
        }
        let built = Arc::new(self.build_cache(name));
        let entry = self.caches.entry(name.to_string()).or_insert(built);
        Arc::clone(&entry)
    }

    /// Counter snapshots for every cache built so far.
    pub fn stats(&self) -> BTreeMap<String, CacheStats> {
        self.caches
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Snapshot of the shared redis circuit breaker.
    pub fn breaker_metrics(&self) -> BreakerMetrics {
        self.breaker.metrics()
    }

    fn build_cache(&self, name: &str) -> NamedCache {
        let spec = self.settings.spec_for(name);
        let provider = spec.provider_override.unwrap_or(self.settings.provider);
        let tier = self.build_tier(name, provider, &spec);
        NamedCache::new(name, spec, tier)
    }

    fn build_tier(
        &self,
        name: &str,
        provider: CacheProvider,
        spec: &CacheSpec,
    ) -> Arc<dyn CacheTier> {
        match provider {
            CacheProvider::Local => Arc::new(MokaTier::new(spec)),
            CacheProvider::Disabled => Arc::new(DisabledTier),
            CacheProvider::Distributed => {
                match self.redis_tier(name, spec, self.settings.fallback_to_local) {
                    Some(tier) => Arc::new(tier),
                    None => self.local_stand_in(name, spec),
                }
            }
            CacheProvider::TwoLevel => match self.redis_tier(name, spec, false) {
                Some(l2) => Arc::new(TwoLevelTier::new(MokaTier::new(spec), l2)),
                None => self.local_stand_in(name, spec),
            },
        }
    }

    fn redis_tier(&self, name: &str, spec: &CacheSpec, fallback: bool) -> Option<RedisTier> {
        let connection = self.redis.clone()?;
        Some(RedisTier::new(
            name,
            self.keys.cache_prefix(name),
            connection,
            Arc::clone(&self.breaker),
            spec,
            self.settings.redis.operation_timeout,
            fallback,
        ))
    }

    /// The factory connects redis whenever the settings call for it, so
    /// this only runs if a manager was built some other way.
    fn local_stand_in(&self, name: &str, spec: &CacheSpec) -> Arc<dyn CacheTier> {
        warn!(cache = %name, "no redis connection; serving this cache from a local tier");
        Arc::new(MokaTier::new(spec))
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("provider", &self.settings.provider)
            .field("application", &self.settings.application)
            .field("caches", &self.caches.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_manager(settings: CacheSettings) -> CacheManager {
        CacheManager::new(settings, None)
    }

    #[tokio::test]
    async fn test_cache_is_built_once_per_name() {
        let manager = local_manager(CacheSettings::default());
        let first = manager.cache("sessions");
        let second = manager.cache("sessions");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.stats().len(), 1);
    }

    #[tokio::test]
    async fn test_spec_overrides_apply_per_cache() {
        let settings = CacheSettings::default()
            .with_cache(
                "off",
                CacheSpec::new().with_provider_override(CacheProvider::Disabled),
            )
            .with_cache(
                "short",
                CacheSpec::new().with_ttl(Duration::from_secs(5)),
            );
        let manager = local_manager(settings);

        assert_eq!(manager.cache("off").tier_name(), "disabled");
        assert_eq!(manager.cache("short").tier_name(), "local");
        assert_eq!(manager.cache("short").spec().ttl, Duration::from_secs(5));
        assert_eq!(
            manager.cache("anything").spec().ttl,
            crate::config::DEFAULT_TTL
        );
    }

    #[tokio::test]
    async fn test_disabled_override_never_stores() {
        let settings = CacheSettings::default().with_cache(
            "off",
            CacheSpec::new().with_provider_override(CacheProvider::Disabled),
        );
        let manager = local_manager(settings);
        let cache = manager.cache("off");

        cache.put("k", &42u32).await.unwrap();
        let got: Option<u32> = cache.get("k").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_stats_aggregate_across_caches() {
        let manager = local_manager(CacheSettings::default());
        manager.cache("a").put("k", &1u32).await.unwrap();
        let _: Option<u32> = manager.cache("a").get("k").await.unwrap();
        let _: Option<u32> = manager.cache("b").get("missing").await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats["a"].hits, 1);
        assert_eq!(stats["b"].misses, 1);
    }

    #[tokio::test]
    async fn test_breaker_metrics_start_closed() {
        let manager = local_manager(CacheSettings::default());
        let metrics = manager.breaker_metrics();
        assert_eq!(metrics.recorded_calls, 0);
        assert_eq!(metrics.rejected_calls, 0);
    }
}
