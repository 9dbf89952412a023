//! Atomic provider switching.
//!
//! [`DelegatingCacheManager`] holds the active [`CacheManager`] behind
//! a single `RwLock`'d `Arc` slot. Callers snapshot the `Arc` once per
//! operation, so a switch is observed atomically: in-flight work keeps
//! the manager it started with, new work sees the replacement. There is
//! no name-keyed registry of managers; one slot, swapped whole.

use crate::config::{CacheProvider, CacheSettings};
use crate::factory::CacheFactory;
use crate::manager::CacheManager;
use crate::named::NamedCache;
use keel_core::KeelResult;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Swappable front for the active cache manager.
pub struct DelegatingCacheManager {
    active: RwLock<Arc<CacheManager>>,
    /// Settings the active manager was built from.
    settings: Mutex<CacheSettings>,
    /// Staged settings awaiting the next switch or rebuild.
    pending: Mutex<Option<CacheSettings>>,
    /// Serializes switch/rebuild; reads never touch it.
    admin: tokio::sync::Mutex<()>,
}

impl DelegatingCacheManager {
    /// Build the initial manager from `settings` and wrap it.
    pub async fn new(settings: CacheSettings) -> KeelResult<Self> {
        let factory = CacheFactory::new(settings.clone())?;
        let manager = factory.build(settings.provider).await?;
        Ok(DelegatingCacheManager {
            active: RwLock::new(Arc::new(manager)),
            settings: Mutex::new(settings),
            pending: Mutex::new(None),
            admin: tokio::sync::Mutex::new(()),
        })
    }

    /// Snapshot of the active manager.
    pub fn manager(&self) -> Arc<CacheManager> {
        Arc::clone(&self.active.read())
    }

    /// Convenience for `manager().cache(name)`.
    pub fn cache(&self, name: &str) -> Arc<NamedCache> {
        self.manager().cache(name)
    }

    pub fn provider(&self) -> CacheProvider {
        self.manager().provider()
    }

    /// Application namespace of the active settings.
    pub fn application(&self) -> String {
        self.settings.lock().application.clone()
    }

    /// Stage new settings. The active manager is never mutated; staged
    /// settings take effect at the next [`switch_to`] or [`rebuild`].
    ///
    /// [`switch_to`]: DelegatingCacheManager::switch_to
    /// [`rebuild`]: DelegatingCacheManager::rebuild
    pub fn update_settings(&self, settings: CacheSettings) {
        *self.pending.lock() = Some(settings);
    }

    /// Switch the deployment to `provider`, applying any staged
    /// settings. The replacement manager is fully built first; on
    /// failure the active manager is untouched and the staged settings
    /// stay staged. Returns the previous provider.
    pub async fn switch_to(&self, provider: CacheProvider) -> KeelResult<CacheProvider> {
        let _admin = self.admin.lock().await;
        self.swap(provider).await
    }

    /// Rebuild the current provider, applying any staged settings.
    pub async fn rebuild(&self) -> KeelResult<()> {
        let _admin = self.admin.lock().await;
        let provider = self.active.read().provider();
        self.swap(provider).await.map(|_| ())
    }

    async fn swap(&self, provider: CacheProvider) -> KeelResult<CacheProvider> {
        let candidate = self
            .pending
            .lock()
            .clone()
            .unwrap_or_else(|| self.settings.lock().clone());
        let factory = CacheFactory::new(candidate.clone())?;
        let replacement = Arc::new(factory.build(provider).await?);

        let previous = std::mem::replace(&mut *self.active.write(), replacement);
        *self.settings.lock() = candidate.with_provider(provider);
        *self.pending.lock() = None;
        info!(from = %previous.provider(), to = %provider, "cache provider switched");
        Ok(previous.provider())
    }
}

impl fmt::Debug for DelegatingCacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatingCacheManager")
            .field("active", &*self.manager())
            .field("pending", &self.pending.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSpec;
    use std::time::Duration;

    #[tokio::test]
    async fn test_switch_swaps_the_slot_and_reports_previous() {
        let delegating = DelegatingCacheManager::new(CacheSettings::default())
            .await
            .unwrap();
        assert_eq!(delegating.provider(), CacheProvider::Local);

        let previous = delegating.switch_to(CacheProvider::Disabled).await.unwrap();
        assert_eq!(previous, CacheProvider::Local);
        assert_eq!(delegating.provider(), CacheProvider::Disabled);
        assert_eq!(delegating.cache("sessions").tier_name(), "disabled");
    }

    #[tokio::test]
    async fn test_snapshots_survive_a_switch() {
        let delegating = DelegatingCacheManager::new(CacheSettings::default())
            .await
            .unwrap();
        let before = delegating.manager();
        let cache = before.cache("sessions");
        cache.put("k", &7u32).await.unwrap();

        delegating.switch_to(CacheProvider::Disabled).await.unwrap();

        // The held snapshot still serves from the old local tier.
        let got: Option<u32> = cache.get("k").await.unwrap();
        assert_eq!(got, Some(7));
        // New callers get the fresh deployment.
        let got: Option<u32> = delegating.cache("sessions").get("k").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_failed_switch_leaves_active_untouched() {
        let delegating = DelegatingCacheManager::new(CacheSettings::default())
            .await
            .unwrap();
        delegating.cache("sessions").put("k", &7u32).await.unwrap();

        let mut dead = CacheSettings::default().with_redis_url("redis://127.0.0.1:59076");
        dead.redis.connect_timeout = Duration::from_millis(500);
        delegating.update_settings(dead);

        let result = delegating.switch_to(CacheProvider::Distributed).await;
        assert!(result.is_err());

        // Old manager still active, and the staged settings still
        // staged for a corrected retry.
        assert_eq!(delegating.provider(), CacheProvider::Local);
        let got: Option<u32> = delegating.cache("sessions").get("k").await.unwrap();
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn test_staged_settings_apply_only_at_rebuild() {
        let delegating = DelegatingCacheManager::new(CacheSettings::default())
            .await
            .unwrap();
        assert_eq!(
            delegating.cache("sessions").spec().ttl,
            crate::config::DEFAULT_TTL
        );

        let staged = CacheSettings::default()
            .with_cache("sessions", CacheSpec::new().with_ttl(Duration::from_secs(5)));
        delegating.update_settings(staged);

        // Nothing changes until an explicit rebuild.
        assert_eq!(
            delegating.cache("sessions").spec().ttl,
            crate::config::DEFAULT_TTL
        );

        delegating.rebuild().await.unwrap();
        assert_eq!(
            delegating.cache("sessions").spec().ttl,
            Duration::from_secs(5)
        );
        assert_eq!(delegating.provider(), CacheProvider::Local);
    }
}
