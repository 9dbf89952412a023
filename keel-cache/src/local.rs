//! In-process tier backed by moka.

use crate::config::CacheSpec;
use crate::tier::CacheTier;
use async_trait::async_trait;
use keel_core::CacheError;
use moka::future::Cache;
use std::sync::Arc;

/// Bounded in-process tier with per-entry TTL.
///
/// Values are held as `Arc<Vec<u8>>` so a hit hands back a cheap clone
/// of the pointer, not a copy of the payload held by the cache.
#[derive(Clone)]
pub struct MokaTier {
    cache: Cache<String, Arc<Vec<u8>>>,
}

impl MokaTier {
    pub fn new(spec: &CacheSpec) -> Self {
        MokaTier {
            cache: Cache::builder()
                .max_capacity(spec.max_entries)
                .time_to_live(spec.ttl)
                .build(),
        }
    }

    /// Entries currently resident. Approximate while evictions are
    /// pending.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheTier for MokaTier {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.cache.get(key).await.map(|value| (*value).clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.cache.insert(key.to_string(), Arc::new(value)).await;
        Ok(())
    }

    async fn evict(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.cache.invalidate_all();
        Ok(())
    }
}
