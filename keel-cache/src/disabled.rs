//! Always-miss tier for deployments that run without caching.

use crate::tier::CacheTier;
use async_trait::async_trait;
use keel_core::CacheError;

/// Tier that stores nothing and never fails. Every read is a miss, so
/// callers exercise their loaders exactly as if the cache were absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledTier;

#[async_trait]
impl CacheTier for DisabledTier {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<(), CacheError> {
        Ok(())
    }

    async fn evict(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
