//! Local L1 in front of a redis L2.

use crate::local::MokaTier;
use crate::redis::RedisTier;
use crate::tier::CacheTier;
use async_trait::async_trait;
use keel_core::CacheError;
use tracing::debug;

/// Two-level tier: an in-process moka L1 over a redis L2.
///
/// Reads check L1 first and populate it from L2 hits. The L2 runs under
/// the shared circuit breaker but without its own fallback tier; when
/// redis is out, the L1 already is the fallback, and reads simply
/// degrade to L1-only.
#[derive(Clone)]
pub struct TwoLevelTier {
    l1: MokaTier,
    l2: RedisTier,
}

impl TwoLevelTier {
    pub fn new(l1: MokaTier, l2: RedisTier) -> Self {
        TwoLevelTier { l1, l2 }
    }
}

#[async_trait]
impl CacheTier for TwoLevelTier {
    fn name(&self) -> &'static str {
        "two-level"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(value) = self.l1.get(key).await? {
            return Ok(Some(value));
        }
        match self.l2.get(key).await {
            Ok(Some(value)) => {
                self.l1.put(key, value.clone()).await?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                debug!(error = %err, "L2 read failed; degrading to L1 only");
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.l1.put(key, value.clone()).await?;
        self.l2.put(key, value).await
    }

    async fn evict(&self, key: &str) -> Result<(), CacheError> {
        self.l1.evict(key).await?;
        self.l2.evict(key).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.l1.clear().await?;
        self.l2.clear().await
    }
}
