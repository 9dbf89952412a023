//! Storage tier abstraction.
//!
//! A tier stores opaque bytes under string keys. Serialization,
//! compression, and corruption recovery live a level up in
//! [`NamedCache`](crate::named::NamedCache); a tier only moves bytes.

use async_trait::async_trait;
use keel_core::CacheError;

/// One storage tier behind a named cache.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Short tier name for logs.
    fn name(&self) -> &'static str;

    /// Fetch the payload at `key`, `None` on miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value` at `key` under the tier's TTL.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;

    /// Drop the entry at `key`, if any.
    async fn evict(&self, key: &str) -> Result<(), CacheError>;

    /// Drop every entry belonging to this cache. Tiers shared with
    /// other caches scope this to their own keyspace.
    async fn clear(&self) -> Result<(), CacheError>;
}
