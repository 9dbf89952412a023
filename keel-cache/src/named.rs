//! Typed cache over an opaque tier.
//!
//! [`NamedCache`] turns the byte-level [`CacheTier`] into a typed API:
//! values are serde-JSON encoded, optionally gzip-compressed, and
//! corrupt payloads are recovered on read rather than surfaced. A
//! payload that fails to decode, for whatever reason, is logged,
//! evicted, counted, and reported as a miss, so a bad deploy or a
//! schema change can never wedge readers on poisoned entries.

use crate::config::CacheSpec;
use crate::stats::{CacheStats, CacheStatsRecorder};
use crate::tier::CacheTier;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use keel_core::{CacheError, KeelResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One named, typed cache.
pub struct NamedCache {
    name: String,
    spec: CacheSpec,
    tier: Arc<dyn CacheTier>,
    stats: Arc<CacheStatsRecorder>,
}

impl NamedCache {
    pub fn new(name: impl Into<String>, spec: CacheSpec, tier: Arc<dyn CacheTier>) -> Self {
        NamedCache {
            name: name.into(),
            spec,
            tier,
            stats: Arc::new(CacheStatsRecorder::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &CacheSpec {
        &self.spec
    }

    /// Name of the tier arrangement serving this cache.
    pub fn tier_name(&self) -> &'static str {
        self.tier.name()
    }

    /// Snapshot of this cache's counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Typed read. Misses and undecodable payloads return `Ok(None)`;
    /// only tier errors surface.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let bytes = match self.tier.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.stats.record_miss();
                return Ok(None);
            }
            Err(err) => {
                self.stats.record_error();
                return Err(err);
            }
        };
        match self.decode(&bytes) {
            Ok(value) => {
                self.stats.record_hit();
                Ok(Some(value))
            }
            Err(err) => {
                warn!(
                    cache = %self.name,
                    key,
                    error = %err,
                    "evicting undecodable cache payload"
                );
                if let Err(evict_err) = self.tier.evict(key).await {
                    debug!(cache = %self.name, key, error = %evict_err, "eviction of corrupt payload failed");
                }
                self.stats.record_corruption_eviction();
                Ok(None)
            }
        }
    }

    /// Read through the cache: a hit returns the cached value, anything
    /// else runs `load` and stores its result best-effort. Tier errors
    /// are absorbed here so the loader always gets its chance.
    ///
    /// There is no single-flight guarantee: concurrent callers missing
    /// on the same key race duplicate loads, so loaders must be
    /// idempotent.
    pub async fn get_with<T, F, Fut>(&self, key: &str, load: F) -> KeelResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = KeelResult<T>>,
    {
        match self.get::<T>(key).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) => {
                debug!(cache = %self.name, key, error = %err, "cache read failed; falling through to loader");
            }
        }
        self.stats.record_load();
        let value = load().await?;
        if let Err(err) = self.put(key, &value).await {
            debug!(cache = %self.name, key, error = %err, "failed to store loaded value");
        }
        Ok(value)
    }

    /// Typed write. With `allow_null_values` off, a value that encodes
    /// to JSON `null` is skipped instead of stored.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let Some(payload) = self.encode(value)? else {
            debug!(cache = %self.name, key, "skipping null payload");
            return Ok(());
        };
        self.tier.put(key, payload).await
    }

    pub async fn evict(&self, key: &str) -> Result<(), CacheError> {
        self.tier.evict(key).await?;
        self.stats.record_eviction();
        Ok(())
    }

    /// Drop everything in this cache's keyspace.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.tier.clear().await
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Option<Vec<u8>>, CacheError> {
        let json = serde_json::to_vec(value).map_err(|err| CacheError::Serialization {
            reason: err.to_string(),
        })?;
        if !self.spec.allow_null_values && json == b"null" {
            return Ok(None);
        }
        if !self.spec.compression {
            return Ok(Some(json));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .and_then(|()| encoder.finish())
            .map(Some)
            .map_err(|err| CacheError::Serialization {
                reason: format!("gzip encode failed: {err}"),
            })
    }

    /// Decode sniffs the gzip magic instead of trusting the spec, so
    /// payloads written under a different compression setting still
    /// decode.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError> {
        if bytes.starts_with(&GZIP_MAGIC) {
            let mut json = Vec::new();
            GzDecoder::new(bytes).read_to_end(&mut json).map_err(|err| {
                CacheError::Deserialization {
                    reason: format!("gzip decode failed: {err}"),
                }
            })?;
            return serde_json::from_slice(&json).map_err(|err| CacheError::Deserialization {
                reason: err.to_string(),
            });
        }
        serde_json::from_slice(bytes).map_err(|err| CacheError::Deserialization {
            reason: err.to_string(),
        })
    }
}

impl std::fmt::Debug for NamedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedCache")
            .field("name", &self.name)
            .field("tier", &self.tier.name())
            .field("spec", &self.spec)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MokaTier;
    use async_trait::async_trait;
    use keel_core::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Endpoint {
        host: String,
        port: u16,
    }

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "db.internal".to_string(),
            port: 5432,
        }
    }

    fn spec() -> CacheSpec {
        CacheSpec::new()
            .with_ttl(Duration::from_secs(60))
            .with_max_entries(100)
    }

    fn cache_over_moka(spec: CacheSpec) -> (NamedCache, Arc<dyn CacheTier>) {
        let tier: Arc<dyn CacheTier> = Arc::new(MokaTier::new(&spec));
        (NamedCache::new("endpoints", spec, tier.clone()), tier)
    }

    /// Tier whose every operation fails, as a dead redis would.
    struct FailingTier;

    #[async_trait]
    impl CacheTier for FailingTier {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::unavailable("tier down"))
        }

        async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<(), CacheError> {
            Err(CacheError::unavailable("tier down"))
        }

        async fn evict(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::unavailable("tier down"))
        }

        async fn clear(&self) -> Result<(), CacheError> {
            Err(CacheError::unavailable("tier down"))
        }
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let (cache, _) = cache_over_moka(spec());
        cache.put("k", &endpoint()).await.unwrap();

        let got: Option<Endpoint> = cache.get("k").await.unwrap();
        assert_eq!(got, Some(endpoint()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn test_corrupt_payload_evicted_exactly_once() {
        let (cache, tier) = cache_over_moka(spec());
        tier.put("k", b"{definitely not json".to_vec())
            .await
            .unwrap();

        // First read detects the corruption, evicts, and reports a miss.
        let got: Option<Endpoint> = cache.get("k").await.unwrap();
        assert_eq!(got, None);
        assert_eq!(cache.stats().corruption_evictions, 1);

        // The key is gone, so the second read is a plain miss.
        let again: Option<Endpoint> = cache.get("k").await.unwrap();
        assert_eq!(again, None);
        let stats = cache.stats();
        assert_eq!(stats.corruption_evictions, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_recovered_like_corruption() {
        let (cache, _) = cache_over_moka(spec());
        cache.put("k", &"just a string".to_string()).await.unwrap();

        let got: Option<Endpoint> = cache.get("k").await.unwrap();
        assert_eq!(got, None);
        assert_eq!(cache.stats().corruption_evictions, 1);
    }

    #[tokio::test]
    async fn test_compression_round_trip_and_magic_sniffing() {
        let (cache, tier) = cache_over_moka(spec().with_compression(true));
        cache.put("k", &endpoint()).await.unwrap();

        let raw = tier.get("k").await.unwrap().unwrap();
        assert!(raw.starts_with(&GZIP_MAGIC));

        let got: Option<Endpoint> = cache.get("k").await.unwrap();
        assert_eq!(got, Some(endpoint()));

        // A plain payload written before compression was enabled still
        // decodes.
        let plain = serde_json::to_vec(&endpoint()).unwrap();
        tier.put("old", plain).await.unwrap();
        let got: Option<Endpoint> = cache.get("old").await.unwrap();
        assert_eq!(got, Some(endpoint()));
    }

    #[tokio::test]
    async fn test_null_values_skipped_when_disallowed() {
        let (cache, tier) = cache_over_moka(spec().with_allow_null_values(false));
        cache.put::<Option<Endpoint>>("k", &None).await.unwrap();

        assert_eq!(tier.get("k").await.unwrap(), None);
        let got: Option<Option<Endpoint>> = cache.get("k").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_null_values_cached_by_default() {
        let (cache, _) = cache_over_moka(spec());
        cache.put::<Option<Endpoint>>("k", &None).await.unwrap();

        // The cached null is a hit carrying the absent verdict.
        let got: Option<Option<Endpoint>> = cache.get("k").await.unwrap();
        assert_eq!(got, Some(None));
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_get_with_loads_once_then_hits() {
        let (cache, _) = cache_over_moka(spec());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let got: Endpoint = cache
                .get_with("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(endpoint())
                })
                .await
                .unwrap();
            assert_eq!(got, endpoint());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_get_with_survives_a_dead_tier() {
        let tier: Arc<dyn CacheTier> = Arc::new(FailingTier);
        let cache = NamedCache::new("endpoints", spec(), tier);

        let got: Endpoint = cache
            .get_with("k", || async { Ok(endpoint()) })
            .await
            .unwrap();
        assert_eq!(got, endpoint());

        let stats = cache.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.loads, 1);
    }

    #[tokio::test]
    async fn test_get_with_propagates_loader_errors() {
        let (cache, _) = cache_over_moka(spec());
        let result: KeelResult<Endpoint> = cache
            .get_with("k", || async {
                Err(StoreError::unavailable("backend down").into())
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_evict_counts_and_clears_the_key() {
        let (cache, _) = cache_over_moka(spec());
        cache.put("k", &endpoint()).await.unwrap();
        cache.evict("k").await.unwrap();

        let got: Option<Endpoint> = cache.get("k").await.unwrap();
        assert_eq!(got, None);
        assert_eq!(cache.stats().evictions, 1);
    }
}
