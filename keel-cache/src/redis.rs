//! Redis tier with breaker protection and local fallback.
//!
//! Every command runs under a [`CircuitBreaker`] permit and a
//! `tokio::time::timeout`; an elapsed timeout counts as a breaker
//! failure. When the breaker rejects a call, or a command fails with
//! the breaker closed, reads are served from a private in-process
//! fallback tier (when enabled) and writes are mirrored into it so the
//! application keeps a working cache through a redis outage. Without
//! the fallback, reads surface `CacheError::{CircuitOpen, Unavailable}`.

use crate::breaker::CircuitBreaker;
use crate::config::CacheSpec;
use crate::local::MokaTier;
use crate::tier::CacheTier;
use async_trait::async_trait;
use keel_core::CacheError;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Redis-backed tier scoped to one named cache's keyspace.
#[derive(Clone)]
pub struct RedisTier {
    cache_name: String,
    /// `{application}::{name}:`; `clear` touches nothing outside it.
    prefix: String,
    connection: ConnectionManager,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
    ttl_secs: u64,
    fallback: Option<MokaTier>,
}

impl RedisTier {
    pub fn new(
        cache_name: impl Into<String>,
        prefix: impl Into<String>,
        connection: ConnectionManager,
        breaker: Arc<CircuitBreaker>,
        spec: &CacheSpec,
        timeout: Duration,
        fallback_to_local: bool,
    ) -> Self {
        RedisTier {
            cache_name: cache_name.into(),
            prefix: prefix.into(),
            connection,
            breaker,
            timeout,
            ttl_secs: ttl_seconds(spec.ttl),
            fallback: fallback_to_local.then(|| MokaTier::new(spec)),
        }
    }

    /// Run one redis command under a breaker permit and the operation
    /// timeout. Rejection maps to `CircuitOpen`, failure and timeout to
    /// `Unavailable`; both settle the permit accordingly.
    async fn guarded<T, Fut>(&self, op: &'static str, fut: Fut) -> Result<T, CacheError>
    where
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let Some(permit) = self.breaker.try_acquire() else {
            return Err(CacheError::CircuitOpen {
                cache: self.cache_name.clone(),
            });
        };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                permit.succeed();
                Ok(value)
            }
            Ok(Err(err)) => {
                permit.fail();
                Err(CacheError::unavailable(format!("redis {op} failed: {err}")))
            }
            Err(_) => {
                permit.fail();
                Err(CacheError::unavailable(format!(
                    "redis {op} timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection.clone();
        let result = self
            .guarded("get", async move {
                conn.get::<_, Option<Vec<u8>>>(key).await
            })
            .await;
        match result {
            Ok(value) => Ok(value),
            Err(err) => match &self.fallback {
                Some(local) => {
                    debug!(
                        cache = %self.cache_name,
                        error = %err,
                        "redis read failed; serving from local fallback"
                    );
                    local.get(key).await
                }
                None => Err(err),
            },
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let mirror = self.fallback.as_ref().map(|_| value.clone());
        let ttl = self.ttl_secs;
        let mut conn = self.connection.clone();
        let result = self
            .guarded("set", async move {
                conn.set_ex::<_, _, ()>(key, value, ttl).await
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => match (&self.fallback, mirror) {
                (Some(local), Some(payload)) => {
                    debug!(
                        cache = %self.cache_name,
                        error = %err,
                        "redis write failed; mirroring to local fallback"
                    );
                    local.put(key, payload).await
                }
                _ => {
                    // Cache writes are advisory; a failed one is a
                    // future miss, not an error.
                    debug!(
                        cache = %self.cache_name,
                        error = %err,
                        "redis write failed; dropping cache write"
                    );
                    Ok(())
                }
            },
        }
    }

    async fn evict(&self, key: &str) -> Result<(), CacheError> {
        if let Some(local) = &self.fallback {
            local.evict(key).await?;
        }
        let mut conn = self.connection.clone();
        self.guarded("del", async move { conn.del::<_, ()>(key).await })
            .await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        if let Some(local) = &self.fallback {
            local.clear().await?;
        }
        let pattern = format!("{}*", self.prefix);
        let mut scan_conn = self.connection.clone();
        let mut del_conn = self.connection.clone();
        self.guarded("clear", async move {
            // Cursor scan over this cache's keyspace only; a shared
            // redis holds other caches' keys too.
            let mut keys: Vec<String> = Vec::new();
            {
                let mut iter = scan_conn.scan_match::<_, String>(&pattern).await?;
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
            }
            if !keys.is_empty() {
                del_conn.del::<_, ()>(keys).await?;
            }
            Ok(())
        })
        .await
    }
}

/// SET EX takes whole seconds and rejects zero, so the TTL truncates
/// to seconds with a one-second floor.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
