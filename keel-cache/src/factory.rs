//! Builds cache managers from settings.

use crate::config::{CacheProvider, CacheSettings};
use crate::manager::CacheManager;
use keel_core::{CacheError, ConfigError, KeelResult};
use redis::aio::ConnectionManager;
use tracing::info;

/// Builds [`CacheManager`]s from validated [`CacheSettings`].
///
/// The factory is cheap to construct and holds no connections; redis is
/// dialed inside [`build`](CacheFactory::build) so a failed build
/// leaves nothing half-installed.
#[derive(Debug, Clone)]
pub struct CacheFactory {
    settings: CacheSettings,
}

impl CacheFactory {
    pub fn new(settings: CacheSettings) -> KeelResult<Self> {
        settings.validate()?;
        Ok(CacheFactory { settings })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Build a manager serving `provider`. When the provider, or any
    /// per-cache override, reaches redis, the connection is established
    /// here under the configured connect timeout; on failure the error
    /// returns with no manager built.
    pub async fn build(&self, provider: CacheProvider) -> KeelResult<CacheManager> {
        let settings = self.settings.clone().with_provider(provider);
        let redis = if settings.needs_redis() {
            Some(self.connect().await?)
        } else {
            None
        };
        info!(provider = %provider, application = %settings.application, "cache manager built");
        Ok(CacheManager::new(settings, redis))
    }

    /// Whether `provider` could serve right now. Distributed providers
    /// PING a throwaway redis connection; `Local` and `Disabled` are
    /// always available. Never mutates state.
    pub async fn is_available(&self, provider: CacheProvider) -> bool {
        if !provider.needs_redis() {
            return true;
        }
        let Ok(client) = redis::Client::open(self.settings.redis.url.as_str()) else {
            return false;
        };
        let connect = client.get_multiplexed_async_connection();
        let Ok(Ok(mut conn)) =
            tokio::time::timeout(self.settings.redis.connect_timeout, connect).await
        else {
            return false;
        };
        let ping = async {
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            redis::RedisResult::Ok(pong)
        };
        matches!(
            tokio::time::timeout(self.settings.redis.operation_timeout, ping).await,
            Ok(Ok(_))
        )
    }

    async fn connect(&self) -> KeelResult<ConnectionManager> {
        let client =
            redis::Client::open(self.settings.redis.url.as_str()).map_err(|err| {
                ConfigError::InvalidValue {
                    field: "redis.url".to_string(),
                    value: self.settings.redis.url.clone(),
                    reason: err.to_string(),
                }
            })?;
        let connect = ConnectionManager::new(client);
        match tokio::time::timeout(self.settings.redis.connect_timeout, connect).await {
            Ok(Ok(manager)) => Ok(manager),
            Ok(Err(err)) => {
                Err(CacheError::unavailable(format!("redis connect failed: {err}")).into())
            }
            Err(_) => Err(CacheError::unavailable(format!(
                "redis connect timed out after {:?}",
                self.settings.redis.connect_timeout
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::KeelError;
    use std::time::Duration;

    /// Nothing listens here; connection attempts fail fast.
    const DEAD_REDIS: &str = "redis://127.0.0.1:59075";

    fn dead_redis_settings() -> CacheSettings {
        let mut settings = CacheSettings::new(CacheProvider::Distributed).with_redis_url(DEAD_REDIS);
        settings.redis.connect_timeout = Duration::from_millis(500);
        settings.redis.operation_timeout = Duration::from_millis(200);
        settings
    }

    #[test]
    fn test_new_rejects_invalid_settings() {
        let settings = CacheSettings::default().with_application("");
        assert!(matches!(
            CacheFactory::new(settings),
            Err(KeelError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_build_local_needs_no_redis() {
        let factory = CacheFactory::new(CacheSettings::default()).unwrap();
        let manager = factory.build(CacheProvider::Local).await.unwrap();
        assert_eq!(manager.provider(), CacheProvider::Local);
    }

    #[tokio::test]
    async fn test_build_distributed_fails_cleanly_without_redis() {
        let factory = CacheFactory::new(dead_redis_settings()).unwrap();
        let result = factory.build(CacheProvider::Distributed).await;
        assert!(matches!(result, Err(KeelError::Cache(_))));
    }

    #[tokio::test]
    async fn test_is_available_for_each_provider() {
        let factory = CacheFactory::new(dead_redis_settings()).unwrap();
        assert!(factory.is_available(CacheProvider::Local).await);
        assert!(factory.is_available(CacheProvider::Disabled).await);
        assert!(!factory.is_available(CacheProvider::Distributed).await);
        assert!(!factory.is_available(CacheProvider::TwoLevel).await);
    }
}
