//! Tiered caching for keel: named caches over pluggable tiers, a
//! circuit breaker guarding the distributed tier, and a cached front
//! for the store orchestrator.
//!
//! # Architecture
//!
//! - [`config`] - [`CacheSettings`], per-cache [`CacheSpec`] overrides,
//!   and the [`CacheProvider`] selection
//! - [`tier`] - the [`CacheTier`] byte-level contract
//! - [`local`], [`redis`], [`two_level`], [`disabled`] - the tier
//!   implementations
//! - [`breaker`] - sliding-window [`CircuitBreaker`] between callers
//!   and redis
//! - [`named`] - [`NamedCache`]: typed serde access, optional gzip,
//!   corruption eviction, per-cache stats
//! - [`keys`] - deterministic [`KeyGenerator`] key scheme
//! - [`manager`], [`factory`], [`delegating`] - cache construction and
//!   live provider switching
//! - [`store_cache`] - [`CachedStore`], the read-through front over
//!   [`keel_store::Store`]
//!
//! Every failure mode degrades toward the backing store: a cache that
//! cannot be reached produces misses, never errors, on the typed read
//! path.

pub mod breaker;
pub mod config;
pub mod delegating;
pub mod disabled;
pub mod factory;
pub mod keys;
pub mod local;
pub mod manager;
pub mod named;
pub mod redis;
pub mod stats;
pub mod store_cache;
pub mod tier;
pub mod two_level;

// Configuration
pub use config::{BreakerConfig, CacheProvider, CacheSettings, CacheSpec, RedisSettings};

// Tiers
pub use disabled::DisabledTier;
pub use local::MokaTier;
// `self::` keeps the module from colliding with the redis crate.
pub use self::redis::RedisTier;
pub use tier::CacheTier;
pub use two_level::TwoLevelTier;

// Breaker
pub use breaker::{BreakerMetrics, CallPermit, CircuitBreaker, CircuitState};

// Named caches and their bookkeeping
pub use keys::KeyGenerator;
pub use named::NamedCache;
pub use stats::{CacheStats, CacheStatsRecorder};

// Construction and switching
pub use delegating::DelegatingCacheManager;
pub use factory::CacheFactory;
pub use manager::CacheManager;

// Store integration
pub use store_cache::{CachedStore, ENTRY_CACHE, LIST_CACHE};
