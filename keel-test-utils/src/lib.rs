//! Shared test infrastructure for the keel workspace:
//! - infallible fixture constructors for tenants and paths
//! - a recording watch handler for asserting on event streams
//! - scripted backends that fail on demand, for resilience tests
//! - corrupt payload builders for cache decode paths
//! - proptest generators for tenant ids, paths, and values
//!
//! Consumer crates pull this in through `dev-dependencies` only.

use async_trait::async_trait;
use keel_core::{
    Consistency, DeleteOptions, DeleteResult, EphemeralEntry, KvEntry, LockToken, PutOptions,
    StoreError, StorePath, TenantId, TxnOp, TxnResult, WatchEvent, WriteResult,
};
use keel_store::{StoreBackend, StoreResult, WatchHandler, WatchSubscription};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// Re-exported so consumers get a backend without naming keel-store.
pub use keel_store::MemoryBackend;

// ============================================================================
// FIXTURES
// ============================================================================

/// Tenant fixture. Panics on invalid input; use only with literals.
pub fn tenant(name: &str) -> TenantId {
    TenantId::new(name).expect("fixture tenant id")
}

/// Path fixture. Panics on invalid input; use only with literals.
pub fn path(raw: &str) -> StorePath {
    StorePath::normalize(raw).expect("fixture path")
}

// ============================================================================
// RECORDING WATCH HANDLER
// ============================================================================

/// Collects every event and error a watch delivers, with an async wait
/// for tests that need to synchronize on delivery.
pub struct RecordingHandler {
    events: Mutex<Vec<WatchEvent>>,
    errors: Mutex<Vec<StoreError>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingHandler {
            events: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn events(&self) -> Vec<WatchEvent> {
        self.events.lock().clone()
    }

    pub fn errors(&self) -> Vec<StoreError> {
        self.errors.lock().clone()
    }

    /// Keys of the recorded events, in delivery order.
    pub fn event_keys(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|event| event.key().to_string())
            .collect()
    }

    /// Wait until at least `count` events have been delivered and return
    /// them. Panics after five seconds; a test that waits longer is
    /// broken, not slow.
    pub async fn wait_for_events(&self, count: usize) -> Vec<WatchEvent> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let events = self.events.lock();
                    if events.len() >= count {
                        return events.clone();
                    }
                }
                self.notify.notified().await;
            }
        })
        .await
        .expect("timed out waiting for watch events")
    }
}

impl WatchHandler for RecordingHandler {
    fn on_event(&self, event: WatchEvent) {
        self.events.lock().push(event);
        // notify_one stores a permit, so a wakeup between the length
        // check and the await is never lost.
        self.notify.notify_one();
    }

    fn on_error(&self, error: &StoreError) {
        self.errors.lock().push(error.clone());
        self.notify.notify_one();
    }
}

// ============================================================================
// SCRIPTED BACKENDS
// ============================================================================

/// Backend where every operation fails with `Unavailable`.
pub struct FailingBackend {
    message: String,
}

impl FailingBackend {
    pub fn new(message: impl Into<String>) -> Self {
        FailingBackend {
            message: message.into(),
        }
    }

    fn fail<T>(&self) -> StoreResult<T> {
        Err(StoreError::unavailable(self.message.clone()))
    }
}

impl Default for FailingBackend {
    fn default() -> Self {
        FailingBackend::new("scripted failure")
    }
}

#[async_trait]
impl StoreBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn get(&self, _key: &str, _consistency: Consistency) -> StoreResult<Option<KvEntry>> {
        self.fail()
    }

    async fn list(&self, _prefix: &str, _consistency: Consistency) -> StoreResult<Vec<KvEntry>> {
        self.fail()
    }

    async fn list_keys(&self, _prefix: &str, _separator: Option<char>) -> StoreResult<Vec<String>> {
        self.fail()
    }

    async fn put(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _options: PutOptions,
    ) -> StoreResult<WriteResult> {
        self.fail()
    }

    async fn delete(&self, _key: &str, _options: DeleteOptions) -> StoreResult<DeleteResult> {
        self.fail()
    }

    async fn transaction(&self, _ops: Vec<TxnOp>) -> StoreResult<TxnResult> {
        self.fail()
    }

    async fn watch_prefix(
        &self,
        _prefix: &str,
        _handler: Arc<dyn WatchHandler>,
    ) -> StoreResult<WatchSubscription> {
        self.fail()
    }

    async fn acquire_lock(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Duration,
    ) -> StoreResult<Option<LockToken>> {
        self.fail()
    }

    async fn renew_lock(&self, _token: &LockToken) -> StoreResult<bool> {
        self.fail()
    }

    async fn release_lock(&self, _token: &LockToken) -> StoreResult<bool> {
        self.fail()
    }

    async fn put_ephemeral(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Duration,
    ) -> StoreResult<Option<EphemeralEntry>> {
        self.fail()
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.fail()
    }
}

/// In-memory backend that fails the next N operations when told to,
/// then recovers. Used to exercise retry, fallback, and cache
/// degradation paths.
pub struct FlakyBackend {
    inner: MemoryBackend,
    remaining: AtomicU32,
}

impl FlakyBackend {
    pub fn new() -> Self {
        FlakyBackend {
            inner: MemoryBackend::new(),
            remaining: AtomicU32::new(0),
        }
    }

    /// Make the next `calls` operations fail with `Unavailable`.
    pub fn fail_next(&self, calls: u32) {
        self.remaining.store(calls, Ordering::SeqCst);
    }

    /// The healthy backend underneath, for seeding and inspection.
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn gate(&self) -> StoreResult<()> {
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(StoreError::unavailable("scripted failure"))
        } else {
            Ok(())
        }
    }
}

impl Default for FlakyBackend {
    fn default() -> Self {
        FlakyBackend::new()
    }
}

#[async_trait]
impl StoreBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &str, consistency: Consistency) -> StoreResult<Option<KvEntry>> {
        self.gate()?;
        self.inner.get(key, consistency).await
    }

    async fn list(&self, prefix: &str, consistency: Consistency) -> StoreResult<Vec<KvEntry>> {
        self.gate()?;
        self.inner.list(prefix, consistency).await
    }

    async fn list_keys(&self, prefix: &str, separator: Option<char>) -> StoreResult<Vec<String>> {
        self.gate()?;
        self.inner.list_keys(prefix, separator).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> StoreResult<WriteResult> {
        self.gate()?;
        self.inner.put(key, value, options).await
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> StoreResult<DeleteResult> {
        self.gate()?;
        self.inner.delete(key, options).await
    }

    async fn transaction(&self, ops: Vec<TxnOp>) -> StoreResult<TxnResult> {
        self.gate()?;
        self.inner.transaction(ops).await
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        handler: Arc<dyn WatchHandler>,
    ) -> StoreResult<WatchSubscription> {
        self.gate()?;
        self.inner.watch_prefix(prefix, handler).await
    }

    async fn acquire_lock(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<Option<LockToken>> {
        self.gate()?;
        self.inner.acquire_lock(key, value, ttl).await
    }

    async fn renew_lock(&self, token: &LockToken) -> StoreResult<bool> {
        self.gate()?;
        self.inner.renew_lock(token).await
    }

    async fn release_lock(&self, token: &LockToken) -> StoreResult<bool> {
        self.gate()?;
        self.inner.release_lock(token).await
    }

    async fn put_ephemeral(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<Option<EphemeralEntry>> {
        self.gate()?;
        self.inner.put_ephemeral(key, value, ttl).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.gate()?;
        self.inner.health_check().await
    }
}

// ============================================================================
// CORRUPT PAYLOADS
// ============================================================================

/// Builders for payloads that must fail cache decoding.
pub mod corrupt {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// Valid gzip frame around `bytes`.
    pub fn gzipped(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).expect("gzip fixture");
        encoder.finish().expect("gzip fixture")
    }

    /// Gzip frame with its tail cut off. Sniffs as gzip, fails to
    /// decompress.
    pub fn truncated_gzip(bytes: &[u8]) -> Vec<u8> {
        let mut frame = gzipped(bytes);
        frame.truncate((frame.len() / 2).max(4));
        frame
    }

    /// Bytes that are neither gzip nor JSON.
    pub fn not_json() -> Vec<u8> {
        vec![0x00, 0x01, 0xfe, 0xff]
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

/// Strategies over the workspace's validated domain types.
pub mod generators {
    use keel_core::{StorePath, TenantId};
    use proptest::prelude::*;

    /// Single valid path segment.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-z0-9._~-]{1,12}".prop_filter("no traversal segments", |s| s != "." && s != "..")
    }

    /// Normalized path with zero to five segments; includes the root.
    pub fn arb_store_path() -> impl Strategy<Value = StorePath> {
        prop::collection::vec(arb_segment(), 0..6)
            .prop_map(|segments| StorePath::normalize(&segments.join("/")).expect("valid segments"))
    }

    /// Normalized non-root path.
    pub fn arb_nonroot_path() -> impl Strategy<Value = StorePath> {
        prop::collection::vec(arb_segment(), 1..6)
            .prop_map(|segments| StorePath::normalize(&segments.join("/")).expect("valid segments"))
    }

    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        "[a-z0-9][a-z0-9_-]{0,15}".prop_map(|s| TenantId::new(s).expect("valid tenant slug"))
    }

    /// Arbitrary caller input for the normalizer, valid or not.
    pub fn arb_raw_input() -> impl Strategy<Value = String> {
        proptest::string::string_regex(".{0,64}").expect("valid regex")
    }

    /// Entry values, including the empty value.
    pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..256)
    }
}
