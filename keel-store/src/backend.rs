//! Backend adapter contract.
//!
//! A [`StoreBackend`] adapts one coordination store (memory, Consul, etcd)
//! to a common key-value surface. Keys at this layer are absolute backend
//! keys; tenant scoping happens above, in the [`Store`](crate::Store)
//! orchestrator.
//!
//! Error conventions shared by every adapter:
//!
//! - absent keys are `Ok(None)` or empty collections, never errors
//! - a failed compare-and-set is a result value (`success: false`), never
//!   an error
//! - malformed requests fail with [`StoreError::InvalidArgument`] before
//!   any backend call
//! - connectivity problems surface as [`StoreError::Unavailable`]

use async_trait::async_trait;
use keel_core::{
    Consistency, DeleteOptions, DeleteResult, EphemeralEntry, KvEntry, LockToken, PutOptions,
    StoreError, TxnOp, TxnResult, WatchEvent, WriteResult,
};
use std::sync::Arc;
use std::time::Duration;

use crate::watch::WatchSubscription;

/// Result alias for backend operations.
pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// WATCH HANDLER
// ============================================================================

/// Receives changes observed under a watched prefix.
///
/// Callbacks run on the watch task; implementations should hand heavy work
/// off rather than block the stream.
pub trait WatchHandler: Send + Sync {
    /// A committed change under the watched prefix.
    fn on_event(&self, event: WatchEvent);

    /// A transient stream failure. The watch keeps running and resumes
    /// after the backend recovers.
    fn on_error(&self, error: &StoreError) {
        tracing::warn!(error = %error, "watch stream error");
    }
}

// ============================================================================
// STORE BACKEND
// ============================================================================

/// Adapter over one coordination store.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Short backend name used in logs and error messages.
    fn name(&self) -> &'static str;

    // ========================================================================
    // READS
    // ========================================================================

    /// Read a single key. Absent keys return `Ok(None)`.
    async fn get(&self, key: &str, consistency: Consistency) -> StoreResult<Option<KvEntry>>;

    /// Read every entry whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str, consistency: Consistency) -> StoreResult<Vec<KvEntry>>;

    /// Read keys under `prefix`, sorted. With a separator, keys are folded
    /// at the first separator past the prefix into directory-style entries
    /// that keep their trailing separator.
    async fn list_keys(&self, prefix: &str, separator: Option<char>) -> StoreResult<Vec<String>>;

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Write a single key. See [`PutOptions`] for compare-and-set
    /// semantics; a failed guard reports `success: false`.
    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions)
        -> StoreResult<WriteResult>;

    /// Delete a key, or a whole prefix with
    /// [`DeleteOptions::with_recurse`]. Recursive deletes cannot carry a
    /// compare-and-set guard.
    async fn delete(&self, key: &str, options: DeleteOptions) -> StoreResult<DeleteResult>;

    /// Apply a set of operations atomically. Either every operation
    /// applies or none does; a guard failure reports per-operation
    /// outcomes with `success: false` on the result.
    async fn transaction(&self, ops: Vec<TxnOp>) -> StoreResult<TxnResult>;

    // ========================================================================
    // WATCHES
    // ========================================================================

    /// Stream future changes under `prefix` to `handler` until the
    /// returned subscription is cancelled or dropped. No history is
    /// replayed; only changes committed after the watch starts are
    /// delivered.
    async fn watch_prefix(
        &self,
        prefix: &str,
        handler: Arc<dyn WatchHandler>,
    ) -> StoreResult<WatchSubscription>;

    // ========================================================================
    // LOCKS AND EPHEMERAL ENTRIES
    // ========================================================================

    /// Try to acquire the lock at `key`, writing `value` as the lock
    /// entry. Returns `Ok(None)` when another holder owns it. The lock is
    /// held until released, or until `ttl` elapses without renewal.
    async fn acquire_lock(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<Option<LockToken>>;

    /// Extend the holder's session. Returns `false` when the lock is no
    /// longer held by this token.
    async fn renew_lock(&self, token: &LockToken) -> StoreResult<bool>;

    /// Release the lock and delete its entry. Returns `false` when the
    /// token no longer holds the lock.
    async fn release_lock(&self, token: &LockToken) -> StoreResult<bool>;

    /// Write a key that disappears when its session expires. Returns
    /// `Ok(None)` when the key is held by another live session. The
    /// session can be kept alive by renewing a [`LockToken`] built from
    /// the key and returned session id.
    async fn put_ephemeral(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<Option<EphemeralEntry>>;

    // ========================================================================
    // HEALTH
    // ========================================================================

    /// Verify the backend is reachable.
    async fn health_check(&self) -> StoreResult<()>;
}
