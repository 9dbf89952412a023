//! In-memory backend.
//!
//! Single-process reference implementation of [`StoreBackend`]. Every
//! mutation commits under one write lock and is assigned a monotonically
//! increasing index, so compare-and-set and transaction semantics match
//! the networked backends exactly. Sessions expire on a background
//! sweeper task owned by the backend.
//!
//! Reads ignore the requested [`Consistency`]; a single process is always
//! consistent with itself.

use async_trait::async_trait;
use keel_core::{
    kv::ensure_single_tenant, Consistency, DeleteOptions, DeleteResult, EphemeralEntry, KvEntry,
    LockToken, PutOptions, StoreError, TxnOp, TxnOpResult, TxnResult, WatchEvent, WriteResult,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::{StoreBackend, StoreResult, WatchHandler};
use crate::watch::WatchSubscription;

/// How often expired sessions are reaped.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    flags: u64,
    create_index: u64,
    modify_index: u64,
    /// Owning session for lock and ephemeral entries.
    session: Option<String>,
}

#[derive(Debug)]
struct Session {
    deadline: Instant,
    ttl: Duration,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, StoredEntry>,
    sessions: HashMap<String, Session>,
    next_index: u64,
}

impl MemoryState {
    fn bump_index(&mut self) -> u64 {
        self.next_index += 1;
        self.next_index
    }

    fn entry_to_kv(key: &str, entry: &StoredEntry) -> KvEntry {
        KvEntry {
            key: key.to_string(),
            value: entry.value.clone(),
            flags: entry.flags,
            create_index: entry.create_index,
            modify_index: entry.modify_index,
        }
    }

    fn session_alive(&self, id: &str, now: Instant) -> bool {
        self.sessions.get(id).is_some_and(|s| s.deadline > now)
    }

    /// Remove every expired session and its owned entries. Returns the
    /// delete events to fan out.
    fn expire_sessions(&mut self, now: Instant) -> Vec<WatchEvent> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut events = Vec::new();
        for id in expired {
            let Some(session) = self.sessions.remove(&id) else {
                continue;
            };
            for key in session.keys {
                let owned = self
                    .entries
                    .get(&key)
                    .is_some_and(|e| e.session.as_deref() == Some(id.as_str()));
                if owned {
                    self.entries.remove(&key);
                    let index = self.bump_index();
                    events.push(WatchEvent::Delete {
                        key,
                        modify_index: index,
                    });
                }
            }
        }
        events
    }

    /// Detach `key` from its owning session, if any.
    fn detach_from_session(&mut self, key: &str) {
        let owner = self
            .entries
            .get(key)
            .and_then(|e| e.session.clone());
        if let Some(id) = owner {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.keys.remove(key);
            }
        }
    }
}

struct MemoryInner {
    state: RwLock<MemoryState>,
    watchers: Mutex<Vec<Watcher>>,
}

impl MemoryInner {
    /// Fan events out to matching watchers, dropping watchers whose
    /// receiver is gone.
    fn notify(&self, events: &[WatchEvent]) {
        if events.is_empty() {
            return;
        }
        let mut watchers = self.watchers.lock();
        watchers.retain(|watcher| {
            for event in events {
                if event.key().starts_with(&watcher.prefix)
                    && watcher.tx.send(event.clone()).is_err()
                {
                    return false;
                }
            }
            true
        });
    }
}

/// Aborts the sweeper task when the backend is dropped.
struct SweeperGuard(JoinHandle<()>);

impl Drop for SweeperGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// In-memory [`StoreBackend`].
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
    _sweeper: SweeperGuard,
}

impl MemoryBackend {
    /// Create an empty backend and start its session sweeper. Must be
    /// called from within a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(MemoryInner {
            state: RwLock::new(MemoryState::default()),
            watchers: Mutex::new(Vec::new()),
        });

        let sweep_target = Arc::downgrade(&inner);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(inner) = sweep_target.upgrade() else {
                    break;
                };
                let events = {
                    let mut state = inner.state.write();
                    state.expire_sessions(Instant::now())
                };
                inner.notify(&events);
            }
        });

        MemoryBackend {
            inner,
            _sweeper: SweeperGuard(sweeper),
        }
    }

    fn create_session(state: &mut MemoryState, ttl: Duration) -> String {
        let id = Uuid::now_v7().to_string();
        state.sessions.insert(
            id.clone(),
            Session {
                deadline: Instant::now() + ttl,
                ttl,
                keys: HashSet::new(),
            },
        );
        id
    }

    fn write_entry(
        state: &mut MemoryState,
        key: &str,
        value: Vec<u8>,
        flags: u64,
        session: Option<String>,
        index: u64,
    ) -> KvEntry {
        let create_index = state
            .entries
            .get(key)
            .map(|e| e.create_index)
            .unwrap_or(index);
        let entry = StoredEntry {
            value,
            flags,
            create_index,
            modify_index: index,
            session,
        };
        let kv = MemoryState::entry_to_kv(key, &entry);
        state.entries.insert(key.to_string(), entry);
        kv
    }

    fn require_key(key: &str) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::invalid_argument("key must not be empty"));
        }
        Ok(())
    }

    fn require_ttl(ttl: Duration) -> StoreResult<()> {
        if ttl.is_zero() {
            return Err(StoreError::invalid_argument("ttl must be positive"));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend::new()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str, _consistency: Consistency) -> StoreResult<Option<KvEntry>> {
        Self::require_key(key)?;
        let state = self.inner.state.read();
        Ok(state
            .entries
            .get(key)
            .map(|entry| MemoryState::entry_to_kv(key, entry)))
    }

    async fn list(&self, prefix: &str, _consistency: Consistency) -> StoreResult<Vec<KvEntry>> {
        let state = self.inner.state.read();
        Ok(state
            .entries
            .range::<String, _>((Bound::Included(prefix.to_string()), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| MemoryState::entry_to_kv(key, entry))
            .collect())
    }

    async fn list_keys(&self, prefix: &str, separator: Option<char>) -> StoreResult<Vec<String>> {
        let keys: Vec<String> = {
            let state = self.inner.state.read();
            state
                .entries
                .range::<String, _>((Bound::Included(prefix.to_string()), Bound::Unbounded))
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect()
        };
        Ok(match separator {
            Some(sep) => keel_core::path::fold_keys(prefix, keys, sep),
            None => keys,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        options: PutOptions,
    ) -> StoreResult<WriteResult> {
        Self::require_key(key)?;
        let (result, event) = {
            let mut state = self.inner.state.write();
            let current = state.entries.get(key).map(|e| e.modify_index);
            let satisfied = match options.cas {
                None => true,
                Some(0) => current.is_none(),
                Some(expected) => current == Some(expected),
            };
            if !satisfied {
                (
                    WriteResult {
                        success: false,
                        modify_index: 0,
                    },
                    None,
                )
            } else {
                let index = state.bump_index();
                let session = state.entries.get(key).and_then(|e| e.session.clone());
                let kv =
                    Self::write_entry(&mut state, key, value, options.flags, session, index);
                (
                    WriteResult {
                        success: true,
                        modify_index: index,
                    },
                    Some(WatchEvent::Put(kv)),
                )
            }
        };
        if let Some(event) = event {
            self.inner.notify(&[event]);
        }
        Ok(result)
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> StoreResult<DeleteResult> {
        if options.recurse && options.cas.is_some() {
            return Err(StoreError::invalid_argument(
                "recursive delete cannot carry a cas guard",
            ));
        }
        if !options.recurse {
            Self::require_key(key)?;
        }

        let (result, events) = {
            let mut state = self.inner.state.write();
            if options.recurse {
                let doomed: Vec<String> = state
                    .entries
                    .range::<String, _>((Bound::Included(key.to_string()), Bound::Unbounded))
                    .take_while(|(k, _)| k.starts_with(key))
                    .map(|(k, _)| k.clone())
                    .collect();
                if doomed.is_empty() {
                    (DeleteResult { success: true }, Vec::new())
                } else {
                    let index = state.bump_index();
                    let mut events = Vec::with_capacity(doomed.len());
                    for k in doomed {
                        state.detach_from_session(&k);
                        state.entries.remove(&k);
                        events.push(WatchEvent::Delete {
                            key: k,
                            modify_index: index,
                        });
                    }
                    (DeleteResult { success: true }, events)
                }
            } else {
                let current = state.entries.get(key).map(|e| e.modify_index);
                let satisfied = match options.cas {
                    None => true,
                    Some(0) => current.is_none(),
                    Some(expected) => current == Some(expected),
                };
                if !satisfied {
                    (DeleteResult { success: false }, Vec::new())
                } else if current.is_none() {
                    (DeleteResult { success: true }, Vec::new())
                } else {
                    state.detach_from_session(key);
                    state.entries.remove(key);
                    let index = state.bump_index();
                    (
                        DeleteResult { success: true },
                        vec![WatchEvent::Delete {
                            key: key.to_string(),
                            modify_index: index,
                        }],
                    )
                }
            }
        };
        self.inner.notify(&events);
        Ok(result)
    }

    async fn transaction(&self, ops: Vec<TxnOp>) -> StoreResult<TxnResult> {
        ensure_single_tenant(&ops)?;

        let (result, events) = {
            let mut state = self.inner.state.write();

            // Validate every guard before touching anything.
            let mut failures: HashMap<usize, String> = HashMap::new();
            for (idx, op) in ops.iter().enumerate() {
                let current = state.entries.get(op.key()).map(|e| e.modify_index);
                match op.cas() {
                    None => {}
                    Some(0) => {
                        if let Some(current) = current {
                            failures.insert(
                                idx,
                                format!("key already exists at index {current}"),
                            );
                        }
                    }
                    Some(expected) => {
                        if current != Some(expected) {
                            failures.insert(
                                idx,
                                format!(
                                    "cas index mismatch: expected {expected}, current {}",
                                    current.unwrap_or(0)
                                ),
                            );
                        }
                    }
                }
            }

            if !failures.is_empty() {
                let results = ops
                    .iter()
                    .enumerate()
                    .map(|(idx, _)| match failures.remove(&idx) {
                        Some(message) => TxnOpResult::failed(message),
                        None => TxnOpResult::failed("transaction aborted"),
                    })
                    .collect();
                (TxnResult::aborted(results), Vec::new())
            } else {
                // Single commit index for the whole transaction.
                let index = state.bump_index();
                let mut results = Vec::with_capacity(ops.len());
                let mut events = Vec::with_capacity(ops.len());
                for op in ops {
                    match op {
                        TxnOp::Set {
                            key, value, flags, ..
                        } => {
                            let session =
                                state.entries.get(&key).and_then(|e| e.session.clone());
                            let kv = Self::write_entry(
                                &mut state, &key, value, flags, session, index,
                            );
                            events.push(WatchEvent::Put(kv));
                            results.push(TxnOpResult::applied(Some(index)));
                        }
                        TxnOp::Delete { key, .. } => {
                            if state.entries.contains_key(&key) {
                                state.detach_from_session(&key);
                                state.entries.remove(&key);
                                events.push(WatchEvent::Delete {
                                    key,
                                    modify_index: index,
                                });
                            }
                            results.push(TxnOpResult::applied(None));
                        }
                    }
                }
                (TxnResult::applied(results), events)
            }
        };
        self.inner.notify(&events);
        Ok(result)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        handler: Arc<dyn WatchHandler>,
    ) -> StoreResult<WatchSubscription> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.watchers.lock().push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => handler.on_event(event),
                        None => break,
                    },
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            // Deliver anything committed before the stop signal.
            while let Ok(event) = rx.try_recv() {
                handler.on_event(event);
            }
        });

        Ok(WatchSubscription::new(prefix, stop_tx, task))
    }

    async fn acquire_lock(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<Option<LockToken>> {
        Self::require_key(key)?;
        Self::require_ttl(ttl)?;

        let (token, events) = {
            let mut state = self.inner.state.write();
            let now = Instant::now();
            // Reap lazily so a just-expired holder does not block acquire
            // until the next sweep.
            let mut events = state.expire_sessions(now);

            let held = state
                .entries
                .get(key)
                .and_then(|e| e.session.clone())
                .is_some_and(|id| state.session_alive(&id, now));
            if held {
                (None, events)
            } else {
                let session = Self::create_session(&mut state, ttl);
                let index = state.bump_index();
                let kv = Self::write_entry(
                    &mut state,
                    key,
                    value,
                    0,
                    Some(session.clone()),
                    index,
                );
                if let Some(s) = state.sessions.get_mut(&session) {
                    s.keys.insert(key.to_string());
                }
                events.push(WatchEvent::Put(kv));
                (
                    Some(LockToken {
                        key: key.to_string(),
                        session,
                    }),
                    events,
                )
            }
        };
        self.inner.notify(&events);
        Ok(token)
    }

    async fn renew_lock(&self, token: &LockToken) -> StoreResult<bool> {
        let mut state = self.inner.state.write();
        let now = Instant::now();
        let holds = state
            .entries
            .get(&token.key)
            .is_some_and(|e| e.session.as_deref() == Some(token.session.as_str()))
            && state.session_alive(&token.session, now);
        if !holds {
            return Ok(false);
        }
        if let Some(session) = state.sessions.get_mut(&token.session) {
            session.deadline = now + session.ttl;
        }
        Ok(true)
    }

    async fn release_lock(&self, token: &LockToken) -> StoreResult<bool> {
        let (released, events) = {
            let mut state = self.inner.state.write();
            let now = Instant::now();
            let holds = state
                .entries
                .get(&token.key)
                .is_some_and(|e| e.session.as_deref() == Some(token.session.as_str()))
                && state.session_alive(&token.session, now);
            if !holds {
                state.sessions.remove(&token.session);
                (false, Vec::new())
            } else {
                state.sessions.remove(&token.session);
                state.entries.remove(&token.key);
                let index = state.bump_index();
                (
                    true,
                    vec![WatchEvent::Delete {
                        key: token.key.clone(),
                        modify_index: index,
                    }],
                )
            }
        };
        self.inner.notify(&events);
        Ok(released)
    }

    async fn put_ephemeral(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<Option<EphemeralEntry>> {
        Self::require_key(key)?;
        Self::require_ttl(ttl)?;

        let (entry, events) = {
            let mut state = self.inner.state.write();
            let now = Instant::now();
            let mut events = state.expire_sessions(now);

            let held = state
                .entries
                .get(key)
                .and_then(|e| e.session.clone())
                .is_some_and(|id| state.session_alive(&id, now));
            if held {
                (None, events)
            } else {
                let session = Self::create_session(&mut state, ttl);
                let index = state.bump_index();
                let kv =
                    Self::write_entry(&mut state, key, value, 0, Some(session.clone()), index);
                if let Some(s) = state.sessions.get_mut(&session) {
                    s.keys.insert(key.to_string());
                }
                events.push(WatchEvent::Put(kv));
                (
                    Some(EphemeralEntry {
                        session,
                        modify_index: index,
                    }),
                    events,
                )
            }
        };
        self.inner.notify(&events);
        Ok(entry)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    struct Recorder {
        events: SyncMutex<Vec<WatchEvent>>,
        notify: tokio::sync::Notify,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                events: SyncMutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }

        async fn wait_for(&self, count: usize) -> Vec<WatchEvent> {
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

    impl WatchHandler for Recorder {
        fn on_event(&self, event: WatchEvent) {
            self.events.lock().push(event);
            // notify_one stores a permit, so a wakeup between the length
            // check and the await is never lost.
            self.notify.notify_one();
        }
    }

    fn key(rest: &str) -> String {
        format!("keel/tenants/acme/{rest}")
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let backend = MemoryBackend::new();
        let result = backend
            .put(&key("app/config"), b"hello".to_vec(), PutOptions::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.modify_index, 1);

        let entry = backend
            .get(&key("app/config"), Consistency::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.value, b"hello");
        assert_eq!(entry.create_index, 1);
        assert_eq!(entry.modify_index, 1);
    }

    #[tokio::test]
    async fn test_get_absent_is_none() {
        let backend = MemoryBackend::new();
        let entry = backend.get(&key("missing"), Consistency::Default).await.unwrap();
        assert!(entry.is_none());
    }

    #[tokio::test]
    async fn test_cas_must_not_exist() {
        let backend = MemoryBackend::new();
        let first = backend
            .put(&key("a"), b"1".to_vec(), PutOptions::new().must_not_exist())
            .await
            .unwrap();
        assert!(first.success);

        let second = backend
            .put(&key("a"), b"2".to_vec(), PutOptions::new().must_not_exist())
            .await
            .unwrap();
        assert!(!second.success);
        assert_eq!(second.modify_index, 0);
    }

    #[tokio::test]
    async fn test_cas_index_guard() {
        let backend = MemoryBackend::new();
        let written = backend
            .put(&key("a"), b"1".to_vec(), PutOptions::new())
            .await
            .unwrap();

        let stale = backend
            .put(
                &key("a"),
                b"2".to_vec(),
                PutOptions::new().with_cas(written.modify_index + 5),
            )
            .await
            .unwrap();
        assert!(!stale.success);

        let fresh = backend
            .put(
                &key("a"),
                b"2".to_vec(),
                PutOptions::new().with_cas(written.modify_index),
            )
            .await
            .unwrap();
        assert!(fresh.success);
        assert!(fresh.modify_index > written.modify_index);
    }

    #[tokio::test]
    async fn test_create_index_survives_rewrites() {
        let backend = MemoryBackend::new();
        backend.put(&key("a"), b"1".to_vec(), PutOptions::new()).await.unwrap();
        backend.put(&key("a"), b"2".to_vec(), PutOptions::new()).await.unwrap();
        let entry = backend.get(&key("a"), Consistency::Default).await.unwrap().unwrap();
        assert_eq!(entry.create_index, 1);
        assert_eq!(entry.modify_index, 2);
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_prefix_bound() {
        let backend = MemoryBackend::new();
        for k in ["b/2", "a/1", "b/1", "c"] {
            backend.put(&key(k), b"v".to_vec(), PutOptions::new()).await.unwrap();
        }
        let entries = backend
            .list(&key("b/"), Consistency::Default)
            .await
            .unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec![key("b/1"), key("b/2")]);
    }

    #[tokio::test]
    async fn test_list_keys_folds_on_separator() {
        let backend = MemoryBackend::new();
        for k in ["app/a", "app/b", "flag", "svc/x/y"] {
            backend.put(&key(k), b"v".to_vec(), PutOptions::new()).await.unwrap();
        }
        let keys = backend
            .list_keys(&key(""), Some('/'))
            .await
            .unwrap();
        assert_eq!(keys, vec![key("app/"), key("flag"), key("svc/")]);
    }

    #[tokio::test]
    async fn test_delete_absent_succeeds() {
        let backend = MemoryBackend::new();
        let result = backend
            .delete(&key("missing"), DeleteOptions::new())
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_delete_cas_guard() {
        let backend = MemoryBackend::new();
        let written = backend
            .put(&key("a"), b"1".to_vec(), PutOptions::new())
            .await
            .unwrap();

        let stale = backend
            .delete(&key("a"), DeleteOptions::new().with_cas(written.modify_index + 1))
            .await
            .unwrap();
        assert!(!stale.success);

        let fresh = backend
            .delete(&key("a"), DeleteOptions::new().with_cas(written.modify_index))
            .await
            .unwrap();
        assert!(fresh.success);
        assert!(backend.get(&key("a"), Consistency::Default).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recursive_delete_clears_prefix() {
        let backend = MemoryBackend::new();
        for k in ["app/a", "app/b", "other"] {
            backend.put(&key(k), b"v".to_vec(), PutOptions::new()).await.unwrap();
        }
        backend
            .delete(&key("app/"), DeleteOptions::new().with_recurse())
            .await
            .unwrap();
        assert!(backend.list(&key("app/"), Consistency::Default).await.unwrap().is_empty());
        assert!(backend.get(&key("other"), Consistency::Default).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recursive_delete_rejects_cas() {
        let backend = MemoryBackend::new();
        let err = backend
            .delete(&key("app/"), DeleteOptions::new().with_recurse().with_cas(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_transaction_applies_atomically() {
        let backend = MemoryBackend::new();
        let result = backend
            .transaction(vec![
                TxnOp::set(key("a"), b"1".to_vec()),
                TxnOp::set(key("b"), b"2".to_vec()),
            ])
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.results.len(), 2);

        // Both writes share one commit index.
        let a = backend.get(&key("a"), Consistency::Default).await.unwrap().unwrap();
        let b = backend.get(&key("b"), Consistency::Default).await.unwrap().unwrap();
        assert_eq!(a.modify_index, b.modify_index);
    }

    #[tokio::test]
    async fn test_transaction_aborts_on_failed_guard() {
        let backend = MemoryBackend::new();
        backend.put(&key("existing"), b"1".to_vec(), PutOptions::new()).await.unwrap();

        let result = backend
            .transaction(vec![
                TxnOp::set(key("fresh"), b"2".to_vec()),
                TxnOp::set_cas(key("existing"), b"3".to_vec(), 999),
            ])
            .await
            .unwrap();
        assert!(!result.success);
        assert!(!result.results[0].success);
        assert!(!result.results[1].success);
        assert!(result.results[1]
            .message
            .as_deref()
            .unwrap()
            .contains("cas index mismatch"));

        // Nothing applied.
        assert!(backend.get(&key("fresh"), Consistency::Default).await.unwrap().is_none());
        let existing = backend.get(&key("existing"), Consistency::Default).await.unwrap().unwrap();
        assert_eq!(existing.value, b"1");
    }

    #[tokio::test]
    async fn test_transaction_rejects_cross_tenant() {
        let backend = MemoryBackend::new();
        let err = backend
            .transaction(vec![
                TxnOp::set("keel/tenants/acme/a", b"1".to_vec()),
                TxnOp::set("keel/tenants/globex/a", b"2".to_vec()),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CrossTenantTransaction { .. }));
    }

    #[tokio::test]
    async fn test_watch_receives_puts_and_deletes() {
        let backend = MemoryBackend::new();
        let recorder = Recorder::new();
        let subscription = backend
            .watch_prefix(&key("app/"), recorder.clone())
            .await
            .unwrap();

        backend.put(&key("app/a"), b"1".to_vec(), PutOptions::new()).await.unwrap();
        backend.put(&key("other"), b"x".to_vec(), PutOptions::new()).await.unwrap();
        backend.delete(&key("app/a"), DeleteOptions::new()).await.unwrap();

        let events = recorder.wait_for(2).await;
        assert!(matches!(&events[0], WatchEvent::Put(e) if e.key == key("app/a")));
        assert!(matches!(&events[1], WatchEvent::Delete { key: k, .. } if *k == key("app/a")));

        subscription.cancel().await;
    }

    #[tokio::test]
    async fn test_watch_does_not_replay_history() {
        let backend = MemoryBackend::new();
        backend.put(&key("app/a"), b"old".to_vec(), PutOptions::new()).await.unwrap();

        let recorder = Recorder::new();
        let _subscription = backend
            .watch_prefix(&key("app/"), recorder.clone())
            .await
            .unwrap();

        backend.put(&key("app/b"), b"new".to_vec(), PutOptions::new()).await.unwrap();
        let events = recorder.wait_for(1).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key(), key("app/b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_blocks_second_holder_until_expiry() {
        let backend = MemoryBackend::new();
        let token = backend
            .acquire_lock(&key("leader"), b"node-1".to_vec(), Duration::from_secs(1))
            .await
            .unwrap()
            .expect("first acquire should win");

        let contender = backend
            .acquire_lock(&key("leader"), b"node-2".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(contender.is_none());

        // Let the session lapse.
        tokio::time::sleep(Duration::from_secs(2)).await;

        let contender = backend
            .acquire_lock(&key("leader"), b"node-2".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(contender.is_some());

        // The original token is dead now.
        assert!(!backend.renew_lock(&token).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_lock() {
        let backend = MemoryBackend::new();
        let token = backend
            .acquire_lock(&key("leader"), b"node-1".to_vec(), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(600)).await;
            assert!(backend.renew_lock(&token).await.unwrap());
        }
        assert!(backend.get(&key("leader"), Consistency::Default).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_deletes_lock_entry() {
        let backend = MemoryBackend::new();
        let token = backend
            .acquire_lock(&key("leader"), b"node-1".to_vec(), Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        assert!(backend.release_lock(&token).await.unwrap());
        assert!(backend.get(&key("leader"), Consistency::Default).await.unwrap().is_none());
        // Double release reports not held.
        assert!(!backend.release_lock(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_ephemeral_refused_while_held() {
        let backend = MemoryBackend::new();
        let first = backend
            .put_ephemeral(&key("presence/node-1"), b"up".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = backend
            .put_ephemeral(&key("presence/node-1"), b"up".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ephemeral_entry_expires() {
        let backend = MemoryBackend::new();
        backend
            .put_ephemeral(&key("presence/node-1"), b"up".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(backend
            .get(&key("presence/node-1"), Consistency::Default)
            .await
            .unwrap()
            .is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(backend
            .get(&key("presence/node-1"), Consistency::Default)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_emits_delete_event() {
        let backend = MemoryBackend::new();
        let recorder = Recorder::new();
        let _subscription = backend
            .watch_prefix(&key("presence/"), recorder.clone())
            .await
            .unwrap();

        backend
            .put_ephemeral(&key("presence/node-1"), b"up".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let events = recorder.wait_for(2).await;
        assert!(matches!(&events[0], WatchEvent::Put(_)));
        assert!(
            matches!(&events[1], WatchEvent::Delete { key: k, .. } if *k == key("presence/node-1"))
        );
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.put("", b"v".to_vec(), PutOptions::new()).await,
            Err(StoreError::InvalidArgument { .. })
        ));
        assert!(matches!(
            backend.get("", Consistency::Default).await,
            Err(StoreError::InvalidArgument { .. })
        ));
    }
}
