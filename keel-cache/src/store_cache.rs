//! Cached front for the store orchestrator.
//!
//! [`CachedStore`] puts two named caches in front of [`Store`]:
//! `store-entries` for single entries and `store-lists` for structured
//! list documents. Reads go through [`NamedCache::get_with`] with the
//! orchestrator as the loader; `Consistency::Consistent` reads bypass
//! the caches entirely. Writes invalidate the affected derived keys
//! *before* delegating, so a reader racing the write re-loads from the
//! store instead of serving the overwritten value. Recursive deletes
//! and transactions clear coarsely where derived keys cannot be
//! enumerated.
//!
//! Locks, watches, and health checks are not cached; reach them through
//! [`store`](CachedStore::store).

use crate::delegating::DelegatingCacheManager;
use crate::keys::KeyGenerator;
use crate::named::NamedCache;
use keel_core::{
    Consistency, DeleteOptions, DeleteResult, KeelResult, KvEntry, PutOptions, StorePath, TenantId,
    TxnResult, WriteResult,
};
use keel_store::list::{ITEMS_SEGMENT, MANIFEST_SEGMENT};
use keel_store::{ListDocument, ListUpdate, ListWriteResult, Store, StoreTxnOp};
use std::sync::Arc;
use tracing::warn;

/// Cache holding single entries.
pub const ENTRY_CACHE: &str = "store-entries";

/// Cache holding assembled list documents.
pub const LIST_CACHE: &str = "store-lists";

/// Store orchestrator with read-through caching.
#[derive(Clone)]
pub struct CachedStore {
    store: Store,
    caches: Arc<DelegatingCacheManager>,
    keys: KeyGenerator,
}

impl std::fmt::Debug for CachedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStore")
            .field("provider", &self.caches.provider())
            .finish_non_exhaustive()
    }
}

impl CachedStore {
    pub fn new(store: Store, caches: Arc<DelegatingCacheManager>) -> Self {
        let keys = KeyGenerator::new(caches.application());
        CachedStore {
            store,
            caches,
            keys,
        }
    }

    /// The uncached orchestrator, for locks, watches, and health.
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn caches(&self) -> &Arc<DelegatingCacheManager> {
        &self.caches
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Entry at `path`, served from the entry cache unless the caller
    /// asks for a consistent read.
    pub async fn get_entry(
        &self,
        tenant: &TenantId,
        path: &StorePath,
        consistency: Consistency,
    ) -> KeelResult<Option<KvEntry>> {
        if consistency == Consistency::Consistent {
            return self.store.get(tenant, path, consistency).await;
        }
        let cache = self.caches.cache(ENTRY_CACHE);
        let key = self.entry_key(&cache, tenant, path);
        cache
            .get_with(&key, || self.store.get(tenant, path, consistency))
            .await
    }

    /// List document at `base`, served from the list cache unless the
    /// caller asks for a consistent read.
    pub async fn get_list(
        &self,
        tenant: &TenantId,
        base: &StorePath,
        consistency: Consistency,
    ) -> KeelResult<Option<ListDocument>> {
        if consistency == Consistency::Consistent {
            return self.store.get_list(tenant, base, consistency).await;
        }
        let cache = self.caches.cache(LIST_CACHE);
        let key = self.list_key(&cache, tenant, base);
        cache
            .get_with(&key, || self.store.get_list(tenant, base, consistency))
            .await
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    pub async fn put_entry(
        &self,
        tenant: &TenantId,
        path: &StorePath,
        value: Vec<u8>,
        options: PutOptions,
    ) -> KeelResult<WriteResult> {
        self.invalidate_entry(tenant, path).await;
        self.store.put(tenant, path, value, options).await
    }

    pub async fn delete_entry(
        &self,
        tenant: &TenantId,
        path: &StorePath,
        options: DeleteOptions,
    ) -> KeelResult<DeleteResult> {
        if options.recurse {
            // Keys under the prefix cannot be enumerated from here.
            self.clear_cache(ENTRY_CACHE).await;
            self.clear_cache(LIST_CACHE).await;
        } else {
            self.invalidate_entry(tenant, path).await;
        }
        self.store.delete(tenant, path, options).await
    }

    /// Apply tenant-relative operations atomically. Entry keys are
    /// invalidated per op; the list cache is cleared coarsely, since a
    /// transaction may rewrite list internals under any base.
    pub async fn execute_transaction(
        &self,
        tenant: &TenantId,
        ops: Vec<StoreTxnOp>,
    ) -> KeelResult<TxnResult> {
        let entries = self.caches.cache(ENTRY_CACHE);
        for op in &ops {
            let key = self.entry_key(&entries, tenant, op.path());
            Self::evict_quietly(&entries, &key).await;
        }
        self.clear_cache(LIST_CACHE).await;
        self.store.execute_transaction(tenant, ops).await
    }

    pub async fn put_list(
        &self,
        tenant: &TenantId,
        base: &StorePath,
        update: ListUpdate,
    ) -> KeelResult<ListWriteResult> {
        update.validate()?;
        self.invalidate_list_update(tenant, base, &update).await?;
        self.store.put_list(tenant, base, update).await
    }

    pub async fn delete_list(&self, tenant: &TenantId, base: &StorePath) -> KeelResult<DeleteResult> {
        let lists = self.caches.cache(LIST_CACHE);
        let key = self.list_key(&lists, tenant, base);
        Self::evict_quietly(&lists, &key).await;
        // The manifest and every item fall to the internal sweep; their
        // entry-cache keys cannot be enumerated without reading.
        self.clear_cache(ENTRY_CACHE).await;
        self.store.delete_list(tenant, base).await
    }

    // ========================================================================
    // DERIVED KEYS & INVALIDATION
    // ========================================================================

    fn entry_key(&self, cache: &NamedCache, tenant: &TenantId, path: &StorePath) -> String {
        self.keys.key(
            ENTRY_CACHE,
            cache.spec().version,
            &[tenant.as_str(), path.as_str()],
        )
    }

    fn list_key(&self, cache: &NamedCache, tenant: &TenantId, base: &StorePath) -> String {
        self.keys.key(
            LIST_CACHE,
            cache.spec().version,
            &[tenant.as_str(), base.as_str()],
        )
    }

    async fn invalidate_entry(&self, tenant: &TenantId, path: &StorePath) {
        let cache = self.caches.cache(ENTRY_CACHE);
        let key = self.entry_key(&cache, tenant, path);
        Self::evict_quietly(&cache, &key).await;
    }

    /// Evict the list document plus the manifest and touched item
    /// entries, all derivable from the update itself. Items the update
    /// does not touch keep their entry-cache keys; the write does not
    /// change them.
    async fn invalidate_list_update(
        &self,
        tenant: &TenantId,
        base: &StorePath,
        update: &ListUpdate,
    ) -> KeelResult<()> {
        let lists = self.caches.cache(LIST_CACHE);
        let key = self.list_key(&lists, tenant, base);
        Self::evict_quietly(&lists, &key).await;

        let entries = self.caches.cache(ENTRY_CACHE);
        let manifest = base.join(MANIFEST_SEGMENT)?;
        let key = self.entry_key(&entries, tenant, &manifest);
        Self::evict_quietly(&entries, &key).await;

        let items = base.join(ITEMS_SEGMENT)?;
        let touched = update
            .upserts
            .iter()
            .map(|(id, _)| id)
            .chain(update.deletes.iter());
        for id in touched {
            let item = items.join(id)?;
            let key = self.entry_key(&entries, tenant, &item);
            Self::evict_quietly(&entries, &key).await;
        }
        Ok(())
    }

    /// Invalidation is best-effort: a failed eviction must not block
    /// the write, and the entry expires by TTL regardless.
    async fn evict_quietly(cache: &NamedCache, key: &str) {
        if let Err(err) = cache.evict(key).await {
            warn!(cache = %cache.name(), key, error = %err, "cache invalidation failed");
        }
    }

    async fn clear_cache(&self, name: &str) {
        let cache = self.caches.cache(name);
        if let Err(err) = cache.clear().await {
            warn!(cache = %name, error = %err, "cache clear failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use keel_store::MemoryBackend;
    use keel_test_utils::{path, tenant};

    async fn fixture() -> (CachedStore, Store) {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::new(backend);
        let caches = Arc::new(
            DelegatingCacheManager::new(CacheSettings::default())
                .await
                .unwrap(),
        );
        (CachedStore::new(store.clone(), caches), store)
    }

    #[tokio::test]
    async fn test_get_entry_caches_until_invalidated() {
        let (cached, store) = fixture().await;
        let acme = tenant("acme");
        let host = path("app/database/host");

        cached
            .put_entry(&acme, &host, b"db-1".to_vec(), PutOptions::new())
            .await
            .unwrap();
        let first = cached
            .get_entry(&acme, &host, Consistency::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.value, b"db-1");

        // A write that sidesteps the cached front leaves the cached
        // value in place.
        store
            .put(&acme, &host, b"db-2".to_vec(), PutOptions::new())
            .await
            .unwrap();
        let stale = cached
            .get_entry(&acme, &host, Consistency::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.value, b"db-1");

        // Consistent reads bypass the cache.
        let fresh = cached
            .get_entry(&acme, &host, Consistency::Consistent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.value, b"db-2");
    }

    #[tokio::test]
    async fn test_put_entry_invalidates_before_writing() {
        let (cached, _) = fixture().await;
        let acme = tenant("acme");
        let host = path("app/database/host");

        cached
            .put_entry(&acme, &host, b"db-1".to_vec(), PutOptions::new())
            .await
            .unwrap();
        // Populate the cache.
        cached
            .get_entry(&acme, &host, Consistency::Default)
            .await
            .unwrap();

        cached
            .put_entry(&acme, &host, b"db-2".to_vec(), PutOptions::new())
            .await
            .unwrap();
        let got = cached
            .get_entry(&acme, &host, Consistency::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.value, b"db-2");
    }

    #[tokio::test]
    async fn test_delete_entry_invalidates() {
        let (cached, _) = fixture().await;
        let acme = tenant("acme");
        let flag = path("app/flags/beta");

        cached
            .put_entry(&acme, &flag, b"on".to_vec(), PutOptions::new())
            .await
            .unwrap();
        cached
            .get_entry(&acme, &flag, Consistency::Default)
            .await
            .unwrap();

        cached
            .delete_entry(&acme, &flag, DeleteOptions::new())
            .await
            .unwrap();
        let got = cached
            .get_entry(&acme, &flag, Consistency::Default)
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_recursive_delete_clears_cached_entries() {
        let (cached, _) = fixture().await;
        let acme = tenant("acme");
        let a = path("app/settings/a");
        let b = path("app/settings/b");

        for (p, v) in [(&a, b"1".as_slice()), (&b, b"2".as_slice())] {
            cached
                .put_entry(&acme, p, v.to_vec(), PutOptions::new())
                .await
                .unwrap();
            cached.get_entry(&acme, p, Consistency::Default).await.unwrap();
        }

        cached
            .delete_entry(&acme, &path("app/settings"), DeleteOptions::new().with_recurse())
            .await
            .unwrap();

        for p in [&a, &b] {
            let got = cached.get_entry(&acme, p, Consistency::Default).await.unwrap();
            assert!(got.is_none());
        }
    }

    #[tokio::test]
    async fn test_get_list_caches_until_put_list() {
        let (cached, store) = fixture().await;
        let acme = tenant("acme");
        let widgets = path("cfg/widgets");

        cached
            .put_list(
                &acme,
                &widgets,
                ListUpdate::new()
                    .upsert("w1", b"one".to_vec())
                    .upsert("w2", b"two".to_vec()),
            )
            .await
            .unwrap();
        let doc = cached
            .get_list(&acme, &widgets, Consistency::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.items.len(), 2);

        // Grow the list behind the cached front; the cached document
        // stays as read.
        store
            .put_list(&acme, &widgets, ListUpdate::new().upsert("w3", b"three".to_vec()))
            .await
            .unwrap();
        let stale = cached
            .get_list(&acme, &widgets, Consistency::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.items.len(), 2);

        // A write through the front invalidates and the next read sees
        // all four.
        cached
            .put_list(&acme, &widgets, ListUpdate::new().upsert("w4", b"four".to_vec()))
            .await
            .unwrap();
        let fresh = cached
            .get_list(&acme, &widgets, Consistency::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.items.len(), 4);
        assert_eq!(fresh.manifest.order, vec!["w1", "w2", "w3", "w4"]);
    }

    #[tokio::test]
    async fn test_transaction_clears_the_list_cache() {
        let (cached, _) = fixture().await;
        let acme = tenant("acme");
        let widgets = path("cfg/widgets");

        cached
            .put_list(&acme, &widgets, ListUpdate::new().upsert("w1", b"old".to_vec()))
            .await
            .unwrap();
        cached
            .get_list(&acme, &widgets, Consistency::Default)
            .await
            .unwrap();

        // Rewrite the item entry directly, as a migration would.
        let result = cached
            .execute_transaction(
                &acme,
                vec![StoreTxnOp::set(path("cfg/widgets/items/w1"), b"new".to_vec())],
            )
            .await
            .unwrap();
        assert!(result.success);

        let doc = cached
            .get_list(&acme, &widgets, Consistency::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.items[0].value, b"new");
    }

    #[tokio::test]
    async fn test_delete_list_invalidates_the_document() {
        let (cached, _) = fixture().await;
        let acme = tenant("acme");
        let widgets = path("cfg/widgets");

        cached
            .put_list(&acme, &widgets, ListUpdate::new().upsert("w1", b"one".to_vec()))
            .await
            .unwrap();
        cached
            .get_list(&acme, &widgets, Consistency::Default)
            .await
            .unwrap();

        let result = cached.delete_list(&acme, &widgets).await.unwrap();
        assert!(result.success);

        let got = cached
            .get_list(&acme, &widgets, Consistency::Default)
            .await
            .unwrap();
        assert!(got.is_none());
    }
}
