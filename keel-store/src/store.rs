//! Store orchestrator.
//!
//! [`Store`] is the tenant-facing surface over a [`StoreBackend`]. Callers
//! speak tenant-relative [`StorePath`]s; the orchestrator maps them into
//! the tenant's namespace on the way down and maps returned keys back on
//! the way up, so no caller ever sees an absolute backend key with another
//! tenant's prefix in it.

use keel_core::{
    path, Consistency, DeleteOptions, DeleteResult, EphemeralEntry, KeelResult, KvEntry,
    LockToken, PutOptions, StoreError, StorePath, TenantId, TxnOp, TxnResult, WatchEvent,
    WriteResult,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{StoreBackend, WatchHandler};
use crate::list::{ListDocument, ListItem, ListManifest, ListUpdate, ITEMS_SEGMENT, MANIFEST_SEGMENT};
use crate::watch::WatchSubscription;

// ============================================================================
// TRANSACTION OPERATIONS
// ============================================================================

/// One tenant-relative operation inside an atomic transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTxnOp {
    Set {
        path: StorePath,
        value: Vec<u8>,
        flags: u64,
        cas: Option<u64>,
    },
    Delete {
        path: StorePath,
        cas: Option<u64>,
    },
}

impl StoreTxnOp {
    pub fn set(path: StorePath, value: Vec<u8>) -> Self {
        StoreTxnOp::Set {
            path,
            value,
            flags: 0,
            cas: None,
        }
    }

    pub fn set_cas(path: StorePath, value: Vec<u8>, index: u64) -> Self {
        StoreTxnOp::Set {
            path,
            value,
            flags: 0,
            cas: Some(index),
        }
    }

    pub fn delete(path: StorePath) -> Self {
        StoreTxnOp::Delete { path, cas: None }
    }

    pub fn delete_cas(path: StorePath, index: u64) -> Self {
        StoreTxnOp::Delete {
            path,
            cas: Some(index),
        }
    }

    pub fn path(&self) -> &StorePath {
        match self {
            StoreTxnOp::Set { path, .. } => path,
            StoreTxnOp::Delete { path, .. } => path,
        }
    }
}

/// Outcome of a list write. `success: false` means a concurrent writer
/// updated the manifest first; retry against the fresh document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListWriteResult {
    pub success: bool,
    pub manifest: Option<ListManifest>,
}

// ============================================================================
// WATCH HANDLER WRAPPING
// ============================================================================

/// Rewrites event keys into tenant-relative form before delegating.
struct TenantWatchHandler {
    tenant: TenantId,
    inner: Arc<dyn WatchHandler>,
}

impl WatchHandler for TenantWatchHandler {
    fn on_event(&self, event: WatchEvent) {
        let mapped = match event {
            WatchEvent::Put(mut entry) => match path::to_relative(&self.tenant, &entry.key) {
                Ok(rel) => {
                    entry.key = String::from(rel);
                    Some(WatchEvent::Put(entry))
                }
                Err(_) => None,
            },
            WatchEvent::Delete { key, modify_index } => {
                match path::to_relative(&self.tenant, &key) {
                    Ok(rel) => Some(WatchEvent::Delete {
                        key: String::from(rel),
                        modify_index,
                    }),
                    Err(_) => None,
                }
            }
        };
        match mapped {
            Some(event) => self.inner.on_event(event),
            None => warn!(
                tenant = %self.tenant,
                "dropping watch event outside the tenant namespace"
            ),
        }
    }

    fn on_error(&self, error: &StoreError) {
        self.inner.on_error(error);
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Tenant-scoped orchestrator over one backend.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StoreBackend>,
}

impl Store {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Store { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn require_writable(path: &StorePath) -> Result<(), StoreError> {
        if path.is_root() {
            return Err(StoreError::invalid_argument(
                "path must not be the namespace root",
            ));
        }
        Ok(())
    }

    /// Rewrite a backend entry's key into tenant-relative form.
    fn map_entry(tenant: &TenantId, mut entry: KvEntry) -> Option<KvEntry> {
        match path::to_relative(tenant, &entry.key) {
            Ok(rel) => {
                entry.key = String::from(rel);
                Some(entry)
            }
            Err(_) => {
                warn!(tenant = %tenant, key = %entry.key, "skipping entry outside the tenant namespace");
                None
            }
        }
    }

    // ========================================================================
    // KEY-VALUE OPERATIONS
    // ========================================================================

    pub async fn get(
        &self,
        tenant: &TenantId,
        path: &StorePath,
        consistency: Consistency,
    ) -> KeelResult<Option<KvEntry>> {
        let key = path::to_absolute(tenant, path);
        let entry = self.backend.get(&key, consistency).await?;
        Ok(entry.and_then(|e| Self::map_entry(tenant, e)))
    }

    /// Entries under `prefix`, keyed relative to the tenant, sorted.
    pub async fn list(
        &self,
        tenant: &TenantId,
        prefix: &StorePath,
        consistency: Consistency,
    ) -> KeelResult<Vec<KvEntry>> {
        let abs = path::to_absolute_prefix(tenant, prefix);
        let entries = self.backend.list(&abs, consistency).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| Self::map_entry(tenant, e))
            .collect())
    }

    /// Keys under `prefix` relative to the tenant. With a separator, keys
    /// fold into directory-style entries that keep their trailing
    /// separator, so the fold marker survives the relative mapping.
    pub async fn list_keys(
        &self,
        tenant: &TenantId,
        prefix: &StorePath,
        separator: Option<char>,
    ) -> KeelResult<Vec<String>> {
        let abs = path::to_absolute_prefix(tenant, prefix);
        let ns = path::namespace_prefix(tenant);
        let keys = self.backend.list_keys(&abs, separator).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| match key.strip_prefix(&ns) {
                Some(rest) => Some(rest.to_string()),
                None => {
                    warn!(tenant = %tenant, key = %key, "skipping key outside the tenant namespace");
                    None
                }
            })
            .collect())
    }

    pub async fn put(
        &self,
        tenant: &TenantId,
        path: &StorePath,
        value: Vec<u8>,
        options: PutOptions,
    ) -> KeelResult<WriteResult> {
        Self::require_writable(path)?;
        let key = path::to_absolute(tenant, path);
        Ok(self.backend.put(&key, value, options).await?)
    }

    /// Delete the entry at `path`, or with [`DeleteOptions::with_recurse`]
    /// everything under `path/`. A recursive delete does not touch the
    /// entry at `path` itself; prefixes denote folder contents.
    pub async fn delete(
        &self,
        tenant: &TenantId,
        path: &StorePath,
        options: DeleteOptions,
    ) -> KeelResult<DeleteResult> {
        if options.recurse {
            let prefix = path::to_absolute_prefix(tenant, path);
            Ok(self.backend.delete(&prefix, options).await?)
        } else {
            Self::require_writable(path)?;
            let key = path::to_absolute(tenant, path);
            Ok(self.backend.delete(&key, options).await?)
        }
    }

    /// Apply tenant-relative operations atomically.
    pub async fn execute_transaction(
        &self,
        tenant: &TenantId,
        ops: Vec<StoreTxnOp>,
    ) -> KeelResult<TxnResult> {
        if ops.is_empty() {
            return Err(StoreError::invalid_argument(
                "transaction requires at least one operation",
            )
            .into());
        }
        let mut backend_ops = Vec::with_capacity(ops.len());
        for op in ops {
            Self::require_writable(op.path())?;
            backend_ops.push(match op {
                StoreTxnOp::Set {
                    path,
                    value,
                    flags,
                    cas,
                } => TxnOp::Set {
                    key: path::to_absolute(tenant, &path),
                    value,
                    flags,
                    cas,
                },
                StoreTxnOp::Delete { path, cas } => TxnOp::Delete {
                    key: path::to_absolute(tenant, &path),
                    cas,
                },
            });
        }
        Ok(self.backend.transaction(backend_ops).await?)
    }

    // ========================================================================
    // WATCHES
    // ========================================================================

    /// Watch changes under `prefix`, delivering tenant-relative keys.
    pub async fn watch_prefix(
        &self,
        tenant: &TenantId,
        prefix: &StorePath,
        handler: Arc<dyn WatchHandler>,
    ) -> KeelResult<WatchSubscription> {
        let abs = path::to_absolute_prefix(tenant, prefix);
        let wrapped = Arc::new(TenantWatchHandler {
            tenant: tenant.clone(),
            inner: handler,
        });
        Ok(self.backend.watch_prefix(&abs, wrapped).await?)
    }

    // ========================================================================
    // LOCKS AND EPHEMERAL ENTRIES
    // ========================================================================

    pub async fn acquire_lock(
        &self,
        tenant: &TenantId,
        path: &StorePath,
        value: Vec<u8>,
        ttl: Duration,
    ) -> KeelResult<Option<LockToken>> {
        Self::require_writable(path)?;
        let key = path::to_absolute(tenant, path);
        Ok(self.backend.acquire_lock(&key, value, ttl).await?)
    }

    pub async fn renew_lock(&self, token: &LockToken) -> KeelResult<bool> {
        Ok(self.backend.renew_lock(token).await?)
    }

    pub async fn release_lock(&self, token: &LockToken) -> KeelResult<bool> {
        Ok(self.backend.release_lock(token).await?)
    }

    /// Write a presence-style entry that disappears when its session
    /// expires. `Ok(None)` means another live session holds the key.
    pub async fn put_ephemeral(
        &self,
        tenant: &TenantId,
        path: &StorePath,
        value: Vec<u8>,
        ttl: Duration,
    ) -> KeelResult<Option<EphemeralEntry>> {
        Self::require_writable(path)?;
        let key = path::to_absolute(tenant, path);
        Ok(self.backend.put_ephemeral(&key, value, ttl).await?)
    }

    pub async fn health_check(&self) -> KeelResult<()> {
        Ok(self.backend.health_check().await?)
    }

    // ========================================================================
    // STRUCTURED LISTS
    // ========================================================================

    /// Read the list at `base`.
    ///
    /// Returns `Ok(None)` when no manifest exists, and also when the
    /// document is corrupt: a manifest that fails verification, or a
    /// manifest naming an item with no entry. Corruption is logged and
    /// never surfaces as an error. Item entries the manifest does not
    /// name are ignored.
    pub async fn get_list(
        &self,
        tenant: &TenantId,
        base: &StorePath,
        consistency: Consistency,
    ) -> KeelResult<Option<ListDocument>> {
        let manifest_key = path::to_absolute(tenant, &base.join(MANIFEST_SEGMENT)?);
        let items_prefix = path::to_absolute_prefix(tenant, &base.join(ITEMS_SEGMENT)?);

        let Some(manifest_entry) = self.backend.get(&manifest_key, consistency).await? else {
            return Ok(None);
        };
        let manifest: ListManifest = match serde_json::from_slice(&manifest_entry.value) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(list = %base, error = %err, "list manifest is malformed; treating document as absent");
                return Ok(None);
            }
        };
        if !manifest.verify() {
            warn!(list = %base, "list manifest failed verification; treating document as absent");
            return Ok(None);
        }

        let entries = self.backend.list(&items_prefix, consistency).await?;
        let mut by_id: HashMap<String, KvEntry> = entries
            .into_iter()
            .filter_map(|entry| {
                let id = entry.key.strip_prefix(&items_prefix)?.to_string();
                // Nested keys under an item id are not items.
                if id.is_empty() || id.contains(keel_core::SEPARATOR) {
                    return None;
                }
                Some((id, entry))
            })
            .collect();

        let mut items = Vec::with_capacity(manifest.order.len());
        for id in &manifest.order {
            match by_id.remove(id) {
                Some(entry) => items.push(ListItem {
                    id: id.clone(),
                    value: entry.value,
                    modify_index: entry.modify_index,
                }),
                None => {
                    warn!(list = %base, item = %id, "list item missing; treating document as absent");
                    return Ok(None);
                }
            }
        }
        if !by_id.is_empty() {
            debug!(list = %base, count = by_id.len(), "ignoring item entries the manifest does not name");
        }

        Ok(Some(ListDocument { manifest, items }))
    }

    /// Apply `update` to the list at `base` in one atomic transaction.
    ///
    /// The new manifest write is guarded on the manifest version read
    /// here, so concurrent writers serialize: the loser gets
    /// `success: false` and nothing from its update applies.
    pub async fn put_list(
        &self,
        tenant: &TenantId,
        base: &StorePath,
        update: ListUpdate,
    ) -> KeelResult<ListWriteResult> {
        update.validate()?;
        let manifest_key = path::to_absolute(tenant, &base.join(MANIFEST_SEGMENT)?);
        let items_path = base.join(ITEMS_SEGMENT)?;

        let previous = self.backend.get(&manifest_key, Consistency::Default).await?;
        let (previous_manifest, guard) = match previous {
            None => (None, 0),
            Some(entry) => match serde_json::from_slice::<ListManifest>(&entry.value) {
                Ok(manifest) if manifest.verify() => (Some(manifest), entry.modify_index),
                _ => {
                    warn!(list = %base, "overwriting corrupt list manifest");
                    (None, entry.modify_index)
                }
            },
        };

        let deletes: HashSet<&str> = update.deletes.iter().map(String::as_str).collect();
        let mut order: Vec<String> = previous_manifest
            .as_ref()
            .map(|m| {
                m.order
                    .iter()
                    .filter(|id| !deletes.contains(id.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for (id, _) in &update.upserts {
            if !order.iter().any(|existing| existing == id) {
                order.push(id.clone());
            }
        }
        let version = previous_manifest.as_ref().map(|m| m.version + 1).unwrap_or(1);
        let metadata = match update.metadata {
            Some(metadata) => metadata,
            None => previous_manifest.map(|m| m.metadata).unwrap_or_default(),
        };
        let manifest = ListManifest::build(order, version, metadata);
        let manifest_bytes = serde_json::to_vec(&manifest)
            .map_err(|err| StoreError::protocol(format!("list manifest encoding failed: {err}")))?;

        let mut ops = Vec::with_capacity(update.upserts.len() + update.deletes.len() + 1);
        for (id, value) in update.upserts {
            let key = path::to_absolute(tenant, &items_path.join(&id)?);
            ops.push(TxnOp::set(key, value));
        }
        for id in &update.deletes {
            let key = path::to_absolute(tenant, &items_path.join(id)?);
            ops.push(TxnOp::delete(key));
        }
        ops.push(TxnOp::Set {
            key: manifest_key,
            value: manifest_bytes,
            flags: 0,
            cas: Some(guard),
        });

        let result = self.backend.transaction(ops).await?;
        if result.success {
            Ok(ListWriteResult {
                success: true,
                manifest: Some(manifest),
            })
        } else {
            debug!(list = %base, "list update lost a concurrent write race");
            Ok(ListWriteResult {
                success: false,
                manifest: None,
            })
        }
    }

    /// Delete the list at `base`: its manifest and every item it names,
    /// atomically, then sweep any stray item entries. Returns
    /// `success: false` when a concurrent writer updated the manifest
    /// first.
    pub async fn delete_list(
        &self,
        tenant: &TenantId,
        base: &StorePath,
    ) -> KeelResult<DeleteResult> {
        let manifest_key = path::to_absolute(tenant, &base.join(MANIFEST_SEGMENT)?);
        let items_path = base.join(ITEMS_SEGMENT)?;
        let items_prefix = path::to_absolute_prefix(tenant, &items_path);

        if let Some(entry) = self.backend.get(&manifest_key, Consistency::Default).await? {
            let mut ops = vec![TxnOp::delete_cas(manifest_key, entry.modify_index)];
            if let Ok(manifest) = serde_json::from_slice::<ListManifest>(&entry.value) {
                for id in &manifest.order {
                    // Ids from a corrupt manifest may not be valid segments.
                    if let Ok(item) = items_path.join(id) {
                        ops.push(TxnOp::delete(path::to_absolute(tenant, &item)));
                    }
                }
            }
            let result = self.backend.transaction(ops).await?;
            if !result.success {
                return Ok(DeleteResult { success: false });
            }
        }

        // Stray items are unreachable once the manifest is gone; this
        // sweep just reclaims their keys.
        self.backend
            .delete(&items_prefix, DeleteOptions::new().with_recurse())
            .await?;
        Ok(DeleteResult { success: true })
    }
}
