//! Shared key-value data model.
//!
//! These types form the contract between the store orchestrator and the
//! backend adapters. Keys at this level are absolute backend keys; the
//! orchestrator owns the mapping to tenant-relative paths.

use crate::error::StoreError;
use crate::path;
use serde::{Deserialize, Serialize};

// ============================================================================
// ENTRIES
// ============================================================================

/// A single stored key-value pair with its version metadata.
///
/// `modify_index` is the backend's monotonically increasing version for the
/// key and is the token used for compare-and-set writes. `create_index` is
/// the index at which the key was first created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub flags: u64,
    pub create_index: u64,
    pub modify_index: u64,
}

/// Read consistency requested for a get or list.
///
/// Backends without a matching mode treat unsupported levels as
/// `Default`; only the Consul adapter distinguishes all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    #[default]
    Default,
    /// Linearizable read, served by the leader.
    Consistent,
    /// Possibly stale read, served by any replica.
    Stale,
}

// ============================================================================
// WRITE OPTIONS AND RESULTS
// ============================================================================

/// Options for a single-key put.
///
/// `cas` semantics: `None` writes unconditionally, `Some(0)` requires the
/// key to not exist, `Some(i)` requires the key's current modify index to
/// equal `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PutOptions {
    pub cas: Option<u64>,
    pub flags: u64,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cas(mut self, index: u64) -> Self {
        self.cas = Some(index);
        self
    }

    /// Require that the key does not yet exist.
    pub fn must_not_exist(mut self) -> Self {
        self.cas = Some(0);
        self
    }

    pub fn with_flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }
}

/// Options for a delete. `recurse` deletes the whole prefix and cannot be
/// combined with `cas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteOptions {
    pub recurse: bool,
    pub cas: Option<u64>,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recurse(mut self) -> Self {
        self.recurse = true;
        self
    }

    pub fn with_cas(mut self, index: u64) -> Self {
        self.cas = Some(index);
        self
    }
}

/// Outcome of a put. A failed compare-and-set reports `success: false`
/// rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub success: bool,
    /// Modify index assigned by the write. Zero when the write did not
    /// apply.
    pub modify_index: u64,
}

/// Outcome of a delete. Deleting an absent key succeeds; only a failed
/// compare-and-set reports `success: false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub success: bool,
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// One operation inside an atomic transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Set {
        key: String,
        value: Vec<u8>,
        flags: u64,
        cas: Option<u64>,
    },
    Delete {
        key: String,
        cas: Option<u64>,
    },
}

impl TxnOp {
    pub fn set(key: impl Into<String>, value: Vec<u8>) -> Self {
        TxnOp::Set {
            key: key.into(),
            value,
            flags: 0,
            cas: None,
        }
    }

    pub fn set_cas(key: impl Into<String>, value: Vec<u8>, index: u64) -> Self {
        TxnOp::Set {
            key: key.into(),
            value,
            flags: 0,
            cas: Some(index),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete {
            key: key.into(),
            cas: None,
        }
    }

    pub fn delete_cas(key: impl Into<String>, index: u64) -> Self {
        TxnOp::Delete {
            key: key.into(),
            cas: Some(index),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            TxnOp::Set { key, .. } => key,
            TxnOp::Delete { key, .. } => key,
        }
    }

    pub fn cas(&self) -> Option<u64> {
        match self {
            TxnOp::Set { cas, .. } => *cas,
            TxnOp::Delete { cas, .. } => *cas,
        }
    }
}

/// Per-operation outcome inside a transaction result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnOpResult {
    pub success: bool,
    /// Modify index assigned to a successful set. `None` for deletes and
    /// failed operations.
    pub modify_index: Option<u64>,
    /// Backend-reported reason when the operation failed.
    pub message: Option<String>,
}

impl TxnOpResult {
    pub fn applied(modify_index: Option<u64>) -> Self {
        TxnOpResult {
            success: true,
            modify_index,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        TxnOpResult {
            success: false,
            modify_index: None,
            message: Some(message.into()),
        }
    }
}

/// Outcome of an atomic transaction. Either every operation applied
/// (`success: true`) or none did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResult {
    pub success: bool,
    pub results: Vec<TxnOpResult>,
}

impl TxnResult {
    pub fn applied(results: Vec<TxnOpResult>) -> Self {
        TxnResult {
            success: true,
            results,
        }
    }

    pub fn aborted(results: Vec<TxnOpResult>) -> Self {
        TxnResult {
            success: false,
            results,
        }
    }
}

/// Validate a transaction before it reaches a backend.
///
/// Rejects empty transactions and transactions whose keys span more than
/// one tenant namespace. Keys outside the system namespace entirely are
/// invalid arguments.
pub fn ensure_single_tenant(ops: &[TxnOp]) -> Result<(), StoreError> {
    if ops.is_empty() {
        return Err(StoreError::invalid_argument(
            "transaction requires at least one operation",
        ));
    }
    let mut first: Option<&str> = None;
    for op in ops {
        let Some(tenant) = path::tenant_of(op.key()) else {
            return Err(StoreError::invalid_argument(format!(
                "transaction key outside tenant namespace: {}",
                op.key()
            )));
        };
        match first {
            None => first = Some(tenant),
            Some(seen) if seen != tenant => {
                return Err(StoreError::CrossTenantTransaction {
                    first: seen.to_string(),
                    second: tenant.to_string(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

// ============================================================================
// LOCKS AND EPHEMERAL ENTRIES
// ============================================================================

/// Proof of lock ownership. Renewal and release require the token; the
/// session id ties the lock to its backend session or lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub session: String,
}

/// Result of writing an ephemeral key. The entry disappears when its
/// session expires without renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralEntry {
    pub session: String,
    pub modify_index: u64,
}

// ============================================================================
// WATCH EVENTS
// ============================================================================

/// A change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KvEntry),
    Delete { key: String, modify_index: u64 },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(entry) => &entry.key,
            WatchEvent::Delete { key, .. } => key,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
