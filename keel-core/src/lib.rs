//! Core types for keel, a multi-tenant configuration control plane.
//!
//! This crate holds everything the other keel crates share: the error
//! taxonomy, tenant identifiers, the tenant path policy, and the
//! key-value data model spoken between the store orchestrator and the
//! backend adapters.
//!
//! # Architecture
//!
//! - [`error`] - layered error enums (`PathError`, `StoreError`,
//!   `CacheError`, `ConfigError`) unified under [`KeelError`]
//! - [`tenant`] - validated tenant identifiers
//! - [`path`] - path normalization and the tenant namespace mapping
//! - [`kv`] - entries, write options, transactions, locks, watch events
//!
//! # Key Types
//!
//! - [`TenantId`] - lowercase slug naming a tenant
//! - [`StorePath`] - normalized tenant-relative path
//! - [`KvEntry`] - a stored value with its version metadata
//! - [`KeelError`] / [`KeelResult`] - unified error handling

pub mod error;
pub mod kv;
pub mod path;
pub mod tenant;

// Error taxonomy
pub use error::{CacheError, ConfigError, KeelError, KeelResult, PathError, StoreError};

// Tenancy and paths
pub use path::{StorePath, MAX_PATH_LEN, SEPARATOR};
pub use tenant::{TenantId, MAX_TENANT_LEN};

// Key-value model
pub use kv::{
    Consistency, DeleteOptions, DeleteResult, EphemeralEntry, KvEntry, LockToken, PutOptions,
    TxnOp, TxnOpResult, TxnResult, WatchEvent, WriteResult,
};
