//! Store layer for keel: the backend contract, the tenant-scoped
//! orchestrator, and the in-memory reference backend.
//!
//! # Architecture
//!
//! - [`backend`] - the [`StoreBackend`] trait every adapter implements,
//!   plus the [`WatchHandler`] callback contract
//! - [`store`] - the [`Store`] orchestrator: tenant scoping, atomic
//!   transactions, structured lists
//! - [`list`] - the structured list document model
//! - [`memory`] - single-process [`MemoryBackend`] with full lock,
//!   session, and watch semantics
//! - [`watch`] - the [`WatchSubscription`] lifecycle handle
//!
//! Networked adapters live in their own crates (`keel-consul`,
//! `keel-etcd`) so their client stacks stay out of consumers that only
//! need the in-memory backend.

pub mod backend;
pub mod list;
pub mod memory;
pub mod store;
pub mod watch;

// Backend contract
pub use backend::{StoreBackend, StoreResult, WatchHandler};

// Orchestrator
pub use store::{ListWriteResult, Store, StoreTxnOp};

// Structured lists
pub use list::{ListDocument, ListItem, ListManifest, ListUpdate, LIST_KIND};

// Backends and watches
pub use memory::MemoryBackend;
pub use watch::WatchSubscription;
