//! etcd v3 backend adapter for keel.
//!
//! Implements [`keel_store::StoreBackend`] against an etcd cluster over
//! gRPC: guarded writes through transactions on `mod_revision`,
//! lease-backed locks and ephemeral entries, and prefix watches on
//! etcd's native watch stream.
//!
//! ```no_run
//! use keel_etcd::{EtcdBackend, EtcdConfig};
//! use keel_store::Store;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), keel_core::KeelError> {
//! let backend = EtcdBackend::new(EtcdConfig::from_env())?;
//! let store = Store::new(Arc::new(backend));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod pb;
mod rpc;
mod watch;

pub use client::EtcdBackend;
pub use config::EtcdConfig;
