//! Consul backend adapter for keel.
//!
//! Implements [`keel_store::StoreBackend`] against a Consul agent's HTTP
//! API: transactional writes through `/v1/txn`, session-backed locks and
//! ephemeral entries, and prefix watches built on blocking queries.
//!
//! ```no_run
//! use keel_consul::{ConsulBackend, ConsulConfig};
//! use keel_store::Store;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), keel_core::KeelError> {
//! let backend = ConsulBackend::new(ConsulConfig::from_env())?;
//! let store = Store::new(Arc::new(backend));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
mod watch;
pub mod wire;

pub use client::ConsulBackend;
pub use config::ConsulConfig;
