//! Consul HTTP API wire types.
//!
//! Shapes follow the agent's JSON: PascalCase fields, base64 values.
//! Everything the adapter sends or parses lives here so the client code
//! stays free of serialization detail.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use keel_core::{KvEntry, StoreError, TxnOp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Consul rejects transactions beyond this many operations.
pub const MAX_TXN_OPS: usize = 64;

/// Session TTL bounds enforced by the agent.
pub const MIN_SESSION_TTL: Duration = Duration::from_secs(10);
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(86_400);

pub const VERB_SET: &str = "set";
pub const VERB_CAS: &str = "cas";
pub const VERB_DELETE: &str = "delete";
pub const VERB_DELETE_CAS: &str = "delete-cas";
pub const VERB_DELETE_TREE: &str = "delete-tree";

// ============================================================================
// KV READS
// ============================================================================

/// One element of a `GET /v1/kv/<key>` response array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvPair {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub lock_index: u64,
    #[serde(default)]
    pub session: Option<String>,
}

impl KvPair {
    /// Decode into the shared entry model. A null value is an empty
    /// byte string.
    pub fn into_entry(self) -> Result<KvEntry, StoreError> {
        let value = match self.value {
            None => Vec::new(),
            Some(encoded) => STANDARD.decode(encoded.as_bytes()).map_err(|err| {
                StoreError::protocol(format!("invalid base64 value for key {}: {err}", self.key))
            })?,
        };
        Ok(KvEntry {
            key: self.key,
            value,
            flags: self.flags,
            create_index: self.create_index,
            modify_index: self.modify_index,
        })
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// One `{"KV": {...}}` envelope in a `PUT /v1/txn` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnEnvelope {
    #[serde(rename = "KV")]
    pub kv: TxnKvOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TxnKvOp {
    pub verb: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TxnResponse {
    #[serde(default)]
    pub results: Option<Vec<TxnResultEnvelope>>,
    #[serde(default)]
    pub errors: Option<Vec<TxnOpError>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnResultEnvelope {
    #[serde(rename = "KV", default)]
    pub kv: Option<KvPair>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TxnOpError {
    pub op_index: usize,
    pub what: String,
}

/// Map shared transaction operations onto Consul txn verbs.
///
/// The compare-and-set index convention carries over unchanged: Consul's
/// `cas` verb with index 0 means must-not-exist, exactly like
/// [`keel_core::PutOptions`].
pub fn txn_ops_to_wire(ops: &[TxnOp]) -> Vec<TxnEnvelope> {
    ops.iter()
        .map(|op| {
            let kv = match op {
                TxnOp::Set {
                    key,
                    value,
                    flags,
                    cas,
                } => TxnKvOp {
                    verb: match cas {
                        None => VERB_SET.to_string(),
                        Some(_) => VERB_CAS.to_string(),
                    },
                    key: key.clone(),
                    value: Some(STANDARD.encode(value)),
                    flags: Some(*flags),
                    index: *cas,
                },
                TxnOp::Delete { key, cas } => TxnKvOp {
                    verb: match cas {
                        None => VERB_DELETE.to_string(),
                        Some(_) => VERB_DELETE_CAS.to_string(),
                    },
                    key: key.clone(),
                    value: None,
                    flags: None,
                    index: *cas,
                },
            };
            TxnEnvelope { kv }
        })
        .collect()
}

// ============================================================================
// SESSIONS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SessionCreateRequest {
    #[serde(rename = "TTL")]
    pub ttl: String,
    #[serde(rename = "Behavior")]
    pub behavior: String,
}

impl SessionCreateRequest {
    /// Sessions always use delete behavior so lock and ephemeral entries
    /// vanish when their session expires.
    pub fn delete_on_expiry(ttl: Duration) -> Self {
        SessionCreateRequest {
            ttl: format_ttl(clamp_session_ttl(ttl)),
            behavior: "delete".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionCreateResponse {
    #[serde(rename = "ID")]
    pub id: String,
}

/// Clamp a requested TTL into the range the agent accepts.
pub fn clamp_session_ttl(ttl: Duration) -> Duration {
    ttl.clamp(MIN_SESSION_TTL, MAX_SESSION_TTL)
}

pub fn format_ttl(ttl: Duration) -> String {
    format!("{}s", ttl.as_secs())
}

// ============================================================================
// TESTS
// ============================================================================
