//! etcd backend adapter.
//!
//! Maps the [`StoreBackend`] contract onto etcd's revision model. A cas
//! of zero becomes a `create_revision == 0` guard and a nonzero cas
//! pins the key's `mod_revision`, so the modify index exposed upstream
//! is etcd's per-key modify revision. Locks and ephemeral entries ride
//! on leases; revoking a lease deletes every key attached to it, which
//! plays the role of Consul's delete-behavior sessions.

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use keel_core::{
    kv::ensure_single_tenant, path::fold_keys, Consistency, DeleteOptions, DeleteResult,
    EphemeralEntry, KvEntry, LockToken, PutOptions, StoreError, TxnOp, TxnOpResult, TxnResult,
    WriteResult,
};
use keel_store::{StoreBackend, StoreResult, WatchHandler, WatchSubscription};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Endpoint;
use tonic::{Code, Status};
use tracing::debug;

use crate::config::EtcdConfig;
use crate::pb;
use crate::rpc::{rpc_error, KvClient, LeaseClient, MaintenanceClient, WatchClient};
use crate::watch;

// ============================================================================
// SHARED CLIENT STATE
// ============================================================================

/// Service clients plus configuration, shared with watch tasks. The
/// clients wrap one multiplexed channel; cloning one is cheap.
pub(crate) struct EtcdShared {
    pub(crate) kv: KvClient,
    pub(crate) watch: WatchClient,
    pub(crate) lease: LeaseClient,
    pub(crate) maintenance: MaintenanceClient,
    pub(crate) config: EtcdConfig,
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

fn flags_unsupported() -> StoreError {
    StoreError::Unsupported {
        backend: "etcd".to_string(),
        operation: "put with flags".to_string(),
    }
}

/// etcd has no per-key flags word; reject writes that ask for one.
fn ensure_no_flags(ops: &[TxnOp]) -> StoreResult<()> {
    for op in ops {
        if let TxnOp::Set { flags, .. } = op {
            if *flags != 0 {
                return Err(flags_unsupported());
            }
        }
    }
    Ok(())
}

/// Convert a wire pair into a store entry. etcd has no flags word, so
/// entries always read back zero flags.
pub(crate) fn kv_to_entry(kv: pb::KeyValue) -> StoreResult<KvEntry> {
    let key = String::from_utf8(kv.key)
        .map_err(|_| StoreError::protocol("etcd returned a non-utf8 key"))?;
    Ok(KvEntry {
        key,
        value: kv.value,
        flags: 0,
        create_index: kv.create_revision as u64,
        modify_index: kv.mod_revision as u64,
    })
}

/// Range bounds covering every key under `prefix`. An empty prefix
/// covers the whole keyspace.
pub(crate) fn prefix_bounds(prefix: &str) -> (Vec<u8>, Vec<u8>) {
    if prefix.is_empty() {
        return (vec![0], vec![0]);
    }
    (
        prefix.as_bytes().to_vec(),
        pb::prefix_range_end(prefix.as_bytes()),
    )
}

/// Guard for a cas option: zero requires the key to be absent, anything
/// else pins its current modify revision.
fn cas_compare(key: &[u8], cas: u64) -> pb::Compare {
    let (target, target_union) = if cas == 0 {
        (
            pb::CompareTarget::Create,
            pb::compare::TargetUnion::CreateRevision(0),
        )
    } else {
        (
            pb::CompareTarget::Mod,
            pb::compare::TargetUnion::ModRevision(cas as i64),
        )
    };
    pb::Compare {
        result: pb::CompareResult::Equal as i32,
        target: target as i32,
        key: key.to_vec(),
        target_union: Some(target_union),
    }
}

/// Guard that holds while no lease owns the key, absent keys included.
/// This is the acquire semantics of a session entry nobody else holds.
fn unheld_compare(key: &[u8]) -> pb::Compare {
    pb::Compare {
        result: pb::CompareResult::Equal as i32,
        target: pb::CompareTarget::Lease as i32,
        key: key.to_vec(),
        target_union: Some(pb::compare::TargetUnion::Lease(0)),
    }
}

fn put_op(key: &str, value: Vec<u8>, lease: i64) -> pb::RequestOp {
    pb::RequestOp {
        request: Some(pb::request_op::Request::RequestPut(pb::PutRequest {
            key: key.as_bytes().to_vec(),
            value,
            lease,
            prev_kv: false,
        })),
    }
}

fn delete_op(key: &str) -> pb::RequestOp {
    pb::RequestOp {
        request: Some(pb::request_op::Request::RequestDeleteRange(
            pb::DeleteRangeRequest {
                key: key.as_bytes().to_vec(),
                range_end: Vec::new(),
                prev_kv: false,
            },
        )),
    }
}

/// Build the wire transaction: one guard per cas-carrying operation and
/// every write on the success branch. Nothing runs on failure.
fn txn_request(ops: &[TxnOp]) -> pb::TxnRequest {
    let mut compare = Vec::new();
    let mut success = Vec::with_capacity(ops.len());
    for op in ops {
        if let Some(cas) = op.cas() {
            compare.push(cas_compare(op.key().as_bytes(), cas));
        }
        match op {
            TxnOp::Set { key, value, .. } => success.push(put_op(key, value.clone(), 0)),
            TxnOp::Delete { key, .. } => success.push(delete_op(key)),
        }
    }
    pb::TxnRequest {
        compare,
        success,
        failure: Vec::new(),
    }
}

/// Seconds for a lease grant, rounding subsecond remainders up. The
/// server may itself raise very small values to its minimum.
fn lease_ttl_secs(ttl: Duration) -> i64 {
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs += 1;
    }
    secs.max(1) as i64
}

fn header_revision(header: &Option<pb::ResponseHeader>) -> u64 {
    header.as_ref().map_or(0, |h| h.revision as u64)
}

/// Lease ids travel in tokens as decimal strings.
fn parse_lease(token: &LockToken) -> Option<i64> {
    match token.session.parse() {
        Ok(id) => Some(id),
        Err(_) => {
            debug!(session = %token.session, "lock token does not carry an etcd lease id");
            None
        }
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// [`StoreBackend`] over an etcd v3 cluster member.
pub struct EtcdBackend {
    shared: Arc<EtcdShared>,
}

impl EtcdBackend {
    pub fn new(config: EtcdConfig) -> Result<Self, keel_core::ConfigError> {
        config.validate()?;
        let endpoint = Endpoint::from_shared(config.endpoint.clone())
            .map_err(|e| keel_core::ConfigError::InvalidValue {
                field: "endpoint".to_string(),
                value: config.endpoint.clone(),
                reason: e.to_string(),
            })?
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(true);
        // Lazy channel: dialed on first use, redialed after failures.
        let channel = endpoint.connect_lazy();
        Ok(EtcdBackend {
            shared: Arc::new(EtcdShared {
                kv: KvClient::new(channel.clone()),
                watch: WatchClient::new(channel.clone()),
                lease: LeaseClient::new(channel.clone()),
                maintenance: MaintenanceClient::new(channel),
                config,
            }),
        })
    }

    pub fn from_env() -> Result<Self, keel_core::ConfigError> {
        EtcdBackend::new(EtcdConfig::from_env())
    }

    /// Run a unary rpc under the configured deadline.
    async fn call<T, F>(&self, rpc: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        match tokio::time::timeout(self.shared.config.request_timeout, rpc).await {
            Ok(result) => result,
            Err(_) => Err(Status::deadline_exceeded("request timed out")),
        }
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<i64> {
        let mut lease = self.shared.lease.clone();
        let request = pb::LeaseGrantRequest {
            ttl: lease_ttl_secs(ttl),
            id: 0,
        };
        let response = self
            .call(lease.lease_grant(request))
            .await
            .map_err(rpc_error)?;
        if !response.error.is_empty() {
            return Err(StoreError::protocol(format!(
                "etcd refused the lease grant: {}",
                response.error
            )));
        }
        Ok(response.id)
    }

    /// Best-effort lease teardown. Revoking also deletes any keys the
    /// lease still holds.
    async fn revoke_lease_quietly(&self, lease_id: i64) {
        let mut lease = self.shared.lease.clone();
        let request = pb::LeaseRevokeRequest { id: lease_id };
        if let Err(status) = self.call(lease.lease_revoke(request)).await {
            debug!(lease = lease_id, error = %status, "failed to revoke etcd lease");
        }
    }

    /// Grant a lease and attach it to `key` unless a live lease already
    /// holds the key. Returns the lease id and commit revision.
    async fn acquire_with_lease(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<Option<(i64, u64)>> {
        require_key(key)?;
        require_ttl(ttl)?;
        let lease_id = self.grant_lease(ttl).await?;
        let request = pb::TxnRequest {
            compare: vec![unheld_compare(key.as_bytes())],
            success: vec![put_op(key, value, lease_id)],
            failure: Vec::new(),
        };
        let mut kv = self.shared.kv.clone();
        let response = self.call(kv.txn(request)).await.map_err(rpc_error)?;
        if !response.succeeded {
            self.revoke_lease_quietly(lease_id).await;
            return Ok(None);
        }
        Ok(Some((lease_id, header_revision(&response.header))))
    }
}

impl fmt::Debug for EtcdBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdBackend")
            .field("endpoint", &self.shared.config.endpoint)
            .finish()
    }
}

#[async_trait]
impl StoreBackend for EtcdBackend {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn get(&self, key: &str, consistency: Consistency) -> StoreResult<Option<KvEntry>> {
        require_key(key)?;
        let request = pb::RangeRequest {
            key: key.as_bytes().to_vec(),
            serializable: matches!(consistency, Consistency::Stale),
            ..Default::default()
        };
        let mut kv = self.shared.kv.clone();
        let response = self.call(kv.range(request)).await.map_err(rpc_error)?;
        match response.kvs.into_iter().next() {
            Some(kv) => Ok(Some(kv_to_entry(kv)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, prefix: &str, consistency: Consistency) -> StoreResult<Vec<KvEntry>> {
        let (key, range_end) = prefix_bounds(prefix);
        let request = pb::RangeRequest {
            key,
            range_end,
            serializable: matches!(consistency, Consistency::Stale),
            ..Default::default()
        };
        let mut kv = self.shared.kv.clone();
        let response = self.call(kv.range(request)).await.map_err(rpc_error)?;
        // etcd returns pairs in ascending key order already.
        response.kvs.into_iter().map(kv_to_entry).collect()
    }

    async fn list_keys(&self, prefix: &str, separator: Option<char>) -> StoreResult<Vec<String>> {
        let (key, range_end) = prefix_bounds(prefix);
        let request = pb::RangeRequest {
            key,
            range_end,
            keys_only: true,
            ..Default::default()
        };
        let mut kv = self.shared.kv.clone();
        let response = self.call(kv.range(request)).await.map_err(rpc_error)?;
        let keys = response
            .kvs
            .into_iter()
            .map(|kv| {
                String::from_utf8(kv.key)
                    .map_err(|_| StoreError::protocol("etcd returned a non-utf8 key"))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        // No server-side separator folding; fold locally.
        match separator {
            Some(sep) => Ok(fold_keys(prefix, keys, sep)),
            None => Ok(keys),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        options: PutOptions,
    ) -> StoreResult<WriteResult> {
        require_key(key)?;
        if options.flags != 0 {
            return Err(flags_unsupported());
        }
        let mut kv = self.shared.kv.clone();
        match options.cas {
            None => {
                let request = pb::PutRequest {
                    key: key.as_bytes().to_vec(),
                    value,
                    lease: 0,
                    prev_kv: false,
                };
                let response = self.call(kv.put(request)).await.map_err(rpc_error)?;
                Ok(WriteResult {
                    success: true,
                    modify_index: header_revision(&response.header),
                })
            }
            Some(cas) => {
                let request = pb::TxnRequest {
                    compare: vec![cas_compare(key.as_bytes(), cas)],
                    success: vec![put_op(key, value, 0)],
                    failure: Vec::new(),
                };
                let response = self.call(kv.txn(request)).await.map_err(rpc_error)?;
                if response.succeeded {
                    Ok(WriteResult {
                        success: true,
                        modify_index: header_revision(&response.header),
                    })
                } else {
                    Ok(WriteResult {
                        success: false,
                        modify_index: 0,
                    })
                }
            }
        }
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> StoreResult<DeleteResult> {
        if options.recurse && options.cas.is_some() {
            return Err(StoreError::invalid_argument(
                "recursive delete cannot carry a cas guard",
            ));
        }
        let mut kv = self.shared.kv.clone();
        if options.recurse {
            let (key, range_end) = prefix_bounds(key);
            let request = pb::DeleteRangeRequest {
                key,
                range_end,
                prev_kv: false,
            };
            self.call(kv.delete_range(request)).await.map_err(rpc_error)?;
            return Ok(DeleteResult { success: true });
        }
        require_key(key)?;
        match options.cas {
            None => {
                let request = pb::DeleteRangeRequest {
                    key: key.as_bytes().to_vec(),
                    range_end: Vec::new(),
                    prev_kv: false,
                };
                self.call(kv.delete_range(request)).await.map_err(rpc_error)?;
                Ok(DeleteResult { success: true })
            }
            Some(cas) => {
                let request = pb::TxnRequest {
                    compare: vec![cas_compare(key.as_bytes(), cas)],
                    success: vec![delete_op(key)],
                    failure: Vec::new(),
                };
                let response = self.call(kv.txn(request)).await.map_err(rpc_error)?;
                Ok(DeleteResult {
                    success: response.succeeded,
                })
            }
        }
    }

    async fn transaction(&self, ops: Vec<TxnOp>) -> StoreResult<TxnResult> {
        ensure_single_tenant(&ops)?;
        ensure_no_flags(&ops)?;
        let request = txn_request(&ops);
        let mut kv = self.shared.kv.clone();
        let response = self.call(kv.txn(request)).await.map_err(rpc_error)?;
        if response.succeeded {
            // One transaction commits at one revision, so every set
            // shares it.
            let revision = header_revision(&response.header);
            Ok(TxnResult::applied(
                ops.iter()
                    .map(|op| match op {
                        TxnOp::Set { .. } => TxnOpResult::applied(Some(revision)),
                        TxnOp::Delete { .. } => TxnOpResult::applied(None),
                    })
                    .collect(),
            ))
        } else {
            // etcd reports only that a guard failed, not which one.
            Ok(TxnResult::aborted(
                ops.iter()
                    .map(|_| TxnOpResult::failed("transaction aborted"))
                    .collect(),
            ))
        }
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        handler: Arc<dyn WatchHandler>,
    ) -> StoreResult<WatchSubscription> {
        Ok(watch::spawn(self.shared.clone(), prefix, handler))
    }

    async fn acquire_lock(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<Option<LockToken>> {
        Ok(self
            .acquire_with_lease(key, value, ttl)
            .await?
            .map(|(lease_id, _)| LockToken {
                key: key.to_string(),
                session: lease_id.to_string(),
            }))
    }

    async fn renew_lock(&self, token: &LockToken) -> StoreResult<bool> {
        let Some(lease_id) = parse_lease(token) else {
            return Ok(false);
        };
        let mut lease = self.shared.lease.clone();
        let requests =
            stream::iter([pb::LeaseKeepAliveRequest { id: lease_id }]).chain(stream::pending());
        let mut responses = self
            .call(lease.lease_keep_alive(requests))
            .await
            .map_err(rpc_error)?;
        // One renewal per call; the server answers each request once.
        let first = self.call(responses.message()).await.map_err(rpc_error)?;
        Ok(first.is_some_and(|response| response.ttl > 0))
    }

    async fn release_lock(&self, token: &LockToken) -> StoreResult<bool> {
        let Some(lease_id) = parse_lease(token) else {
            return Ok(false);
        };
        let request = pb::RangeRequest {
            key: token.key.as_bytes().to_vec(),
            ..Default::default()
        };
        let mut kv = self.shared.kv.clone();
        let response = self.call(kv.range(request)).await.map_err(rpc_error)?;
        let holds = response.kvs.first().is_some_and(|kv| kv.lease == lease_id);
        if !holds {
            return Ok(false);
        }
        // Revoking the lease deletes the entry it holds.
        let mut lease = self.shared.lease.clone();
        match self
            .call(lease.lease_revoke(pb::LeaseRevokeRequest { id: lease_id }))
            .await
        {
            Ok(_) => Ok(true),
            Err(status) if status.code() == Code::NotFound => Ok(false),
            Err(status) => Err(rpc_error(status)),
        }
    }

    async fn put_ephemeral(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<Option<EphemeralEntry>> {
        Ok(self
            .acquire_with_lease(key, value, ttl)
            .await?
            .map(|(lease_id, modify_index)| EphemeralEntry {
                session: lease_id.to_string(),
                modify_index,
            }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut maintenance = self.shared.maintenance.clone();
        let response = self
            .call(maintenance.status(pb::StatusRequest {}))
            .await
            .map_err(rpc_error)?;
        if response.leader == 0 {
            return Err(StoreError::unavailable("etcd reports no leader"));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_zero_requires_absence() {
        let compare = cas_compare(b"k", 0);
        assert_eq!(compare.target, pb::CompareTarget::Create as i32);
        assert_eq!(
            compare.target_union,
            Some(pb::compare::TargetUnion::CreateRevision(0))
        );
    }

    #[test]
    fn test_cas_pins_modify_revision() {
        let compare = cas_compare(b"k", 7);
        assert_eq!(compare.target, pb::CompareTarget::Mod as i32);
        assert_eq!(
            compare.target_union,
            Some(pb::compare::TargetUnion::ModRevision(7))
        );
    }

    #[test]
    fn test_unheld_guard_targets_the_lease() {
        let compare = unheld_compare(b"k");
        assert_eq!(compare.target, pb::CompareTarget::Lease as i32);
        assert_eq!(
            compare.target_union,
            Some(pb::compare::TargetUnion::Lease(0))
        );
    }

    #[test]
    fn test_txn_request_guards_and_ops() {
        let ops = vec![
            TxnOp::set_cas("keel/tenants/acme/a", b"1".to_vec(), 7),
            TxnOp::delete("keel/tenants/acme/b"),
        ];
        let request = txn_request(&ops);
        assert_eq!(request.compare.len(), 1);
        assert_eq!(request.success.len(), 2);
        assert!(request.failure.is_empty());
        assert!(matches!(
            request.success[0].request,
            Some(pb::request_op::Request::RequestPut(_))
        ));
        assert!(matches!(
            request.success[1].request,
            Some(pb::request_op::Request::RequestDeleteRange(_))
        ));
    }

    #[test]
    fn test_prefix_bounds() {
        let (key, end) = prefix_bounds("keel/tenants/acme/");
        assert_eq!(key, b"keel/tenants/acme/");
        assert_eq!(end, b"keel/tenants/acme0");
        assert_eq!(prefix_bounds(""), (vec![0], vec![0]));
    }

    #[test]
    fn test_lease_ttl_rounds_up() {
        assert_eq!(lease_ttl_secs(Duration::from_secs(15)), 15);
        assert_eq!(lease_ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(lease_ttl_secs(Duration::from_millis(10)), 1);
    }

    #[test]
    fn test_non_utf8_keys_are_protocol_errors() {
        let kv = pb::KeyValue {
            key: vec![0xff, 0xfe],
            ..Default::default()
        };
        assert!(matches!(
            kv_to_entry(kv),
            Err(StoreError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_flags_are_unsupported() {
        let backend = EtcdBackend::new(EtcdConfig::new("http://127.0.0.1:59073")).unwrap();
        let err = backend
            .put(
                "keel/tenants/acme/a",
                b"v".to_vec(),
                PutOptions::new().with_flags(5),
            )
            .await;
        assert!(matches!(err, Err(StoreError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_maps_to_unavailable() {
        // Nothing listens on this port.
        let backend = EtcdBackend::new(
            EtcdConfig::new("http://127.0.0.1:59073")
                .with_request_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        let err = backend.get("keel/tenants/acme/a", Consistency::Default).await;
        assert!(matches!(err, Err(StoreError::Unavailable { .. })));
    }
}
