//! Consul backend adapter.
//!
//! Maps the [`StoreBackend`] contract onto the agent's HTTP API. All
//! writes go through `/v1/txn`, including single-key puts and deletes,
//! because only the transaction endpoint returns the written
//! `ModifyIndex`. Locks and ephemeral entries ride on sessions created
//! with delete behavior, so Consul removes their entries when a session
//! expires.

use async_trait::async_trait;
use keel_core::{
    kv::ensure_single_tenant, Consistency, DeleteOptions, DeleteResult, EphemeralEntry, KvEntry,
    LockToken, PutOptions, StoreError, TxnOp, TxnOpResult, TxnResult, WriteResult,
};
use keel_store::{StoreBackend, StoreResult, WatchHandler, WatchSubscription};
use reqwest::{RequestBuilder, StatusCode};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ConsulConfig;
use crate::watch;
use crate::wire::{
    txn_ops_to_wire, KvPair, SessionCreateRequest, SessionCreateResponse, TxnEnvelope, TxnKvOp,
    TxnOpError, TxnResponse, TxnResultEnvelope, MAX_TXN_OPS, VERB_DELETE_TREE,
};

// ============================================================================
// SHARED CLIENT STATE
// ============================================================================

/// HTTP client plus configuration, shared with watch tasks.
pub(crate) struct ConsulShared {
    pub(crate) http: reqwest::Client,
    pub(crate) config: ConsulConfig,
}

impl ConsulShared {
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.address.trim_end_matches('/'), path)
    }

    pub(crate) fn kv_url(&self, key: &str) -> String {
        self.url(&format!("/v1/kv/{key}"))
    }

    /// Attach the ACL token and datacenter to a request.
    pub(crate) fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        let request = match &self.config.token {
            Some(token) => request.header("X-Consul-Token", token.expose_secret()),
            None => request,
        };
        match &self.config.datacenter {
            Some(dc) => request.query(&[("dc", dc.as_str())]),
            None => request,
        }
    }
}

pub(crate) fn request_error(err: reqwest::Error) -> StoreError {
    StoreError::unavailable(format!("consul request failed: {err}"))
}

pub(crate) fn parse_error(err: reqwest::Error) -> StoreError {
    StoreError::protocol(format!("failed to parse consul response: {err}"))
}

pub(crate) async fn unexpected_status(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    match status {
        StatusCode::BAD_REQUEST => {
            StoreError::invalid_argument(format!("consul rejected the request: {body}"))
        }
        StatusCode::FORBIDDEN => {
            StoreError::protocol(format!("consul denied the request: {body}"))
        }
        status if status.is_server_error() => {
            StoreError::unavailable(format!("consul returned {status}: {body}"))
        }
        status => StoreError::protocol(format!("consul returned {status}: {body}")),
    }
}

fn consistency_param(consistency: Consistency) -> Option<&'static str> {
    match consistency {
        Consistency::Default => None,
        Consistency::Consistent => Some("consistent"),
        Consistency::Stale => Some("stale"),
    }
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

/// Align txn response entries with the operations that produced them.
/// Consul only returns result entries for verbs that yield a KV, so set
/// operations consume results in order while deletes produce none.
fn align_txn_results(ops: &[TxnOp], results: Vec<TxnResultEnvelope>) -> Vec<TxnOpResult> {
    let mut results = results.into_iter();
    ops.iter()
        .map(|op| match op {
            TxnOp::Set { .. } => {
                let index = results.next().and_then(|r| r.kv).map(|kv| kv.modify_index);
                TxnOpResult::applied(index)
            }
            TxnOp::Delete { .. } => TxnOpResult::applied(None),
        })
        .collect()
}

/// Expand a sparse error list into one result per operation.
fn conflict_txn_results(op_count: usize, errors: Vec<TxnOpError>) -> Vec<TxnOpResult> {
    let mut by_index: HashMap<usize, String> = errors
        .into_iter()
        .map(|err| (err.op_index, err.what))
        .collect();
    (0..op_count)
        .map(|idx| match by_index.remove(&idx) {
            Some(what) => TxnOpResult::failed(what),
            None => TxnOpResult::failed("transaction aborted"),
        })
        .collect()
}

enum WireTxnOutcome {
    Applied(Vec<TxnResultEnvelope>),
    Conflict(Vec<TxnOpError>),
}

// ============================================================================
// BACKEND
// ============================================================================

/// [`StoreBackend`] over a Consul agent.
pub struct ConsulBackend {
    shared: Arc<ConsulShared>,
}

impl ConsulBackend {
    pub fn new(config: ConsulConfig) -> Result<Self, keel_core::ConfigError> {
        config.validate()?;
        Ok(ConsulBackend {
            shared: Arc::new(ConsulShared {
                http: reqwest::Client::new(),
                config,
            }),
        })
    }

    pub fn from_env() -> Result<Self, keel_core::ConfigError> {
        ConsulBackend::new(ConsulConfig::from_env())
    }

    /// Raw read returning the wire pair, session field included.
    async fn get_pair(
        &self,
        key: &str,
        consistency: Consistency,
    ) -> StoreResult<Option<KvPair>> {
        let mut request = self
            .shared
            .http
            .get(self.shared.kv_url(key))
            .timeout(self.shared.config.timeout);
        request = self.shared.apply_auth(request);
        if let Some(flag) = consistency_param(consistency) {
            request = request.query(&[(flag, "")]);
        }
        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(unexpected_status(response).await);
        }
        let pairs: Vec<KvPair> = response.json().await.map_err(parse_error)?;
        Ok(pairs.into_iter().next())
    }

    async fn execute_wire_txn(&self, body: &[TxnEnvelope]) -> StoreResult<WireTxnOutcome> {
        let request = self
            .shared
            .apply_auth(
                self.shared
                    .http
                    .put(self.shared.url("/v1/txn"))
                    .timeout(self.shared.config.timeout),
            )
            .json(body);
        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            let parsed: TxnResponse = response.json().await.map_err(parse_error)?;
            return Ok(WireTxnOutcome::Conflict(parsed.errors.unwrap_or_default()));
        }
        if !status.is_success() {
            return Err(unexpected_status(response).await);
        }
        let parsed: TxnResponse = response.json().await.map_err(parse_error)?;
        Ok(WireTxnOutcome::Applied(parsed.results.unwrap_or_default()))
    }

    async fn create_session(&self, ttl: Duration) -> StoreResult<String> {
        let body = SessionCreateRequest::delete_on_expiry(ttl);
        let request = self
            .shared
            .apply_auth(
                self.shared
                    .http
                    .put(self.shared.url("/v1/session/create"))
                    .timeout(self.shared.config.timeout),
            )
            .json(&body);
        let response = request.send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(unexpected_status(response).await);
        }
        let created: SessionCreateResponse = response.json().await.map_err(parse_error)?;
        Ok(created.id)
    }

    /// Best-effort session teardown. With delete behavior this also
    /// removes any entries the session still holds.
    async fn destroy_session(&self, session: &str) {
        let request = self.shared.apply_auth(
            self.shared
                .http
                .put(self.shared.url(&format!("/v1/session/destroy/{session}")))
                .timeout(self.shared.config.timeout),
        );
        if let Err(err) = request.send().await {
            debug!(error = %err, "failed to destroy consul session");
        }
    }

    /// PUT against a kv key with an `acquire`/`release` style flag,
    /// returning the agent's boolean verdict.
    async fn kv_flag_put(
        &self,
        key: &str,
        flag: (&str, &str),
        value: Vec<u8>,
    ) -> StoreResult<bool> {
        let request = self
            .shared
            .apply_auth(
                self.shared
                    .http
                    .put(self.shared.kv_url(key))
                    .timeout(self.shared.config.timeout),
            )
            .query(&[flag])
            .body(value);
        let response = request.send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(unexpected_status(response).await);
        }
        response.json().await.map_err(parse_error)
    }
}

impl fmt::Debug for ConsulBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsulBackend")
            .field("address", &self.shared.config.address)
            .field("datacenter", &self.shared.config.datacenter)
            .finish()
    }
}

#[async_trait]
impl StoreBackend for ConsulBackend {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn get(&self, key: &str, consistency: Consistency) -> StoreResult<Option<KvEntry>> {
        require_key(key)?;
        match self.get_pair(key, consistency).await? {
            Some(pair) => Ok(Some(pair.into_entry()?)),
            None => Ok(None),
        }
    }

    async fn list(&self, prefix: &str, consistency: Consistency) -> StoreResult<Vec<KvEntry>> {
        let mut request = self
            .shared
            .http
            .get(self.shared.kv_url(prefix))
            .timeout(self.shared.config.timeout)
            .query(&[("recurse", "")]);
        request = self.shared.apply_auth(request);
        if let Some(flag) = consistency_param(consistency) {
            request = request.query(&[(flag, "")]);
        }
        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(unexpected_status(response).await);
        }
        let pairs: Vec<KvPair> = response.json().await.map_err(parse_error)?;
        let mut entries = pairs
            .into_iter()
            .map(KvPair::into_entry)
            .collect::<StoreResult<Vec<_>>>()?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn list_keys(&self, prefix: &str, separator: Option<char>) -> StoreResult<Vec<String>> {
        let mut request = self
            .shared
            .http
            .get(self.shared.kv_url(prefix))
            .timeout(self.shared.config.timeout)
            .query(&[("keys", "")]);
        if let Some(sep) = separator {
            request = request.query(&[("separator", sep.to_string())]);
        }
        request = self.shared.apply_auth(request);
        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(unexpected_status(response).await);
        }
        let mut keys: Vec<String> = response.json().await.map_err(parse_error)?;
        keys.sort();
        Ok(keys)
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        options: PutOptions,
    ) -> StoreResult<WriteResult> {
        require_key(key)?;
        let ops = [TxnOp::Set {
            key: key.to_string(),
            value,
            flags: options.flags,
            cas: options.cas,
        }];
        match self.execute_wire_txn(&txn_ops_to_wire(&ops)).await? {
            WireTxnOutcome::Applied(results) => {
                let modify_index = results
                    .first()
                    .and_then(|r| r.kv.as_ref())
                    .map(|kv| kv.modify_index)
                    .unwrap_or(0);
                Ok(WriteResult {
                    success: true,
                    modify_index,
                })
            }
            WireTxnOutcome::Conflict(_) => Ok(WriteResult {
                success: false,
                modify_index: 0,
            }),
        }
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> StoreResult<DeleteResult> {
        if options.recurse && options.cas.is_some() {
            return Err(StoreError::invalid_argument(
                "recursive delete cannot carry a cas guard",
            ));
        }
        let body = if options.recurse {
            vec![TxnEnvelope {
                kv: TxnKvOp {
                    verb: VERB_DELETE_TREE.to_string(),
                    key: key.to_string(),
                    value: None,
                    flags: None,
                    index: None,
                },
            }]
        } else {
            require_key(key)?;
            txn_ops_to_wire(&[TxnOp::Delete {
                key: key.to_string(),
                cas: options.cas,
            }])
        };
        match self.execute_wire_txn(&body).await? {
            WireTxnOutcome::Applied(_) => Ok(DeleteResult { success: true }),
            WireTxnOutcome::Conflict(_) => Ok(DeleteResult { success: false }),
        }
    }

    async fn transaction(&self, ops: Vec<TxnOp>) -> StoreResult<TxnResult> {
        ensure_single_tenant(&ops)?;
        if ops.len() > MAX_TXN_OPS {
            return Err(StoreError::invalid_argument(format!(
                "transaction exceeds the {MAX_TXN_OPS} operation limit"
            )));
        }
        match self.execute_wire_txn(&txn_ops_to_wire(&ops)).await? {
            WireTxnOutcome::Applied(results) => {
                Ok(TxnResult::applied(align_txn_results(&ops, results)))
            }
            WireTxnOutcome::Conflict(errors) => Ok(TxnResult::aborted(conflict_txn_results(
                ops.len(),
                errors,
            ))),
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
        require_key(key)?;
        require_ttl(ttl)?;
        let session = self.create_session(ttl).await?;
        let won = self
            .kv_flag_put(key, ("acquire", session.as_str()), value)
            .await?;
        if !won {
            self.destroy_session(&session).await;
            return Ok(None);
        }
        Ok(Some(LockToken {
            key: key.to_string(),
            session,
        }))
    }

    async fn renew_lock(&self, token: &LockToken) -> StoreResult<bool> {
        let request = self.shared.apply_auth(
            self.shared
                .http
                .put(
                    self.shared
                        .url(&format!("/v1/session/renew/{}", token.session)),
                )
                .timeout(self.shared.config.timeout),
        );
        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(unexpected_status(response).await);
        }
        Ok(true)
    }

    async fn release_lock(&self, token: &LockToken) -> StoreResult<bool> {
        let holds = self
            .get_pair(&token.key, Consistency::Default)
            .await?
            .is_some_and(|pair| pair.session.as_deref() == Some(token.session.as_str()));
        // Destroying the session deletes the entry it holds.
        self.destroy_session(&token.session).await;
        Ok(holds)
    }

    async fn put_ephemeral(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> StoreResult<Option<EphemeralEntry>> {
        require_key(key)?;
        require_ttl(ttl)?;
        let session = self.create_session(ttl).await?;
        let won = self
            .kv_flag_put(key, ("acquire", session.as_str()), value)
            .await?;
        if !won {
            self.destroy_session(&session).await;
            return Ok(None);
        }
        let modify_index = self
            .get_pair(key, Consistency::Default)
            .await?
            .map(|pair| pair.modify_index)
            .unwrap_or(0);
        Ok(Some(EphemeralEntry {
            session,
            modify_index,
        }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        let request = self.shared.apply_auth(
            self.shared
                .http
                .get(self.shared.url("/v1/status/leader"))
                .timeout(self.shared.config.timeout),
        );
        let response = request.send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(unexpected_status(response).await);
        }
        let leader: String = response.json().await.map_err(parse_error)?;
        if leader.is_empty() {
            return Err(StoreError::unavailable("consul reports no leader"));
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

    fn shared(address: &str) -> ConsulShared {
        ConsulShared {
            http: reqwest::Client::new(),
            config: ConsulConfig::new(address),
        }
    }

    #[test]
    fn test_url_building_handles_trailing_slash() {
        let shared = shared("http://consul.test:8500/");
        assert_eq!(
            shared.kv_url("keel/tenants/acme/app"),
            "http://consul.test:8500/v1/kv/keel/tenants/acme/app"
        );
        assert_eq!(shared.url("/v1/txn"), "http://consul.test:8500/v1/txn");
    }

    #[test]
    fn test_consistency_params() {
        assert_eq!(consistency_param(Consistency::Default), None);
        assert_eq!(consistency_param(Consistency::Consistent), Some("consistent"));
        assert_eq!(consistency_param(Consistency::Stale), Some("stale"));
    }

    #[test]
    fn test_align_txn_results_skips_deletes() {
        let ops = vec![
            TxnOp::set("keel/tenants/acme/a", b"1".to_vec()),
            TxnOp::delete("keel/tenants/acme/b"),
            TxnOp::set("keel/tenants/acme/c", b"2".to_vec()),
        ];
        let results = vec![
            TxnResultEnvelope {
                kv: Some(KvPair {
                    key: "keel/tenants/acme/a".to_string(),
                    value: None,
                    flags: 0,
                    create_index: 10,
                    modify_index: 10,
                    lock_index: 0,
                    session: None,
                }),
            },
            TxnResultEnvelope {
                kv: Some(KvPair {
                    key: "keel/tenants/acme/c".to_string(),
                    value: None,
                    flags: 0,
                    create_index: 10,
                    modify_index: 10,
                    lock_index: 0,
                    session: None,
                }),
            },
        ];
        let aligned = align_txn_results(&ops, results);
        assert_eq!(aligned[0].modify_index, Some(10));
        assert_eq!(aligned[1].modify_index, None);
        assert_eq!(aligned[2].modify_index, Some(10));
        assert!(aligned.iter().all(|r| r.success));
    }

    #[test]
    fn test_conflict_results_cover_every_op() {
        let errors = vec![TxnOpError {
            op_index: 1,
            what: "failed index check".to_string(),
        }];
        let results = conflict_txn_results(3, errors);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.success));
        assert_eq!(results[1].message.as_deref(), Some("failed index check"));
        assert_eq!(results[0].message.as_deref(), Some("transaction aborted"));
    }

    #[tokio::test]
    async fn test_unreachable_agent_maps_to_unavailable() {
        // Nothing listens on this port.
        let backend = ConsulBackend::new(
            ConsulConfig::new("http://127.0.0.1:59072").with_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        let err = backend.get("keel/tenants/acme/a", Consistency::Default).await;
        assert!(matches!(err, Err(StoreError::Unavailable { .. })));
    }
}
