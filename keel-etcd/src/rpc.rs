//! Thin gRPC clients for the etcd services.
//!
//! Each client drives [`tonic::client::Grpc`] directly with a prost
//! codec, the same calls `tonic-build` emits, just without a build-time
//! codegen step. Method paths name the upstream services verbatim.

use futures_util::Stream;
use keel_core::StoreError;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Code, Request, Status, Streaming};

use crate::pb;

/// Wait for the channel to be ready. Dial failures on a lazy channel
/// surface here, so they map to unavailability rather than unknown.
async fn ready(inner: &mut Grpc<Channel>) -> Result<(), Status> {
    inner
        .ready()
        .await
        .map_err(|e| Status::unavailable(format!("etcd endpoint not ready: {e}")))
}

/// Translate a gRPC status into the store error taxonomy. Transport
/// trouble and deadlines mean the backend is unavailable; anything the
/// server actively rejected beyond bad arguments is a protocol error.
pub(crate) fn rpc_error(status: Status) -> StoreError {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
            StoreError::unavailable(format!("etcd unavailable: {}", status.message()))
        }
        Code::InvalidArgument => StoreError::invalid_argument(status.message()),
        code => StoreError::protocol(format!("etcd rpc failed with {code:?}: {}", status.message())),
    }
}

// ============================================================================
// KV SERVICE
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct KvClient {
    inner: Grpc<Channel>,
}

impl KvClient {
    pub(crate) fn new(channel: Channel) -> Self {
        KvClient {
            inner: Grpc::new(channel),
        }
    }

    pub(crate) async fn range(
        &mut self,
        request: pb::RangeRequest,
    ) -> Result<pb::RangeResponse, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<pb::RangeRequest, pb::RangeResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static("/etcdserverpb.KV/Range");
        let response = self.inner.unary(Request::new(request), path, codec).await?;
        Ok(response.into_inner())
    }

    pub(crate) async fn put(&mut self, request: pb::PutRequest) -> Result<pb::PutResponse, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<pb::PutRequest, pb::PutResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static("/etcdserverpb.KV/Put");
        let response = self.inner.unary(Request::new(request), path, codec).await?;
        Ok(response.into_inner())
    }

    pub(crate) async fn delete_range(
        &mut self,
        request: pb::DeleteRangeRequest,
    ) -> Result<pb::DeleteRangeResponse, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<pb::DeleteRangeRequest, pb::DeleteRangeResponse> =
            ProstCodec::default();
        let path = PathAndQuery::from_static("/etcdserverpb.KV/DeleteRange");
        let response = self.inner.unary(Request::new(request), path, codec).await?;
        Ok(response.into_inner())
    }

    pub(crate) async fn txn(&mut self, request: pb::TxnRequest) -> Result<pb::TxnResponse, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<pb::TxnRequest, pb::TxnResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static("/etcdserverpb.KV/Txn");
        let response = self.inner.unary(Request::new(request), path, codec).await?;
        Ok(response.into_inner())
    }
}

// ============================================================================
// WATCH SERVICE
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct WatchClient {
    inner: Grpc<Channel>,
}

impl WatchClient {
    pub(crate) fn new(channel: Channel) -> Self {
        WatchClient {
            inner: Grpc::new(channel),
        }
    }

    pub(crate) async fn watch<S>(
        &mut self,
        requests: S,
    ) -> Result<Streaming<pb::WatchResponse>, Status>
    where
        S: Stream<Item = pb::WatchRequest> + Send + 'static,
    {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<pb::WatchRequest, pb::WatchResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static("/etcdserverpb.Watch/Watch");
        let response = self
            .inner
            .streaming(Request::new(requests), path, codec)
            .await?;
        Ok(response.into_inner())
    }
}

// ============================================================================
// LEASE SERVICE
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct LeaseClient {
    inner: Grpc<Channel>,
}

impl LeaseClient {
    pub(crate) fn new(channel: Channel) -> Self {
        LeaseClient {
            inner: Grpc::new(channel),
        }
    }

    pub(crate) async fn lease_grant(
        &mut self,
        request: pb::LeaseGrantRequest,
    ) -> Result<pb::LeaseGrantResponse, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<pb::LeaseGrantRequest, pb::LeaseGrantResponse> =
            ProstCodec::default();
        let path = PathAndQuery::from_static("/etcdserverpb.Lease/LeaseGrant");
        let response = self.inner.unary(Request::new(request), path, codec).await?;
        Ok(response.into_inner())
    }

    pub(crate) async fn lease_revoke(
        &mut self,
        request: pb::LeaseRevokeRequest,
    ) -> Result<pb::LeaseRevokeResponse, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<pb::LeaseRevokeRequest, pb::LeaseRevokeResponse> =
            ProstCodec::default();
        let path = PathAndQuery::from_static("/etcdserverpb.Lease/LeaseRevoke");
        let response = self.inner.unary(Request::new(request), path, codec).await?;
        Ok(response.into_inner())
    }

    pub(crate) async fn lease_keep_alive<S>(
        &mut self,
        requests: S,
    ) -> Result<Streaming<pb::LeaseKeepAliveResponse>, Status>
    where
        S: Stream<Item = pb::LeaseKeepAliveRequest> + Send + 'static,
    {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<pb::LeaseKeepAliveRequest, pb::LeaseKeepAliveResponse> =
            ProstCodec::default();
        let path = PathAndQuery::from_static("/etcdserverpb.Lease/LeaseKeepAlive");
        let response = self
            .inner
            .streaming(Request::new(requests), path, codec)
            .await?;
        Ok(response.into_inner())
    }
}

// ============================================================================
// MAINTENANCE SERVICE
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct MaintenanceClient {
    inner: Grpc<Channel>,
}

impl MaintenanceClient {
    pub(crate) fn new(channel: Channel) -> Self {
        MaintenanceClient {
            inner: Grpc::new(channel),
        }
    }

    pub(crate) async fn status(
        &mut self,
        request: pb::StatusRequest,
    ) -> Result<pb::StatusResponse, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<pb::StatusRequest, pb::StatusResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static("/etcdserverpb.Maintenance/Status");
        let response = self.inner.unary(Request::new(request), path, codec).await?;
        Ok(response.into_inner())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_codes_map_to_unavailable() {
        for status in [
            Status::unavailable("connection refused"),
            Status::deadline_exceeded("timed out"),
            Status::cancelled("cancelled"),
        ] {
            assert!(matches!(
                rpc_error(status),
                StoreError::Unavailable { .. }
            ));
        }
    }

    #[test]
    fn test_invalid_argument_passes_through() {
        let err = rpc_error(Status::invalid_argument("key is not provided"));
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
    }

    #[test]
    fn test_other_codes_are_protocol_errors() {
        let err = rpc_error(Status::not_found("requested lease not found"));
        assert!(matches!(err, StoreError::Protocol { .. }));
    }
}
