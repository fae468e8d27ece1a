//! Client trait for per-vbucket DCP and metadata K/V operations

use crate::error::Result;
use crate::offset::{FailoverEntry, Offset, SeqNo, VbId, VbUuid};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A single domain event from a vbucket stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcpEvent {
    pub vb_id: VbId,
    pub vb_uuid: VbUuid,
    pub seq_no: SeqNo,
    pub key: Bytes,
    pub value: Bytes,
    pub cas: u64,
    pub collection_name: String,
}

/// Why the server ended a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStreamReason {
    /// Stream reached its requested end
    Normal,
    /// The cluster is moving the vbucket; reopen immediately
    Rebalance,
    /// Closed at the client's request
    Closed,
}

/// Everything a vbucket stream can deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Mutation(DcpEvent),
    Deletion(DcpEvent),
    Expiration(DcpEvent),
    /// Bounds of the next contiguous batch of seqnos. Not surfaced to the
    /// consumer; folded into checkpoints so a resume can re-enter
    /// mid-snapshot.
    SnapshotMarker {
        vb_id: VbId,
        start_seq_no: SeqNo,
        end_seq_no: SeqNo,
    },
    End {
        vb_id: VbId,
        reason: EndStreamReason,
    },
}

impl StreamEvent {
    pub fn vb_id(&self) -> VbId {
        match self {
            Self::Mutation(e) | Self::Deletion(e) | Self::Expiration(e) => e.vb_id,
            Self::SnapshotMarker { vb_id, .. } | Self::End { vb_id, .. } => *vb_id,
        }
    }
}

/// Result of an observe-seqno call against one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveResult {
    pub vb_uuid: VbUuid,
    /// Highest seqno the replica has persisted to disk
    pub persist_seq_no: SeqNo,
}

/// Per-vbucket stream, observe and metadata K/V operations.
///
/// Implementations wrap a real protocol library; [`super::mock::MockCluster`]
/// provides the in-memory variant. All calls carry their own deadline
/// internally; none may block past the configured connection timeout.
#[async_trait]
pub trait CouchbaseClient: Send + Sync {
    /// Liveness probe against the cluster
    async fn ping(&self) -> Result<()>;

    /// Number of vbuckets the bucket is partitioned into (a bucket
    /// property; queried once at startup)
    async fn vbucket_count(&self) -> Result<u16>;

    /// Number of replicas configured on the bucket
    async fn replica_count(&self) -> Result<u8>;

    /// Failover log for a vbucket, newest entry first
    async fn failover_log(&self, vb_id: VbId) -> Result<Vec<FailoverEntry>>;

    /// Current `(vb_uuid, high_seq_no)` for each requested vbucket
    async fn high_seq_nos(&self, vb_ids: &[VbId]) -> Result<HashMap<VbId, (VbUuid, SeqNo)>>;

    /// Observe the persisted seqno of a vbucket on one replica
    /// (`replica == 0` is the active copy)
    async fn observe_seq_no(&self, vb_id: VbId, replica: u8) -> Result<ObserveResult>;

    /// Monotonic revision of the cluster config; changes on topology shifts
    async fn config_rev(&self) -> Result<u64>;

    /// Open a DCP stream at `offset`, delivering events into `sink`.
    ///
    /// Returns `Err(DcpError::Rollback { .. })` when the resume point is
    /// incompatible with the vbucket's current history; the caller rewinds
    /// and retries. The stream stays open until [`close_stream`] or a
    /// server-side end, both of which deliver [`StreamEvent::End`].
    ///
    /// [`close_stream`]: CouchbaseClient::close_stream
    async fn open_stream(
        &self,
        vb_id: VbId,
        offset: Offset,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Result<()>;

    /// Request a clean close; acknowledged via `StreamEvent::End`
    async fn close_stream(&self, vb_id: VbId) -> Result<()>;

    // ---- metadata K/V (checkpoints, instance registry) ----

    /// Fetch a metadata document; `DcpError::NotFound` when absent
    async fn get_document(&self, key: &str) -> Result<Bytes>;

    /// Create or replace a metadata document. `ttl_secs == 0` means no expiry.
    async fn upsert_document(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<()>;

    /// Delete a metadata document; deleting an absent key is not an error
    async fn delete_document(&self, key: &str) -> Result<()>;

    /// Tear down connections
    async fn close(&self) -> Result<()>;
}

/// Shared client handle
pub type SharedClient = Arc<dyn CouchbaseClient>;
