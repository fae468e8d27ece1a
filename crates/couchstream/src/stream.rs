//! Stream coordinator
//!
//! Owns one worker task per assigned vbucket. A worker opens the DCP
//! stream at the checkpointed offset, pumps events through a bounded queue
//! to the consumer callback in strict seqno order, and drives the
//! per-vbucket state machine:
//!
//! ```text
//! Closed -> Opening -> Open -> Closing -> Closed
//!             |  ^
//!             v  |
//!          RollingBack        (server rejected the resume point)
//! ```
//!
//! Rebalances are serialized and coalesced upstream (the orchestrator
//! forwards only the newest model); here each one computes the symmetric
//! difference between the current and target assignments, closes departing
//! streams cleanly — final flush included — and opens arriving ones from
//! their loaded checkpoints.
//!
//! The consumer callback never sees an error: rollbacks are absorbed by
//! rewinding the checkpoint and reopening, transient open failures retry
//! in place, and a vbucket that keeps failing is parked until the next
//! rebalance.

use crate::couchbase::{DcpEvent, EndStreamReason, SharedClient, StreamEvent};
use crate::checkpoint::CheckpointTracker;
use crate::error::{DcpError, Result};
use crate::metrics::StreamMetrics;
use crate::offset::{Offset, SeqNo, Snapshot, VbId};
use crate::rollback::RollbackMitigation;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of one vbucket stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbStreamState {
    Closed,
    Opening,
    Open,
    RollingBack,
    Closing,
}

/// A domain event surfaced to the consumer
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Mutation(DcpEvent),
    Deletion(DcpEvent),
    Expiration(DcpEvent),
}

impl ConsumerEvent {
    pub fn inner(&self) -> &DcpEvent {
        match self {
            Self::Mutation(e) | Self::Deletion(e) | Self::Expiration(e) => e,
        }
    }

    pub fn vb_id(&self) -> VbId {
        self.inner().vb_id
    }

    pub fn seq_no(&self) -> SeqNo {
        self.inner().seq_no
    }
}

/// Handed to the consumer callback with every event. Calling [`ack`]
/// marks the event durably handled; the checkpoint cannot advance past an
/// un-acked seqno.
///
/// [`ack`]: ListenerContext::ack
pub struct ListenerContext {
    pub event: ConsumerEvent,
    checkpoint: Arc<CheckpointTracker>,
}

impl ListenerContext {
    pub fn ack(&self) {
        let event = self.event.inner();
        self.checkpoint.ack(event.vb_id, event.seq_no);
    }
}

/// Consumer callback; invoked on the vbucket's dispatcher task, one event
/// at a time per vbucket
pub type Listener = Arc<dyn Fn(ListenerContext) + Send + Sync>;

const MAX_OPEN_ATTEMPTS: u32 = 5;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum DispatchOutcome {
    /// Rebalance-kind end: reopen immediately from the current offset
    Reopen,
    /// Normal end or server-side close: persist and stop
    Ended,
    /// Close we requested; the rebalance path owns the cleanup
    ClosedByRequest,
    /// The connection dropped the sink
    Disconnected,
}

pub struct Stream {
    client: SharedClient,
    checkpoint: Arc<CheckpointTracker>,
    mitigation: Arc<RollbackMitigation>,
    listener: Listener,
    listener_buffer_size: usize,
    states: DashMap<VbId, VbStreamState>,
    workers: Mutex<HashMap<VbId, JoinHandle<()>>>,
    rebalance_lock: Mutex<()>,
}

impl Stream {
    pub fn new(
        client: SharedClient,
        checkpoint: Arc<CheckpointTracker>,
        mitigation: Arc<RollbackMitigation>,
        listener: Listener,
        listener_buffer_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            checkpoint,
            mitigation,
            listener,
            listener_buffer_size,
            states: DashMap::new(),
            workers: Mutex::new(HashMap::new()),
            rebalance_lock: Mutex::new(()),
        })
    }

    pub fn state_of(&self, vb_id: VbId) -> VbStreamState {
        self.states
            .get(&vb_id)
            .map(|r| *r.value())
            .unwrap_or(VbStreamState::Closed)
    }

    /// Count of streams currently open
    pub fn open_count(&self) -> usize {
        self.states
            .iter()
            .filter(|r| *r.value() == VbStreamState::Open)
            .count()
    }

    pub fn get_offsets(&self) -> HashMap<VbId, Offset> {
        self.checkpoint.get_offsets()
    }

    /// Move the assignment to `target`. Serialized: one rebalance at a
    /// time; the caller coalesces queued requests (newest wins).
    pub async fn rebalance_to(self: &Arc<Self>, target: Vec<VbId>) -> Result<()> {
        let _guard = self.rebalance_lock.lock().await;
        StreamMetrics::set_rebalance_in_flight(true);
        let result = self.rebalance_inner(target).await;
        StreamMetrics::set_rebalance_in_flight(false);
        result
    }

    async fn rebalance_inner(self: &Arc<Self>, target: Vec<VbId>) -> Result<()> {
        let mut workers = self.workers.lock().await;
        let current: HashSet<VbId> = workers.keys().copied().collect();
        let target_set: HashSet<VbId> = target.iter().copied().collect();

        // Departing streams close cleanly: CLOSE_STREAM, drain the worker,
        // flush their final offsets, forget them
        let departing: Vec<VbId> = current.difference(&target_set).copied().collect();
        for &vb in &departing {
            if matches!(
                self.state_of(vb),
                VbStreamState::Open | VbStreamState::Opening | VbStreamState::RollingBack
            ) {
                self.states.insert(vb, VbStreamState::Closing);
                if let Err(e) = self.client.close_stream(vb).await {
                    debug!("close_stream vb {vb}: {e}");
                }
            }
        }
        for &vb in &departing {
            if let Some(mut handle) = workers.remove(&vb) {
                if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, &mut handle).await.is_err() {
                    warn!("worker for vb {vb} did not drain, aborting");
                    handle.abort();
                }
            }
            self.states.remove(&vb);
        }
        if !departing.is_empty() {
            self.checkpoint.flush_vbuckets(&departing).await?;
            self.checkpoint.drop_vbuckets(&departing);
            info!("closed {} departing streams", departing.len());
        }

        self.mitigation.set_vbuckets(target.clone());

        // Parked workers (open gave up earlier) get another try now
        let parked: Vec<VbId> = workers
            .iter()
            .filter(|(vb, handle)| handle.is_finished() && target_set.contains(vb))
            .map(|(&vb, _)| vb)
            .collect();
        for vb in &parked {
            workers.remove(vb);
        }

        // Brand-new vbuckets load their checkpoints first
        let arriving: Vec<VbId> = target
            .iter()
            .copied()
            .filter(|vb| !workers.contains_key(vb))
            .collect();
        let new_vbs: Vec<VbId> = arriving
            .iter()
            .copied()
            .filter(|vb| !parked.contains(vb))
            .collect();
        if !new_vbs.is_empty() {
            self.checkpoint.load(&new_vbs).await?;
        }
        for &vb in &arriving {
            workers.insert(vb, self.spawn_worker(vb));
        }
        if !arriving.is_empty() {
            info!("opened {} arriving streams", arriving.len());
        }
        Ok(())
    }

    /// Close every stream and flush; used at shutdown
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        self.rebalance_to(Vec::new()).await
    }

    fn spawn_worker(self: &Arc<Self>, vb_id: VbId) -> JoinHandle<()> {
        let stream = self.clone();
        tokio::spawn(async move { stream.run_vbucket(vb_id).await })
    }

    /// One vbucket's whole life: open (absorbing rollbacks and transient
    /// failures), dispatch until the stream ends, reopen when the end was
    /// rebalance-kind
    async fn run_vbucket(self: Arc<Self>, vb_id: VbId) {
        loop {
            let Some(mut offset) = self.checkpoint.current_offset(vb_id) else {
                return;
            };
            self.states.insert(vb_id, VbStreamState::Opening);

            let (tx, mut rx) = mpsc::channel(self.listener_buffer_size);
            let mut attempts = 0u32;
            loop {
                // The vbucket may have been unassigned while we were retrying
                if self.state_of(vb_id) == VbStreamState::Closing {
                    return;
                }
                match self.client.open_stream(vb_id, offset, tx.clone()).await {
                    Ok(()) => break,
                    Err(DcpError::Rollback { seq_no, .. }) => {
                        self.states.insert(vb_id, VbStreamState::RollingBack);
                        match self.handle_rollback(vb_id, seq_no).await {
                            Ok(rewound) => {
                                offset = rewound;
                                self.states.insert(vb_id, VbStreamState::Opening);
                            }
                            Err(e) => {
                                error!("vb {vb_id} rollback handling failed: {e}");
                                self.states.insert(vb_id, VbStreamState::Closed);
                                return;
                            }
                        }
                    }
                    // A previous incarnation may still be draining its close
                    Err(e)
                        if (e.is_retriable() || matches!(e, DcpError::StreamAlreadyOpen(_)))
                            && attempts < MAX_OPEN_ATTEMPTS =>
                    {
                        attempts += 1;
                        warn!("vb {vb_id} open attempt {attempts} failed: {e}");
                        tokio::time::sleep(OPEN_RETRY_DELAY).await;
                    }
                    Err(e) => {
                        // Parked; the next rebalance tick tries again
                        error!("vb {vb_id} stream cannot open: {e}");
                        self.states.insert(vb_id, VbStreamState::Closed);
                        return;
                    }
                }
            }
            drop(tx); // the connection owns the only sender now
            self.states.insert(vb_id, VbStreamState::Open);

            match self.dispatch(vb_id, &mut rx).await {
                DispatchOutcome::Reopen => {
                    debug!("vb {vb_id} ended for rebalance, reopening");
                    continue;
                }
                DispatchOutcome::Ended => {
                    if let Err(e) = self.checkpoint.flush_vbuckets(&[vb_id]).await {
                        warn!("final flush for vb {vb_id} failed: {e}");
                    }
                    self.states.insert(vb_id, VbStreamState::Closed);
                    return;
                }
                DispatchOutcome::ClosedByRequest => return,
                DispatchOutcome::Disconnected => {
                    warn!("vb {vb_id} stream disconnected");
                    self.states.insert(vb_id, VbStreamState::Closed);
                    return;
                }
            }
        }
    }

    /// Rewind to the server-accepted seqno under the new lineage and
    /// persist the rewound checkpoint before reopening
    async fn handle_rollback(&self, vb_id: VbId, seq_no: SeqNo) -> Result<Offset> {
        let failover = self.client.failover_log(vb_id).await?;
        let vb_uuid = failover.first().map(|entry| entry.vb_uuid).unwrap_or(0);
        warn!("vb {vb_id} rolling back to seq {seq_no} under uuid {vb_uuid:x}");
        self.checkpoint.rollback(vb_id, seq_no, vb_uuid).await?;
        Ok(Offset::new(vb_uuid, seq_no, Snapshot::new(seq_no, seq_no)))
    }

    /// Deliver events in arrival (seqno) order until the stream ends
    async fn dispatch(
        &self,
        vb_id: VbId,
        rx: &mut mpsc::Receiver<StreamEvent>,
    ) -> DispatchOutcome {
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::SnapshotMarker { start_seq_no, end_seq_no, .. } => {
                    self.checkpoint.update_snapshot(vb_id, start_seq_no, end_seq_no);
                    StreamMetrics::set_snapshot(vb_id, start_seq_no, end_seq_no);
                }
                StreamEvent::Mutation(e) => {
                    StreamMetrics::record_mutation(vb_id);
                    self.deliver(ConsumerEvent::Mutation(e));
                }
                StreamEvent::Deletion(e) => {
                    StreamMetrics::record_deletion(vb_id);
                    self.deliver(ConsumerEvent::Deletion(e));
                }
                StreamEvent::Expiration(e) => {
                    StreamMetrics::record_expiration(vb_id);
                    self.deliver(ConsumerEvent::Expiration(e));
                }
                StreamEvent::End { reason, .. } => {
                    return match reason {
                        EndStreamReason::Rebalance => DispatchOutcome::Reopen,
                        EndStreamReason::Closed
                            if self.state_of(vb_id) == VbStreamState::Closing =>
                        {
                            DispatchOutcome::ClosedByRequest
                        }
                        EndStreamReason::Closed | EndStreamReason::Normal => {
                            DispatchOutcome::Ended
                        }
                    };
                }
            }
        }
        DispatchOutcome::Disconnected
    }

    fn deliver(&self, event: ConsumerEvent) {
        let dcp_event = event.inner();
        let vb_id = dcp_event.vb_id;
        self.checkpoint.update_vb_uuid(vb_id, dcp_event.vb_uuid);
        StreamMetrics::set_seq_no(vb_id, dcp_event.seq_no);
        if let Some(offset) = self.checkpoint.current_offset(vb_id) {
            StreamMetrics::set_lag(
                vb_id,
                offset.snapshot.end_seq_no.saturating_sub(dcp_event.seq_no),
            );
        }
        let started = std::time::Instant::now();
        (self.listener)(ListenerContext {
            event,
            checkpoint: self.checkpoint.clone(),
        });
        StreamMetrics::set_process_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoReset, RollbackMitigationConfig};
    use crate::couchbase::mock::MockCluster;
    use crate::metadata::{MemoryMetadataStore, SharedMetadataStore};
    use parking_lot::Mutex as SyncMutex;

    struct Harness {
        cluster: Arc<MockCluster>,
        metadata: SharedMetadataStore,
        stream: Arc<Stream>,
        seen: Arc<SyncMutex<Vec<(VbId, SeqNo)>>>,
    }

    fn harness(vbucket_count: u16) -> Harness {
        let cluster = MockCluster::new(vbucket_count);
        let metadata: SharedMetadataStore = Arc::new(MemoryMetadataStore::new());
        let mitigation = Arc::new(RollbackMitigation::start(
            cluster.clone(),
            &RollbackMitigationConfig { disabled: true, ..Default::default() },
        ));
        let checkpoint = CheckpointTracker::new(
            metadata.clone(),
            cluster.clone(),
            mitigation.clone(),
            AutoReset::Earliest,
        );

        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let listener: Listener = Arc::new(move |ctx: ListenerContext| {
            seen_clone.lock().push((ctx.event.vb_id(), ctx.event.seq_no()));
            ctx.ack();
        });

        let stream = Stream::new(cluster.clone(), checkpoint, mitigation, listener, 64);
        Harness { cluster, metadata, stream, seen }
    }

    async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) {
        tokio::time::timeout(deadline, async {
            while !predicate() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_events_delivered_in_order_and_acked() {
        let h = harness(2);
        for i in 0..20 {
            h.cluster.add_mutation(0, format!("k{i}"), "v");
        }

        h.stream.rebalance_to(vec![0, 1]).await.unwrap();
        wait_until(Duration::from_secs(3), || h.seen.lock().len() == 20).await;

        let seen = h.seen.lock().clone();
        let seqs: Vec<SeqNo> = seen.iter().map(|(_, s)| *s).collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());

        // Acks reached the tracker
        assert_eq!(h.stream.get_offsets()[&0].seq_no, 20);
        h.stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebalance_closes_departing_and_flushes() {
        let h = harness(4);
        for vb in 0..4u16 {
            h.cluster.add_mutation(vb, "k", "v");
        }

        h.stream.rebalance_to(vec![0, 1, 2, 3]).await.unwrap();
        wait_until(Duration::from_secs(3), || h.seen.lock().len() == 4).await;

        // Shrink to the first half
        h.stream.rebalance_to(vec![0, 1]).await.unwrap();
        assert_eq!(h.stream.state_of(2), VbStreamState::Closed);
        assert_eq!(h.stream.state_of(3), VbStreamState::Closed);
        assert_eq!(h.cluster.open_stream_count(), 2);

        // Departing checkpoints were flushed on the way out
        let saved = h.metadata.load(&[2, 3]).await.unwrap();
        assert_eq!(saved[&2].seq_no, 1);
        assert_eq!(saved[&3].seq_no, 1);

        h.stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_redundant_rebalance_causes_no_churn() {
        let h = harness(2);
        h.stream.rebalance_to(vec![0, 1]).await.unwrap();
        wait_until(Duration::from_secs(3), || h.stream.open_count() == 2).await;

        h.stream.rebalance_to(vec![0, 1]).await.unwrap();
        assert_eq!(h.stream.open_count(), 2);
        assert_eq!(h.cluster.open_stream_count(), 2);
        h.stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebalance_end_reopens_stream() {
        let h = harness(1);
        h.cluster.add_mutation(0, "k1", "v");

        h.stream.rebalance_to(vec![0]).await.unwrap();
        wait_until(Duration::from_secs(3), || h.seen.lock().len() == 1).await;

        h.cluster.trigger_stream_end(0, EndStreamReason::Rebalance);
        wait_until(Duration::from_secs(3), || {
            h.stream.state_of(0) == VbStreamState::Open && h.cluster.open_stream_count() == 1
        })
        .await;

        // The reopened stream resumes from the acked offset: a new
        // mutation flows, the old one is not re-delivered
        h.cluster.add_mutation(0, "k2", "v");
        wait_until(Duration::from_secs(3), || h.seen.lock().len() == 2).await;
        assert_eq!(h.seen.lock().last().copied(), Some((0, 2)));

        h.stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_rewinds_and_redelivers() {
        let h = harness(1);
        for i in 0..500 {
            h.cluster.add_mutation(0, format!("k{i}"), "v");
        }

        h.stream.rebalance_to(vec![0]).await.unwrap();
        wait_until(Duration::from_secs(5), || h.seen.lock().len() == 500).await;
        h.stream.close().await.unwrap();
        h.seen.lock().clear();

        // Failover rewinds the vbucket to 450
        h.cluster.inject_rollback(0, 450);
        h.stream.rebalance_to(vec![0]).await.unwrap();

        // Events (450, 500] are re-delivered under the new lineage
        wait_until(Duration::from_secs(5), || h.seen.lock().len() == 50).await;
        let first = h.seen.lock().first().copied();
        assert_eq!(first, Some((0, 451)));

        // The checkpoint was rewound before the replay caught up
        let saved = h.metadata.load(&[0]).await.unwrap()[&0];
        assert_eq!(saved.vb_uuid, h.cluster.current_vb_uuid(0));

        h.stream.close().await.unwrap();
        let final_offset = h.metadata.load(&[0]).await.unwrap()[&0];
        assert_eq!(final_offset.seq_no, 500);
    }
}
