//! In-memory cluster
//!
//! Implements [`CouchbaseClient`] against process-local state: a per-vbucket
//! event log, a metadata keyspace, per-replica persisted seqnos, and knobs
//! to inject the failure modes the coordinator must survive (rollback on
//! open, rebalance-kind stream ends, topology revision bumps, document
//! expiry). Used by the test suites and the examples; no network involved.

use super::client::{
    CouchbaseClient, DcpEvent, EndStreamReason, ObserveResult, StreamEvent,
};
use crate::error::{DcpError, Result};
use crate::offset::{FailoverEntry, Offset, SeqNo, VbId, VbUuid};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Mutation,
    Deletion,
    Expiration,
}

#[derive(Debug, Clone)]
struct LogEntry {
    seq_no: SeqNo,
    kind: EntryKind,
    key: Bytes,
    value: Bytes,
}

#[derive(Debug)]
struct VbState {
    vb_uuid: VbUuid,
    log: Vec<LogEntry>,
    failover: Vec<FailoverEntry>,
    /// When set, opens resuming past this seqno are answered with a
    /// rollback until the caller rewinds to it or below
    pending_rollback: Option<SeqNo>,
}

impl VbState {
    fn high_seq_no(&self) -> SeqNo {
        self.log.last().map(|e| e.seq_no).unwrap_or(0)
    }
}

/// One vbucket's log plus the wakeup for its stream task
struct VbShared {
    state: RwLock<VbState>,
    notify: Notify,
}

impl VbShared {
    fn new(vb_id: VbId) -> Arc<Self> {
        let vb_uuid = ((vb_id as u64) + 1) << 32;
        Arc::new(Self {
            state: RwLock::new(VbState {
                vb_uuid,
                log: Vec::new(),
                failover: vec![FailoverEntry { vb_uuid, seq_no: 0 }],
                pending_rollback: None,
            }),
            notify: Notify::new(),
        })
    }
}

struct OpenStream {
    /// Distinguishes incarnations so a finished task cannot unregister its
    /// successor
    token: u64,
    closed: Arc<AtomicBool>,
    end_reason: Arc<parking_lot::Mutex<Option<EndStreamReason>>>,
}

/// Process-local cluster double
pub struct MockCluster {
    vbucket_count: u16,
    replica_count: u8,
    vbuckets: Vec<Arc<VbShared>>,
    open_streams: Arc<DashMap<VbId, OpenStream>>,
    documents: DashMap<String, Bytes>,
    persisted: DashMap<(VbId, u8), SeqNo>,
    config_rev: AtomicU64,
    next_stream_token: AtomicU64,
    /// Appends also advance every replica's persisted seqno
    auto_persist: AtomicBool,
    ping_ok: AtomicBool,
}

impl MockCluster {
    pub fn new(vbucket_count: u16) -> Arc<Self> {
        Self::with_replicas(vbucket_count, 1)
    }

    pub fn with_replicas(vbucket_count: u16, replica_count: u8) -> Arc<Self> {
        Arc::new(Self {
            vbucket_count,
            replica_count,
            vbuckets: (0..vbucket_count).map(VbShared::new).collect(),
            open_streams: Arc::new(DashMap::new()),
            documents: DashMap::new(),
            persisted: DashMap::new(),
            config_rev: AtomicU64::new(1),
            next_stream_token: AtomicU64::new(0),
            auto_persist: AtomicBool::new(true),
            ping_ok: AtomicBool::new(true),
        })
    }

    /// Stop advancing persisted seqnos on append; tests then drive them
    /// through [`set_persisted_seq_no`](Self::set_persisted_seq_no)
    pub fn set_auto_persist(&self, enabled: bool) {
        self.auto_persist.store(enabled, Ordering::SeqCst);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    fn append(&self, vb_id: VbId, kind: EntryKind, key: Bytes, value: Bytes) -> SeqNo {
        let vb = &self.vbuckets[vb_id as usize];
        let seq_no = {
            let mut state = vb.state.write();
            let seq_no = state.high_seq_no() + 1;
            state.log.push(LogEntry { seq_no, kind, key, value });
            seq_no
        };
        if self.auto_persist.load(Ordering::SeqCst) {
            self.set_persisted_all(vb_id, seq_no);
        }
        vb.notify.notify_waiters();
        seq_no
    }

    /// Append a mutation; returns its seqno
    pub fn add_mutation(&self, vb_id: VbId, key: impl Into<Bytes>, value: impl Into<Bytes>) -> SeqNo {
        self.append(vb_id, EntryKind::Mutation, key.into(), value.into())
    }

    /// Append a deletion tombstone
    pub fn add_deletion(&self, vb_id: VbId, key: impl Into<Bytes>) -> SeqNo {
        self.append(vb_id, EntryKind::Deletion, key.into(), Bytes::new())
    }

    /// Append an expiration tombstone
    pub fn add_expiration(&self, vb_id: VbId, key: impl Into<Bytes>) -> SeqNo {
        self.append(vb_id, EntryKind::Expiration, key.into(), Bytes::new())
    }

    /// Set one replica's persisted seqno (`replica == 0` is the active copy)
    pub fn set_persisted_seq_no(&self, vb_id: VbId, replica: u8, seq_no: SeqNo) {
        self.persisted.insert((vb_id, replica), seq_no);
    }

    /// Set every replica's persisted seqno
    pub fn set_persisted_all(&self, vb_id: VbId, seq_no: SeqNo) {
        for replica in 0..=self.replica_count {
            self.persisted.insert((vb_id, replica), seq_no);
        }
    }

    /// Fail over a vbucket: new history lineage starting at `rollback_to`.
    /// Opens resuming past that point are rejected with a rollback until
    /// the caller rewinds.
    pub fn inject_rollback(&self, vb_id: VbId, rollback_to: SeqNo) {
        let mut state = self.vbuckets[vb_id as usize].state.write();
        state.vb_uuid += 1;
        let vb_uuid = state.vb_uuid;
        state.failover.insert(0, FailoverEntry { vb_uuid, seq_no: rollback_to });
        state.pending_rollback = Some(rollback_to);
    }

    /// Deliver an unsolicited `End` on an open stream, after any pending
    /// events already in the log
    pub fn trigger_stream_end(&self, vb_id: VbId, reason: EndStreamReason) {
        if let Some(stream) = self.open_streams.get(&vb_id) {
            *stream.end_reason.lock() = Some(reason);
            stream.closed.store(true, Ordering::SeqCst);
            self.vbuckets[vb_id as usize].notify.notify_waiters();
        }
    }

    /// Simulate a topology shift
    pub fn bump_config_rev(&self) {
        self.config_rev.fetch_add(1, Ordering::SeqCst);
    }

    /// Simulate TTL expiry of a metadata document
    pub fn expire_document(&self, key: &str) {
        self.documents.remove(key);
    }

    /// Number of currently open streams
    pub fn open_stream_count(&self) -> usize {
        self.open_streams.len()
    }

    pub fn current_vb_uuid(&self, vb_id: VbId) -> VbUuid {
        self.vbuckets[vb_id as usize].state.read().vb_uuid
    }

    fn entry_to_event(entry: &LogEntry, vb_id: VbId, vb_uuid: VbUuid) -> StreamEvent {
        let event = DcpEvent {
            vb_id,
            vb_uuid,
            seq_no: entry.seq_no,
            key: entry.key.clone(),
            value: entry.value.clone(),
            cas: entry.seq_no,
            collection_name: "_default".to_string(),
        };
        match entry.kind {
            EntryKind::Mutation => StreamEvent::Mutation(event),
            EntryKind::Deletion => StreamEvent::Deletion(event),
            EntryKind::Expiration => StreamEvent::Expiration(event),
        }
    }
}

/// Stream task: replays the log past the cursor, then follows live appends
/// until closed. Sends block when the sink is full, which is exactly the
/// backpressure a real connection applies through buffer acks.
#[allow(clippy::too_many_arguments)]
async fn run_stream(
    vb: Arc<VbShared>,
    open_streams: Arc<DashMap<VbId, OpenStream>>,
    vb_id: VbId,
    token: u64,
    mut cursor: SeqNo,
    closed: Arc<AtomicBool>,
    end_reason: Arc<parking_lot::Mutex<Option<EndStreamReason>>>,
    sink: mpsc::Sender<StreamEvent>,
) {
    loop {
        // Register interest before scanning so an append between the scan
        // and the await cannot be missed
        let notified = vb.notify.notified();

        let (batch, vb_uuid, high) = {
            let state = vb.state.read();
            let batch: Vec<LogEntry> =
                state.log.iter().filter(|e| e.seq_no > cursor).cloned().collect();
            (batch, state.vb_uuid, state.high_seq_no())
        };

        if !batch.is_empty() {
            let marker = StreamEvent::SnapshotMarker {
                vb_id,
                start_seq_no: batch[0].seq_no,
                end_seq_no: high,
            };
            if sink.send(marker).await.is_err() {
                break;
            }
            let mut lost_sink = false;
            for entry in &batch {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                if sink
                    .send(MockCluster::entry_to_event(entry, vb_id, vb_uuid))
                    .await
                    .is_err()
                {
                    lost_sink = true;
                    break;
                }
                cursor = entry.seq_no;
            }
            if lost_sink {
                break;
            }
            continue;
        }

        if closed.load(Ordering::SeqCst) {
            let reason = end_reason.lock().take().unwrap_or(EndStreamReason::Closed);
            let _ = sink.send(StreamEvent::End { vb_id, reason }).await;
            break;
        }

        notified.await;
    }
    // Only this incarnation's entry; a successor may already be registered
    open_streams.remove_if(&vb_id, |_, stream| stream.token == token);
}

#[async_trait]
impl CouchbaseClient for MockCluster {
    async fn ping(&self) -> Result<()> {
        if self.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DcpError::ConnectionClosed)
        }
    }

    async fn vbucket_count(&self) -> Result<u16> {
        Ok(self.vbucket_count)
    }

    async fn replica_count(&self) -> Result<u8> {
        Ok(self.replica_count)
    }

    async fn failover_log(&self, vb_id: VbId) -> Result<Vec<FailoverEntry>> {
        Ok(self.vbuckets[vb_id as usize].state.read().failover.clone())
    }

    async fn high_seq_nos(&self, vb_ids: &[VbId]) -> Result<HashMap<VbId, (VbUuid, SeqNo)>> {
        Ok(vb_ids
            .iter()
            .map(|&vb| {
                let state = self.vbuckets[vb as usize].state.read();
                (vb, (state.vb_uuid, state.high_seq_no()))
            })
            .collect())
    }

    async fn observe_seq_no(&self, vb_id: VbId, replica: u8) -> Result<ObserveResult> {
        let vb_uuid = self.vbuckets[vb_id as usize].state.read().vb_uuid;
        let persist_seq_no = self
            .persisted
            .get(&(vb_id, replica))
            .map(|r| *r.value())
            .unwrap_or(0);
        Ok(ObserveResult { vb_uuid, persist_seq_no })
    }

    async fn config_rev(&self) -> Result<u64> {
        Ok(self.config_rev.load(Ordering::SeqCst))
    }

    async fn open_stream(
        &self,
        vb_id: VbId,
        offset: Offset,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        if vb_id >= self.vbucket_count {
            return Err(DcpError::config(format!("vb {vb_id} out of range")));
        }
        if self.open_streams.contains_key(&vb_id) {
            return Err(DcpError::StreamAlreadyOpen(vb_id));
        }

        let vb = self.vbuckets[vb_id as usize].clone();
        {
            let mut state = vb.state.write();
            if let Some(rollback_to) = state.pending_rollback {
                if offset.seq_no > rollback_to {
                    return Err(DcpError::Rollback { vb_id, seq_no: rollback_to });
                }
                state.pending_rollback = None;
            }
        }

        let token = self.next_stream_token.fetch_add(1, Ordering::SeqCst);
        let closed = Arc::new(AtomicBool::new(false));
        let end_reason = Arc::new(parking_lot::Mutex::new(None));
        self.open_streams.insert(
            vb_id,
            OpenStream { token, closed: closed.clone(), end_reason: end_reason.clone() },
        );

        tokio::spawn(run_stream(
            vb,
            self.open_streams.clone(),
            vb_id,
            token,
            offset.seq_no,
            closed,
            end_reason,
            sink,
        ));
        Ok(())
    }

    async fn close_stream(&self, vb_id: VbId) -> Result<()> {
        match self.open_streams.get(&vb_id) {
            Some(stream) => {
                stream.closed.store(true, Ordering::SeqCst);
                self.vbuckets[vb_id as usize].notify.notify_waiters();
                Ok(())
            }
            None => Err(DcpError::StreamNotOpen(vb_id)),
        }
    }

    async fn get_document(&self, key: &str) -> Result<Bytes> {
        self.documents
            .get(key)
            .map(|r| r.value().clone())
            .ok_or_else(|| DcpError::not_found(key))
    }

    async fn upsert_document(&self, key: &str, value: Bytes, _ttl_secs: u32) -> Result<()> {
        self.documents.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_document(&self, key: &str) -> Result<()> {
        self.documents.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for entry in self.open_streams.iter() {
            entry.value().closed.store(true, Ordering::SeqCst);
        }
        for vb in &self.vbuckets {
            vb.notify.notify_waiters();
        }
        Ok(())
    }
}
