//! Checkpoint engine
//!
//! Tracks, per owned vbucket, the offset the consumer has acked and
//! persists it to the metadata store on an interval and on stop. Two rules
//! keep restarts honest:
//!
//! - a checkpoint never advances past the rollback-mitigation watermark,
//!   so a failover rewind can never land behind a persisted offset
//! - a checkpoint never advances past the consumer's last ack, so a crash
//!   re-delivers rather than skips (at-least-once)
//!
//! Saves are idempotent: an offset equal to the last persisted one is
//! skipped, and rewriting the same value is harmless.
//!
//! The in-memory table sits behind a short-critical-section lock so acks
//! coming from the consumer callback stay synchronous; only load and flush
//! touch the store.

use crate::config::AutoReset;
use crate::couchbase::SharedClient;
use crate::error::Result;
use crate::metadata::SharedMetadataStore;
use crate::metrics::CheckpointMetrics;
use crate::offset::{Offset, SeqNo, Snapshot, VbId, VbUuid};
use crate::rollback::RollbackMitigation;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct VbCheckpoint {
    /// Lineage and snapshot bounds as last delivered by the server;
    /// `offset.seq_no` tracks the consumer's acks
    offset: Offset,
    /// Highest seqno the consumer has acked
    acked_seq_no: SeqNo,
    /// What the store currently holds, for skipping no-op saves
    last_saved: Option<Offset>,
}

pub struct CheckpointTracker {
    metadata: SharedMetadataStore,
    client: SharedClient,
    mitigation: Arc<RollbackMitigation>,
    auto_reset: AutoReset,
    state: RwLock<HashMap<VbId, VbCheckpoint>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointTracker {
    pub fn new(
        metadata: SharedMetadataStore,
        client: SharedClient,
        mitigation: Arc<RollbackMitigation>,
        auto_reset: AutoReset,
    ) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            client,
            mitigation,
            auto_reset,
            state: RwLock::new(HashMap::new()),
            flusher: Mutex::new(None),
        })
    }

    /// Load offsets for an assignment, applying the auto-reset policy to
    /// vbuckets with no saved record. Returns the offsets to open streams at.
    pub async fn load(&self, vb_ids: &[VbId]) -> Result<HashMap<VbId, Offset>> {
        let saved = self.metadata.load(vb_ids).await?;

        let missing: Vec<VbId> =
            vb_ids.iter().copied().filter(|vb| !saved.contains_key(vb)).collect();
        let mut fresh: HashMap<VbId, Offset> = HashMap::new();
        if !missing.is_empty() {
            match self.auto_reset {
                AutoReset::Earliest => {
                    for &vb in &missing {
                        fresh.insert(vb, Offset::earliest());
                    }
                }
                AutoReset::Latest => {
                    let highs = self.client.high_seq_nos(&missing).await?;
                    for &vb in &missing {
                        let (vb_uuid, high) = highs.get(&vb).copied().unwrap_or((0, 0));
                        fresh.insert(vb, Offset::latest(vb_uuid, high));
                    }
                }
            }
            info!(
                "no checkpoint for {} of {} vbuckets, reset to {:?}",
                missing.len(),
                vb_ids.len(),
                self.auto_reset
            );
        }

        let mut state = self.state.write();
        let mut offsets = HashMap::with_capacity(vb_ids.len());
        for &vb in vb_ids {
            let (offset, last_saved) = match saved.get(&vb) {
                Some(offset) => (*offset, Some(*offset)),
                None => (fresh[&vb], None),
            };
            state.insert(
                vb,
                VbCheckpoint { offset, acked_seq_no: offset.seq_no, last_saved },
            );
            offsets.insert(vb, offset);
        }
        Ok(offsets)
    }

    /// Record the snapshot bounds announced for a vbucket
    pub fn update_snapshot(&self, vb_id: VbId, start_seq_no: SeqNo, end_seq_no: SeqNo) {
        if let Some(checkpoint) = self.state.write().get_mut(&vb_id) {
            checkpoint.offset.snapshot = Snapshot::new(start_seq_no, end_seq_no);
        }
    }

    /// Record the lineage events are arriving under
    pub fn update_vb_uuid(&self, vb_id: VbId, vb_uuid: VbUuid) {
        if let Some(checkpoint) = self.state.write().get_mut(&vb_id) {
            checkpoint.offset.vb_uuid = vb_uuid;
        }
    }

    /// Consumer ack for one event; acks are monotonic per vbucket
    pub fn ack(&self, vb_id: VbId, seq_no: SeqNo) {
        if let Some(checkpoint) = self.state.write().get_mut(&vb_id) {
            if seq_no > checkpoint.acked_seq_no {
                checkpoint.acked_seq_no = seq_no;
                checkpoint.offset.seq_no = seq_no;
            }
        }
    }

    /// The offset a vbucket stream would resume from right now
    pub fn current_offset(&self, vb_id: VbId) -> Option<Offset> {
        self.state.read().get(&vb_id).map(|c| c.offset)
    }

    /// Rewrite a vbucket's offset to a server-supplied rewind point and
    /// persist it before the stream is reopened
    pub async fn rollback(&self, vb_id: VbId, seq_no: SeqNo, vb_uuid: VbUuid) -> Result<()> {
        let offset = Offset::new(vb_uuid, seq_no, Snapshot::new(seq_no, seq_no));
        self.state.write().insert(
            vb_id,
            VbCheckpoint { offset, acked_seq_no: seq_no, last_saved: None },
        );

        let mut single = HashMap::with_capacity(1);
        single.insert(vb_id, offset);
        self.metadata.save(&single).await?;

        if let Some(checkpoint) = self.state.write().get_mut(&vb_id) {
            checkpoint.last_saved = Some(offset);
        }
        warn!("checkpoint for vb {vb_id} rolled back to seq {seq_no}");
        Ok(())
    }

    /// The offset a vbucket is allowed to persist right now
    fn persistable(&self, vb_id: VbId, checkpoint: &VbCheckpoint) -> Offset {
        let gated = self.mitigation.gate(vb_id, checkpoint.acked_seq_no);
        let mut offset = checkpoint.offset;
        offset.seq_no = gated;
        // A clamp below the current snapshot degenerates to a point
        // snapshot so the resume position stays self-consistent
        if gated < offset.snapshot.start_seq_no {
            offset.snapshot = Snapshot::new(gated, gated);
        }
        offset
    }

    /// Persist every vbucket whose permitted offset moved since last save
    pub async fn flush(&self) -> Result<usize> {
        let vb_ids: Vec<VbId> = self.state.read().keys().copied().collect();
        self.flush_vbuckets(&vb_ids).await
    }

    /// Persist a subset (departing streams flush before closing)
    pub async fn flush_vbuckets(&self, vb_ids: &[VbId]) -> Result<usize> {
        let mut to_save = HashMap::new();
        {
            let state = self.state.read();
            for &vb in vb_ids {
                if let Some(checkpoint) = state.get(&vb) {
                    let offset = self.persistable(vb, checkpoint);
                    if checkpoint.last_saved != Some(offset) {
                        to_save.insert(vb, offset);
                    }
                }
            }
        }
        if to_save.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        self.metadata.save(&to_save).await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        CheckpointMetrics::record_offset_write(to_save.len(), elapsed_ms);
        debug!("flushed {} checkpoints in {elapsed_ms:.1}ms", to_save.len());

        let mut state = self.state.write();
        for (vb, offset) in to_save.iter() {
            if let Some(checkpoint) = state.get_mut(vb) {
                checkpoint.last_saved = Some(*offset);
            }
        }
        Ok(to_save.len())
    }

    /// Forget vbuckets that moved to another member. Call after their
    /// final flush.
    pub fn drop_vbuckets(&self, vb_ids: &[VbId]) {
        let mut state = self.state.write();
        for vb in vb_ids {
            state.remove(vb);
        }
    }

    /// Current in-memory offsets (API debug surface)
    pub fn get_offsets(&self) -> HashMap<VbId, Offset> {
        self.state
            .read()
            .iter()
            .map(|(vb, checkpoint)| (*vb, checkpoint.offset))
            .collect()
    }

    /// Start the interval flusher (`checkpoint.type = auto`)
    pub async fn start_flusher(self: &Arc<Self>, interval: Duration) {
        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = tracker.flush().await {
                    warn!("checkpoint flush failed: {e}");
                }
            }
        });
        *self.flusher.lock().await = Some(handle);
    }

    /// Stop the flusher and write a final checkpoint, bounded by `timeout`
    pub async fn stop(&self, timeout: Duration) {
        if let Some(handle) = self.flusher.lock().await.take() {
            handle.abort();
        }
        match tokio::time::timeout(timeout, self.flush()).await {
            Ok(Ok(flushed)) => info!("final checkpoint flush wrote {flushed} offsets"),
            Ok(Err(e)) => warn!("final checkpoint flush failed: {e}"),
            Err(_) => warn!("final checkpoint flush timed out after {timeout:?}"),
        }
    }
}
