//! Rollback mitigation
//!
//! A failover can rewind a vbucket to the highest seqno persisted on the
//! surviving replicas. Checkpoints that ran ahead of that point would make
//! the group skip or re-deliver events after the rewind. The mitigation
//! tracks, per vbucket, the minimum persisted seqno across all replicas —
//! the quorum-safe watermark — and the checkpoint engine never advances a
//! vbucket past it.
//!
//! Two background tasks: the observe poller refreshes the watermarks on a
//! short interval, and the config watcher flushes the cache whenever the
//! cluster topology revision changes (the replica set may have shifted, so
//! cached watermarks are no longer trustworthy).

use crate::config::RollbackMitigationConfig;
use crate::couchbase::SharedClient;
use crate::offset::{SeqNo, VbId};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct MitigationInner {
    client: SharedClient,
    persisted: DashMap<VbId, SeqNo>,
    vb_ids: RwLock<Vec<VbId>>,
}

pub struct RollbackMitigation {
    inner: Arc<MitigationInner>,
    disabled: bool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RollbackMitigation {
    /// Start the observe poller and the config watcher.
    /// `disabled` skips both; the gate is then always open.
    pub fn start(client: SharedClient, config: &RollbackMitigationConfig) -> Self {
        let inner = Arc::new(MitigationInner {
            client,
            persisted: DashMap::new(),
            vb_ids: RwLock::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(2);
        if !config.disabled {
            let observe_inner = inner.clone();
            let observe_interval = config.interval();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(observe_interval);
                loop {
                    ticker.tick().await;
                    observe_inner.observe_cycle().await;
                }
            }));

            let watch_inner = inner.clone();
            let watch_interval = config.config_watch_interval();
            handles.push(tokio::spawn(async move {
                let mut last_rev = None;
                let mut ticker = tokio::time::interval(watch_interval);
                loop {
                    ticker.tick().await;
                    match watch_inner.client.config_rev().await {
                        Ok(rev) => {
                            if last_rev.is_some() && last_rev != Some(rev) {
                                warn!("topology changed (rev {rev}), flushing persisted cache");
                                watch_inner.persisted.clear();
                            }
                            last_rev = Some(rev);
                        }
                        Err(e) => debug!("config watch failed: {e}"),
                    }
                }
            }));
        }

        Self {
            inner,
            disabled: config.disabled,
            handles: Mutex::new(handles),
        }
    }

    /// Replace the observed vbucket set after a rebalance
    pub fn set_vbuckets(&self, vb_ids: Vec<VbId>) {
        self.inner
            .persisted
            .retain(|vb, _| vb_ids.contains(vb));
        *self.inner.vb_ids.write() = vb_ids;
    }

    /// Record a known-persisted seqno for a vbucket
    pub fn mark_persisted(&self, vb_id: VbId, seq_no: SeqNo) {
        self.inner.persisted.insert(vb_id, seq_no);
    }

    /// The quorum-safe watermark, if observed yet
    pub fn persisted_seq_no(&self, vb_id: VbId) -> Option<SeqNo> {
        self.inner.persisted.get(&vb_id).map(|r| *r.value())
    }

    /// May the checkpoint for `vb_id` advance to `seq_no`?
    pub fn can_advance_to(&self, vb_id: VbId, seq_no: SeqNo) -> bool {
        if self.disabled {
            return true;
        }
        seq_no <= self.persisted_seq_no(vb_id).unwrap_or(0)
    }

    /// Clamp a desired checkpoint seqno to the watermark
    pub fn gate(&self, vb_id: VbId, desired: SeqNo) -> SeqNo {
        if self.disabled {
            return desired;
        }
        desired.min(self.persisted_seq_no(vb_id).unwrap_or(0))
    }

    pub async fn close(&self) {
        for handle in self.handles.lock().await.drain(..) {
            handle.abort();
        }
    }
}

impl MitigationInner {
    /// One observe round: watermark = min persisted seqno over all replicas
    async fn observe_cycle(&self) {
        let vb_ids = self.vb_ids.read().clone();
        if vb_ids.is_empty() {
            return;
        }

        let replica_count = match self.client.replica_count().await {
            Ok(count) => count,
            Err(e) => {
                debug!("replica count unavailable: {e}");
                return;
            }
        };

        for vb_id in vb_ids {
            let mut minimum: Option<SeqNo> = None;
            let mut failed = false;
            for replica in 0..=replica_count {
                match self.client.observe_seq_no(vb_id, replica).await {
                    Ok(observed) => {
                        minimum = Some(match minimum {
                            Some(current) => current.min(observed.persist_seq_no),
                            None => observed.persist_seq_no,
                        });
                    }
                    Err(e) => {
                        debug!("observe vb {vb_id} replica {replica} failed: {e}");
                        failed = true;
                        break;
                    }
                }
            }
            // A partial view could overstate the watermark; keep the old one
            if !failed {
                if let Some(watermark) = minimum {
                    self.persisted.insert(vb_id, watermark);
                }
            }
        }
    }
}
