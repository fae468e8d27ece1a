//! Self-organizing membership
//!
//! A leaderless registry in the metadata store. Each instance writes a
//! short-TTL instance document and keeps itself listed in a shared index
//! document; the sorted list of live instances IS the membership. There is
//! no coordination channel between instances — the index is the single
//! source of truth and each instance derives its own position from it.
//!
//! Lifecycle per instance:
//! 1. register: upsert `(id -> cluster_join_time)` into the index, write
//!    the instance document with a 10s TTL
//! 2. heartbeat every 5s: rewrite the instance document, renewing the TTL
//! 3. monitor every 500ms (after the rebalance delay): read the index,
//!    fetch every listed instance, drop the ones whose heartbeat is older
//!    than the 2s tolerance, sort survivors by join time (ties broken by
//!    id), and emit the resulting model if it differs from the last one
//!
//! An instance that cannot find itself among the survivors has lost its own
//! document — it cannot safely keep claiming vbuckets, so that is fatal.

use super::{Membership, Model};
use crate::bus::{Bus, Event};
use crate::config::DcpConfig;
use crate::error::{DcpError, Result};
use crate::metadata::{MetadataKeys, SharedMetadataStore};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Registry document of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(rename = "type")]
    pub doc_type: String,
    /// Epoch nanoseconds of the last heartbeat
    pub heartbeat_time: i64,
    /// Epoch nanoseconds of first registration; the sort key
    pub cluster_join_time: i64,
}

const INSTANCE_TYPE: &str = "instance";

/// Registry timing; production values match the protocol's conventions,
/// tests shrink them to keep the suite fast
#[derive(Debug, Clone, Copy)]
pub struct MembershipTiming {
    pub expiry_secs: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_tolerance: Duration,
    pub monitor_interval: Duration,
}

impl Default for MembershipTiming {
    fn default() -> Self {
        Self {
            expiry_secs: 10,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_tolerance: Duration::from_secs(2),
            monitor_interval: Duration::from_millis(500),
        }
    }
}

struct Inner {
    id: String,
    keys: MetadataKeys,
    metadata: SharedMetadataStore,
    bus: Bus,
    timing: MembershipTiming,
    model_tx: watch::Sender<Option<Model>>,
    /// Sorted ids of the instances counted at the last emission
    last_active: Mutex<Vec<String>>,
    /// Epoch nanos of our registration; 0 until registered
    cluster_join_time: std::sync::atomic::AtomicI64,
}

pub struct CouchbaseMembership {
    inner: Arc<Inner>,
    model_rx: watch::Receiver<Option<Model>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CouchbaseMembership {
    /// Register this instance and start the heartbeat and monitor tasks
    pub fn start(
        config: &DcpConfig,
        bus: Bus,
        metadata: SharedMetadataStore,
        timing: MembershipTiming,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self::start_with_id(config, bus, metadata, timing, id)
    }

    /// Like [`start`](Self::start) with a caller-chosen instance id
    /// (deterministic tests)
    pub fn start_with_id(
        config: &DcpConfig,
        bus: Bus,
        metadata: SharedMetadataStore,
        timing: MembershipTiming,
        id: String,
    ) -> Self {
        let (model_tx, model_rx) = watch::channel(None);
        let inner = Arc::new(Inner {
            id,
            keys: MetadataKeys::new(config.group_name()),
            metadata,
            bus,
            timing,
            model_tx,
            last_active: Mutex::new(Vec::new()),
            cluster_join_time: std::sync::atomic::AtomicI64::new(0),
        });

        let rebalance_delay = config.membership().rebalance_delay();
        let mut handles = Vec::with_capacity(2);

        let register_inner = inner.clone();
        handles.push(tokio::spawn(async move {
            let cluster_join_time = match register_inner.register().await {
                Ok(t) => t,
                Err(e) => {
                    error!("membership registration failed: {e}");
                    register_inner.bus.publish(Event::ShutdownRequested);
                    return;
                }
            };
            register_inner.run_heartbeat(cluster_join_time).await;
        }));

        let monitor_inner = inner.clone();
        handles.push(tokio::spawn(async move {
            info!("membership monitor will start after {rebalance_delay:?}");
            tokio::time::sleep(rebalance_delay).await;
            monitor_inner.run_monitor().await;
        }));

        Self {
            inner,
            model_rx,
            handles: Mutex::new(handles),
        }
    }

    /// Instance id in the registry
    pub fn instance_id(&self) -> &str {
        &self.inner.id
    }
}

impl Inner {
    /// Write the index entry and the instance document; returns the join time
    async fn register(&self) -> Result<i64> {
        let now = now_nanos();

        // Upsert ourselves into the index, creating it on first ever start
        let mut index = match self.read_index().await {
            Ok(index) => index,
            Err(e) if e.is_not_found() => HashMap::new(),
            Err(e) => return Err(e),
        };
        index.insert(self.id.clone(), now);
        self.write_index(&index).await?;

        self.write_instance(now, now).await?;
        self.cluster_join_time
            .store(now, std::sync::atomic::Ordering::SeqCst);
        info!("registered instance {} at {now}", self.id);
        Ok(now)
    }

    async fn run_heartbeat(&self, cluster_join_time: i64) {
        let mut ticker = tokio::time::interval(self.timing.heartbeat_interval);
        ticker.tick().await; // first tick completes immediately
        loop {
            ticker.tick().await;
            if let Err(e) = self.write_instance(now_nanos(), cluster_join_time).await {
                warn!("heartbeat failed: {e}");
            }
        }
    }

    async fn run_monitor(&self) {
        let mut ticker = tokio::time::interval(self.timing.monitor_interval);
        loop {
            ticker.tick().await;
            match self.monitor().await {
                Ok(true) => continue,
                Ok(false) => return, // fatal, stop monitoring
                Err(e) => {
                    // Read failures skip the cycle; the registry is still
                    // authoritative, we just could not see it this round
                    warn!("membership monitor cycle skipped: {e}");
                }
            }
        }
    }

    /// One monitor cycle. `Ok(false)` means this instance is gone from the
    /// registry and must stop.
    async fn monitor(&self) -> Result<bool> {
        let join_time = self.cluster_join_time.load(std::sync::atomic::Ordering::SeqCst);
        if join_time == 0 {
            // Registration has not completed yet
            return Ok(true);
        }

        let index = self.read_index().await?;

        // A concurrent full-document index rewrite can momentarily drop a
        // freshly registered peer; as long as our own document is alive we
        // re-assert our entry rather than treating it as expiry
        if !index.contains_key(&self.id) {
            warn!("instance {} missing from index, re-asserting", self.id);
            let mut healed = index.clone();
            healed.insert(self.id.clone(), join_time);
            self.write_index(&healed).await?;
            return Ok(true);
        }

        // Join-time order, ties broken by id for determinism
        let mut ids: Vec<(String, i64)> = index.into_iter().map(|(id, t)| (id, t)).collect();
        ids.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut fetches = JoinSet::new();
        for (position, (id, join_time)) in ids.iter().cloned().enumerate() {
            let metadata = self.metadata.clone();
            let key = self.keys.instance(&id);
            fetches.spawn(async move {
                match metadata.get_raw(&key).await {
                    Ok(raw) => match serde_json::from_slice::<Instance>(&raw) {
                        Ok(instance) => Ok((position, id, join_time, Some(instance))),
                        Err(e) => Err(DcpError::from(e)),
                    },
                    Err(e) if e.is_not_found() => Ok((position, id, join_time, None)),
                    Err(e) => Err(e),
                }
            });
        }

        let now = now_nanos();
        let tolerance = self.timing.heartbeat_tolerance.as_nanos() as i64;
        let mut alive: Vec<(usize, String, i64)> = Vec::with_capacity(ids.len());
        while let Some(joined) = fetches.join_next().await {
            let (position, id, join_time, instance) =
                joined.map_err(|e| DcpError::membership(e.to_string()))??;
            match instance {
                Some(instance) if now - instance.heartbeat_time < tolerance => {
                    alive.push((position, id, join_time));
                }
                Some(_) => debug!("instance {id} is not alive"),
                None => debug!("instance {id} expired"),
            }
        }
        alive.sort_by_key(|(position, _, _)| *position);

        let alive_ids: Vec<String> = alive.iter().map(|(_, id, _)| id.clone()).collect();
        let mut last_active = self.last_active.lock().await;
        if alive_ids == *last_active {
            return Ok(true);
        }

        let Some(position) = alive_ids.iter().position(|id| id == &self.id) else {
            // Our own document expired; another instance may already own
            // our vbuckets, so continuing would double-stream them
            error!("instance {} lost from the active set, shutting down", self.id);
            self.bus.publish(Event::ShutdownRequested);
            return Ok(false);
        };

        *last_active = alive_ids;
        drop(last_active);

        let model = Model::new(position as u16 + 1, alive.len() as u16);
        let previous = *self.model_tx.borrow();
        if model.is_changed(previous) {
            info!("membership changed: {model}");
            let _ = self.model_tx.send(Some(model));
            self.bus.publish(Event::MembershipChanged(model));
        }

        // Garbage-collect the index down to the survivors
        let survivors: HashMap<String, i64> = alive
            .into_iter()
            .map(|(_, id, join_time)| (id, join_time))
            .collect();
        if let Err(e) = self.write_index(&survivors).await {
            warn!("index garbage collection failed: {e}");
        }

        Ok(true)
    }

    async fn read_index(&self) -> Result<HashMap<String, i64>> {
        let raw = self.metadata.get_raw(&self.keys.instance_index()).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn write_index(&self, index: &HashMap<String, i64>) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(index)?);
        self.metadata
            .set_raw(&self.keys.instance_index(), payload, 0)
            .await
    }

    async fn write_instance(&self, heartbeat_time: i64, cluster_join_time: i64) -> Result<()> {
        let instance = Instance {
            doc_type: INSTANCE_TYPE.to_string(),
            heartbeat_time,
            cluster_join_time,
        };
        let payload = Bytes::from(serde_json::to_vec(&instance)?);
        self.metadata
            .set_raw(&self.keys.instance(&self.id), payload, self.timing.expiry_secs)
            .await
    }
}

fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[async_trait]
impl Membership for CouchbaseMembership {
    async fn get_info(&self) -> Result<Model> {
        let mut rx = self.model_rx.clone();
        loop {
            if let Some(model) = *rx.borrow_and_update() {
                return Ok(model);
            }
            rx.changed()
                .await
                .map_err(|_| DcpError::membership("membership closed before first model"))?;
        }
    }

    async fn close(&self) {
        for handle in self.handles.lock().await.drain(..) {
            handle.abort();
        }
        // Leave the instance document to its TTL; peers will reap us
    }

    fn type_name(&self) -> &'static str {
        "couchbase"
    }
}
