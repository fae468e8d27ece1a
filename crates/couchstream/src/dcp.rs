//! Orchestrator
//!
//! Wires membership → discovery → checkpoints → streams and owns startup
//! and shutdown ordering. [`Dcp::start`] runs until the process is asked to
//! stop — by [`Dcp::close`], by SIGTERM/ctrl-c, or by a fatal condition
//! raised on the bus — then tears everything down in reverse order with a
//! final checkpoint flush.
//!
//! Membership models arrive on the bus and are forwarded into a watch
//! channel; a single assignment task turns each one into a stream
//! rebalance. The watch keeps only the newest model, so a burst of
//! membership changes collapses into one rebalance (single-flight with
//! coalescing).

use crate::api::{Api, ApiState};
use crate::bus::{Bus, Event};
use crate::checkpoint::CheckpointTracker;
use crate::config::{CheckpointType, DcpConfig, MembershipType};
use crate::couchbase::SharedClient;
use crate::discovery::VBucketDiscovery;
use crate::error::{DcpError, Result};
use crate::membership::{
    new_membership, HaMembership, HaTiming, Identity, LeadershipState, Model, SharedMembership,
};
use crate::metadata::{new_metadata_store, SharedMetadataStore};
use crate::metrics::MembershipMetrics;
use crate::offset::{Offset, VbId};
use crate::rollback::RollbackMitigation;
use crate::stream::{Listener, Stream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct Dcp {
    config: DcpConfig,
    client: SharedClient,
    bus: Bus,
    metadata: SharedMetadataStore,
    mitigation: Arc<RollbackMitigation>,
    checkpoint: Arc<CheckpointTracker>,
    stream: Arc<Stream>,
    assignment_tx: watch::Sender<Option<Model>>,
    assignment_rx: watch::Receiver<Option<Model>>,
    shutdown_tx: watch::Sender<bool>,
    fatal: Arc<AtomicBool>,
    leadership: Option<watch::Receiver<LeadershipState>>,
    membership: Mutex<Option<SharedMembership>>,
    ha: Mutex<Option<Arc<HaMembership>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dcp {
    /// Wire a client instance. Streaming begins with [`start`](Self::start).
    pub fn new(config: DcpConfig, client: SharedClient, listener: Listener) -> Result<Self> {
        Self::build(config, client, listener, None)
    }

    /// Like [`new`](Self::new) for `kubernetesHa` membership: the external
    /// lease backend reports transitions through `leadership`.
    pub fn with_leadership(
        config: DcpConfig,
        client: SharedClient,
        listener: Listener,
        leadership: watch::Receiver<LeadershipState>,
    ) -> Result<Self> {
        Self::build(config, client, listener, Some(leadership))
    }

    fn build(
        config: DcpConfig,
        client: SharedClient,
        listener: Listener,
        leadership: Option<watch::Receiver<LeadershipState>>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = Bus::new();
        let metadata = new_metadata_store(&config, client.clone())?;
        let mitigation = Arc::new(RollbackMitigation::start(
            client.clone(),
            &config.rollback_mitigation,
        ));
        let checkpoint = CheckpointTracker::new(
            metadata.clone(),
            client.clone(),
            mitigation.clone(),
            config.checkpoint.auto_reset,
        );
        let stream = Stream::new(
            client.clone(),
            checkpoint.clone(),
            mitigation.clone(),
            listener,
            config.dcp.listener.buffer_size,
        );

        let (assignment_tx, assignment_rx) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        let fatal = Arc::new(AtomicBool::new(false));

        // Bus events funnel into the watch channels; the newest model
        // supersedes anything still queued
        {
            let assignment_tx = assignment_tx.clone();
            let shutdown_tx = shutdown_tx.clone();
            let fatal = fatal.clone();
            bus.subscribe(move |event| match event {
                Event::MembershipChanged(model) => {
                    let _ = assignment_tx.send(Some(*model));
                }
                Event::MembershipLost => {
                    let _ = assignment_tx.send(None);
                }
                Event::RebalanceRequested => {
                    // Re-trigger the current assignment
                    assignment_tx.send_modify(|_| {});
                }
                Event::ShutdownRequested => {
                    fatal.store(true, Ordering::SeqCst);
                    let _ = shutdown_tx.send(true);
                }
            });
        }

        Ok(Self {
            config,
            client,
            bus,
            metadata,
            mitigation,
            checkpoint,
            stream,
            assignment_tx,
            assignment_rx,
            shutdown_tx,
            fatal,
            leadership,
            membership: Mutex::new(None),
            ha: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Run the client until shutdown. Returns `Err` only for fatal
    /// conditions; a requested close or a SIGTERM resolves to `Ok`.
    pub async fn start(&self) -> Result<()> {
        let vbucket_count = self.client.vbucket_count().await?;
        info!(
            "starting group {} over {vbucket_count} vbuckets",
            self.config.group_name()
        );

        let membership = self.build_membership().await?;
        MembershipMetrics::set_membership_type(membership.type_name());
        let model = membership.get_info().await?;
        *self.membership.lock().await = Some(membership);

        let discovery = Arc::new(VBucketDiscovery::new(vbucket_count, model));
        self.spawn_assignment_task(discovery).await;
        // The forwarder may have seen the first emission already; sending
        // again is harmless (a same-target rebalance is a no-op)
        let _ = self.assignment_tx.send(Some(model));

        if self.config.checkpoint.checkpoint_type == CheckpointType::Auto {
            self.checkpoint.start_flusher(self.config.checkpoint.interval()).await;
        }

        if !self.config.health_check.disabled {
            let client = self.client.clone();
            let interval = self.config.health_check.interval();
            let timeout = self.config.health_check.timeout();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match tokio::time::timeout(timeout, client.ping()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("health check failed: {e}"),
                        Err(_) => warn!("health check timed out after {timeout:?}"),
                    }
                }
            });
            self.tasks.lock().await.push(handle);
        }

        let api = if self.config.api.disabled {
            None
        } else {
            let state = ApiState {
                client: self.client.clone(),
                stream: self.stream.clone(),
                bus: self.bus.clone(),
                ha: self.ha.lock().await.clone(),
                debug: self.config.debug,
                health_check_disabled: self.config.health_check.disabled,
                metric_path: self.config.metric.path.clone(),
            };
            match Api::start(self.config.api.port, state).await {
                Ok(api) => Some(api),
                Err(e) => {
                    warn!("api did not start: {e}");
                    None
                }
            }
        };

        self.wait_for_shutdown().await;

        // Teardown mirrors the boot order. The assignment task dies first
        // so a late membership emission cannot reopen closing streams.
        if let Some(api) = api {
            api.shutdown().await;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Err(e) = self.stream.close().await {
            warn!("stream close failed: {e}");
        }
        self.checkpoint.stop(self.config.checkpoint.timeout()).await;
        self.mitigation.close().await;
        if let Some(membership) = self.membership.lock().await.take() {
            membership.close().await;
        }
        if let Err(e) = self.metadata.close().await {
            warn!("metadata close failed: {e}");
        }
        if let Err(e) = self.client.close().await {
            warn!("client close failed: {e}");
        }

        if self.fatal.load(Ordering::SeqCst) {
            error!("terminated by fatal condition");
            return Err(DcpError::fatal("terminated by fatal condition"));
        }
        info!("stopped cleanly");
        Ok(())
    }

    async fn build_membership(&self) -> Result<SharedMembership> {
        if self.config.membership().membership_type == MembershipType::KubernetesHa {
            let leadership = self.leadership.clone().ok_or_else(|| {
                DcpError::config("kubernetesHa membership requires Dcp::with_leadership")
            })?;
            let ha = Arc::new(HaMembership::start(
                Identity::from_env(),
                self.config.leader_election.rpc.port,
                self.config.membership().rebalance_delay(),
                self.bus.clone(),
                leadership,
                HaTiming::default(),
            ));
            *self.ha.lock().await = Some(ha.clone());
            Ok(ha)
        } else {
            new_membership(&self.config, self.bus.clone(), self.metadata.clone())
        }
    }

    /// One task owns all rebalances; the watch gives latest-wins coalescing
    async fn spawn_assignment_task(&self, discovery: Arc<VBucketDiscovery>) {
        let mut rx = self.assignment_rx.clone();
        let stream = self.stream.clone();
        let handle = tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                let target = *rx.borrow_and_update();
                match target {
                    Some(model) => {
                        discovery.set_members(model);
                        MembershipMetrics::set_model(model);
                        let vbuckets = discovery.get_vbuckets();
                        if let Err(e) = stream.rebalance_to(vbuckets).await {
                            error!("rebalance failed: {e}");
                        }
                    }
                    None => {
                        if let Err(e) = stream.rebalance_to(Vec::new()).await {
                            error!("stream pause failed: {e}");
                        }
                    }
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    async fn wait_for_shutdown(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let wait_signal = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        tokio::select! {
                            _ = sigterm.recv() => {}
                            _ = tokio::signal::ctrl_c() => {}
                        }
                    }
                    Err(_) => {
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
        };

        tokio::select! {
            _ = async {
                while !*shutdown_rx.borrow_and_update() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {}
            _ = wait_signal => {
                info!("termination signal received");
            }
        }
    }

    /// Request an orderly stop; `start` resolves shortly after
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Trigger a redistribution of vbuckets
    pub fn rebalance(&self) {
        self.bus.publish(Event::RebalanceRequested);
    }

    /// In-memory offsets (debug)
    pub fn get_offsets(&self) -> HashMap<VbId, Offset> {
        self.stream.get_offsets()
    }

    /// The event bus, for embedding applications that subscribe to
    /// membership transitions
    pub fn bus(&self) -> &Bus {
        &self.bus
    }
}
