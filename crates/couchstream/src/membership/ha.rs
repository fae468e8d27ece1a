//! Leader-elected membership
//!
//! An external lease backend (Kubernetes lease or equivalent) decides who
//! leads; this module only consumes the resulting [`LeadershipState`]
//! transitions. The leader keeps a registry of connected followers and
//! hands each one its `(member_number, total_members)` over a JSON-lines
//! RPC channel; followers apply whatever they are told. The leader itself
//! is always member 1, followers are numbered in name order.
//!
//! RPC surface: `Ping`/`Pong` liveness, `Register` (follower announces
//! itself), `Rebalance` (leader assigns a model), `Reconnect`, `Close`.
//! The transport is a plain TCP connection per follower, opened by the
//! follower toward the leader's RPC port.
//!
//! On leader loss a follower has no valid assignment; it closes its
//! streams and idles until a new leader re-assigns it.

use super::{Identity, Membership, Model};
use crate::bus::{Bus, Event};
use crate::error::{DcpError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

/// What the external elector currently says about this instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipState {
    Leader,
    Follower { leader_address: String },
    /// No leader known; followers must not stream
    Unknown,
}

/// One RPC message, serialized as a single JSON line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Frame {
    Ping,
    Pong,
    Register { name: String },
    Rebalance { member_number: u16, total_members: u16 },
    Reconnect,
    Close,
}

struct Service {
    tx: mpsc::Sender<Frame>,
    last_seen: parking_lot::Mutex<Instant>,
}

/// Leader-side registry of connected followers
#[derive(Default)]
pub struct ServiceDiscovery {
    services: DashMap<String, Service>,
}

impl ServiceDiscovery {
    fn add(&self, name: String, tx: mpsc::Sender<Frame>) {
        info!("follower {name} registered");
        self.services.insert(
            name,
            Service { tx, last_seen: parking_lot::Mutex::new(Instant::now()) },
        );
    }

    fn remove(&self, name: &str) {
        if self.services.remove(name).is_some() {
            info!("follower {name} removed");
        }
    }

    fn remove_all(&self) {
        self.services.clear();
    }

    fn touch(&self, name: &str) {
        if let Some(service) = self.services.get(name) {
            *service.last_seen.lock() = Instant::now();
        }
    }

    fn send(&self, name: &str, frame: Frame) {
        if let Some(service) = self.services.get(name) {
            if service.tx.try_send(frame).is_err() {
                warn!("follower {name} channel full or closed");
            }
        }
    }

    /// Ping every follower and drop the ones silent past `stale_after`
    fn sweep(&self, stale_after: Duration) {
        let mut stale = Vec::new();
        for entry in self.services.iter() {
            if entry.value().last_seen.lock().elapsed() > stale_after {
                stale.push(entry.key().clone());
            } else {
                let _ = entry.value().tx.try_send(Frame::Ping);
            }
        }
        for name in stale {
            warn!("follower {name} is silent, removing");
            self.remove(&name);
        }
    }

    /// Follower names in deterministic (assignment) order
    pub fn get_all(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Ticker cadence; tests shrink it
#[derive(Debug, Clone, Copy)]
pub struct HaTiming {
    pub heartbeat_interval: Duration,
    pub monitor_interval: Duration,
}

impl Default for HaTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(5),
        }
    }
}

struct HaInner {
    identity: Identity,
    bus: Bus,
    timing: HaTiming,
    services: Arc<ServiceDiscovery>,
    am_leader: AtomicBool,
    model_tx: watch::Sender<Option<Model>>,
}

impl HaInner {
    /// Apply a model, suppressing duplicates
    fn set_model(&self, model: Model) {
        let previous = *self.model_tx.borrow();
        if model.is_changed(previous) {
            info!("membership assigned: {model}");
            let _ = self.model_tx.send(Some(model));
            self.bus.publish(Event::MembershipChanged(model));
        }
    }

    /// Leader tick: renumber self and every follower
    fn assign(&self) {
        let names = self.services.get_all();
        let total_members = names.len() as u16 + 1;
        self.set_model(Model::new(1, total_members));
        for (index, name) in names.iter().enumerate() {
            self.services.send(
                name,
                Frame::Rebalance {
                    member_number: index as u16 + 2,
                    total_members,
                },
            );
        }
    }

    fn drop_assignment(&self) {
        if self.model_tx.borrow().is_some() {
            warn!("leader lost, streams pause until re-assignment");
            let _ = self.model_tx.send(None);
            self.bus.publish(Event::MembershipLost);
        }
    }
}

pub struct HaMembership {
    inner: Arc<HaInner>,
    model_rx: watch::Receiver<Option<Model>>,
    rpc_addr_rx: watch::Receiver<Option<SocketAddr>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl HaMembership {
    /// Start the RPC server and react to elector transitions.
    ///
    /// `rpc_port` 0 binds an ephemeral port (tests); the bound address is
    /// available through [`rpc_addr`](Self::rpc_addr).
    pub fn start(
        identity: Identity,
        rpc_port: u16,
        rebalance_delay: Duration,
        bus: Bus,
        leadership: watch::Receiver<LeadershipState>,
        timing: HaTiming,
    ) -> Self {
        let (model_tx, model_rx) = watch::channel(None);
        let (rpc_addr_tx, rpc_addr_rx) = watch::channel(None);
        let inner = Arc::new(HaInner {
            identity,
            bus,
            timing,
            services: Arc::new(ServiceDiscovery::default()),
            am_leader: AtomicBool::new(false),
            model_tx,
        });

        let mut handles = Vec::with_capacity(4);
        handles.push(tokio::spawn(run_rpc_server(inner.clone(), rpc_port, rpc_addr_tx)));
        handles.push(tokio::spawn(run_leadership(inner.clone(), leadership)));
        handles.push(tokio::spawn(run_leader_tickers(inner.clone(), rebalance_delay)));

        Self {
            inner,
            model_rx,
            rpc_addr_rx,
            handles: Mutex::new(handles),
        }
    }

    /// The RPC server's bound address, once listening
    pub async fn rpc_addr(&self) -> Result<SocketAddr> {
        let mut rx = self.rpc_addr_rx.clone();
        loop {
            if let Some(addr) = *rx.borrow_and_update() {
                return Ok(addr);
            }
            rx.changed()
                .await
                .map_err(|_| DcpError::membership("rpc server did not start"))?;
        }
    }

    /// Follower names, for the debug endpoint
    pub fn followers(&self) -> Vec<String> {
        self.inner.services.get_all()
    }
}

#[async_trait]
impl Membership for HaMembership {
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
        if self.inner.am_leader.load(Ordering::SeqCst) {
            for name in self.inner.services.get_all() {
                self.inner.services.send(&name, Frame::Close);
            }
        }
        self.inner.services.remove_all();
        for handle in self.handles.lock().await.drain(..) {
            handle.abort();
        }
    }

    fn type_name(&self) -> &'static str {
        "kubernetesHa"
    }
}

/// React to elector transitions; owns the follower client task
async fn run_leadership(inner: Arc<HaInner>, mut leadership: watch::Receiver<LeadershipState>) {
    let mut follower_task: Option<JoinHandle<()>> = None;
    loop {
        let state = leadership.borrow_and_update().clone();
        if let Some(task) = follower_task.take() {
            task.abort();
        }
        match state {
            LeadershipState::Leader => {
                info!("elected leader");
                inner.am_leader.store(true, Ordering::SeqCst);
            }
            LeadershipState::Follower { leader_address } => {
                inner.am_leader.store(false, Ordering::SeqCst);
                follower_task = Some(tokio::spawn(run_follower(inner.clone(), leader_address)));
            }
            LeadershipState::Unknown => {
                inner.am_leader.store(false, Ordering::SeqCst);
                inner.drop_assignment();
            }
        }
        if leadership.changed().await.is_err() {
            return;
        }
    }
}

/// Leader-side tickers: follower health sweep + assignment refresh
async fn run_leader_tickers(inner: Arc<HaInner>, rebalance_delay: Duration) {
    let sweep_inner = inner.clone();
    let heartbeat = async move {
        let mut ticker = tokio::time::interval(sweep_inner.timing.heartbeat_interval);
        let stale_after = sweep_inner.timing.heartbeat_interval * 3;
        loop {
            ticker.tick().await;
            if sweep_inner.am_leader.load(Ordering::SeqCst) {
                sweep_inner.services.sweep(stale_after);
            }
        }
    };

    let monitor = async move {
        tokio::time::sleep(rebalance_delay).await;
        let mut ticker = tokio::time::interval(inner.timing.monitor_interval);
        loop {
            ticker.tick().await;
            if inner.am_leader.load(Ordering::SeqCst) {
                inner.assign();
            }
        }
    };

    tokio::join!(heartbeat, monitor);
}

/// Accept follower connections on the RPC port
async fn run_rpc_server(
    inner: Arc<HaInner>,
    rpc_port: u16,
    rpc_addr_tx: watch::Sender<Option<SocketAddr>>,
) {
    let listener = match TcpListener::bind(("0.0.0.0", rpc_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("rpc server cannot bind port {rpc_port}: {e}");
            return;
        }
    };
    if let Ok(addr) = listener.local_addr() {
        info!("rpc server listening on {addr}");
        let _ = rpc_addr_tx.send(Some(addr));
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("rpc connection from {peer}");
                tokio::spawn(serve_follower(inner.clone(), stream));
            }
            Err(e) => warn!("rpc accept failed: {e}"),
        }
    }
}

/// Leader side of one follower connection
async fn serve_follower(inner: Arc<HaInner>, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LinesCodec::new());
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    // The first frame names the follower
    let name = match read_frame(&mut reader).await {
        Some(Frame::Register { name }) => name,
        other => {
            warn!("rpc connection did not register: {other:?}");
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<Frame>(16);
    inner.services.add(name.clone(), tx);

    let writer_name = name.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let line = match serde_json::to_string(&frame) {
                Ok(line) => line,
                Err(e) => {
                    warn!("cannot encode frame for {writer_name}: {e}");
                    continue;
                }
            };
            let closing = frame == Frame::Close;
            if writer.send(line).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(frame) = read_frame(&mut reader).await {
        match frame {
            Frame::Pong => inner.services.touch(&name),
            Frame::Register { .. } => {}
            other => debug!("unexpected frame from follower {name}: {other:?}"),
        }
    }

    inner.services.remove(&name);
    writer_task.abort();
}

/// Follower side: register with the leader and apply its assignments
async fn run_follower(inner: Arc<HaInner>, leader_address: String) {
    loop {
        match follow_once(&inner, &leader_address).await {
            Ok(()) => debug!("connection to leader {leader_address} closed"),
            Err(e) => warn!("connection to leader {leader_address} failed: {e}"),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn follow_once(inner: &HaInner, leader_address: &str) -> Result<()> {
    let stream = TcpStream::connect(leader_address)
        .await
        .map_err(|e| DcpError::ConnectionFailed(e.to_string()))?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LinesCodec::new());
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    send_frame(&mut writer, &Frame::Register { name: inner.identity.name.clone() }).await?;
    info!("registered with leader {leader_address}");

    while let Some(frame) = read_frame(&mut reader).await {
        match frame {
            Frame::Ping => send_frame(&mut writer, &Frame::Pong).await?,
            Frame::Rebalance { member_number, total_members } => {
                inner.set_model(Model::new(member_number, total_members));
            }
            Frame::Reconnect => return Ok(()),
            Frame::Close => {
                inner.drop_assignment();
                return Ok(());
            }
            other => debug!("unexpected frame from leader: {other:?}"),
        }
    }
    Ok(())
}

async fn read_frame<R>(reader: &mut FramedRead<R, LinesCodec>) -> Option<Frame>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(line)) => match serde_json::from_str(&line) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    warn!("undecodable rpc line: {e}");
                    continue;
                }
            },
            Some(Err(e)) => {
                warn!("rpc read failed: {e}");
                return None;
            }
            None => return None,
        }
    }
}

async fn send_frame<W>(writer: &mut FramedWrite<W, LinesCodec>, frame: &Frame) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let line = serde_json::to_string(frame)?;
    writer
        .send(line)
        .await
        .map_err(|e| DcpError::network(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_timing() -> HaTiming {
        HaTiming {
            heartbeat_interval: Duration::from_millis(50),
            monitor_interval: Duration::from_millis(25),
        }
    }

    fn identity(name: &str) -> Identity {
        Identity { ip: "127.0.0.1".into(), name: name.into() }
    }

    #[test]
    fn test_frame_serde_roundtrip() {
        let frames = [
            Frame::Ping,
            Frame::Pong,
            Frame::Register { name: "indexer-1".into() },
            Frame::Rebalance { member_number: 2, total_members: 3 },
            Frame::Reconnect,
            Frame::Close,
        ];
        for frame in frames {
            let line = serde_json::to_string(&frame).unwrap();
            assert!(!line.contains('\n'));
            let parsed: Frame = serde_json::from_str(&line).unwrap();
            assert_eq!(parsed, frame);
        }
        assert_eq!(
            serde_json::to_string(&Frame::Rebalance { member_number: 2, total_members: 3 })
                .unwrap(),
            r#"{"type":"rebalance","memberNumber":2,"totalMembers":3}"#
        );
    }

    #[tokio::test]
    async fn test_leader_assigns_itself_member_one() {
        let (leadership_tx, leadership_rx) = watch::channel(LeadershipState::Unknown);
        let membership = HaMembership::start(
            identity("leader"),
            0,
            Duration::ZERO,
            Bus::new(),
            leadership_rx,
            fast_timing(),
        );

        leadership_tx.send(LeadershipState::Leader).unwrap();
        let model = tokio::time::timeout(Duration::from_secs(2), membership.get_info())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(model, Model::new(1, 1));
        membership.close().await;
    }

    #[tokio::test]
    async fn test_follower_receives_assignment_from_leader() {
        let (leader_tx, leader_rx) = watch::channel(LeadershipState::Unknown);
        let leader = HaMembership::start(
            identity("leader"),
            0,
            Duration::ZERO,
            Bus::new(),
            leader_rx,
            fast_timing(),
        );
        let leader_addr = leader.rpc_addr().await.unwrap();
        leader_tx.send(LeadershipState::Leader).unwrap();

        let (follower_tx, follower_rx) = watch::channel(LeadershipState::Unknown);
        let follower = HaMembership::start(
            identity("follower-a"),
            0,
            Duration::ZERO,
            Bus::new(),
            follower_rx,
            fast_timing(),
        );
        follower_tx
            .send(LeadershipState::Follower { leader_address: leader_addr.to_string() })
            .unwrap();

        let deadline = Duration::from_secs(3);
        let follower_model =
            tokio::time::timeout(deadline, follower.get_info()).await.unwrap().unwrap();
        assert_eq!(follower_model, Model::new(2, 2));

        // The leader renumbered itself to 1-of-2
        let mut rx = leader.model_rx.clone();
        tokio::time::timeout(deadline, async {
            loop {
                if *rx.borrow_and_update() == Some(Model::new(1, 2)) {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(leader.followers(), vec!["follower-a".to_string()]);

        follower.close().await;
        leader.close().await;
    }

    #[tokio::test]
    async fn test_leader_loss_drops_assignment() {
        let bus = Bus::new();
        let lost = Arc::new(AtomicBool::new(false));
        let lost_clone = lost.clone();
        bus.subscribe(move |event| {
            if *event == Event::MembershipLost {
                lost_clone.store(true, Ordering::SeqCst);
            }
        });

        let (leadership_tx, leadership_rx) = watch::channel(LeadershipState::Leader);
        let membership = HaMembership::start(
            identity("node"),
            0,
            Duration::ZERO,
            bus,
            leadership_rx,
            fast_timing(),
        );
        tokio::time::timeout(Duration::from_secs(2), membership.get_info())
            .await
            .unwrap()
            .unwrap();

        leadership_tx.send(LeadershipState::Unknown).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !lost.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(membership.inner.model_tx.borrow().is_none());

        membership.close().await;
    }
}
