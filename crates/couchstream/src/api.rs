//! HTTP surface
//!
//! Operational endpoints next to the Prometheus exposition:
//!
//! - `GET /status` — 200 when a cluster ping succeeds
//! - `GET /rebalance` — trigger a redistribution
//! - `GET /states/offset` — current offsets per vbucket (debug only)
//! - `GET /states/followers` — follower names (debug only, HA mode)
//! - `GET <metric.path>` — Prometheus metrics (default `/metrics`)

use crate::bus::{Bus, Event};
use crate::couchbase::SharedClient;
use crate::error::{DcpError, Result};
use crate::membership::HaMembership;
use crate::metrics;
use crate::stream::Stream;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything the handlers need
#[derive(Clone)]
pub struct ApiState {
    pub client: SharedClient,
    pub stream: Arc<Stream>,
    pub bus: Bus,
    pub ha: Option<Arc<HaMembership>>,
    pub debug: bool,
    pub health_check_disabled: bool,
    pub metric_path: String,
}

struct Inner {
    state: ApiState,
    prometheus: Option<PrometheusHandle>,
}

/// Running HTTP server
pub struct Api {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Api {
    /// Bind and serve. Port 0 binds an ephemeral port (tests).
    pub async fn start(port: u16, state: ApiState) -> Result<Api> {
        let prometheus = metrics::install_recorder();
        let metric_path = state.metric_path.clone();
        let debug = state.debug;
        let health_check_disabled = state.health_check_disabled;
        let inner = Arc::new(Inner { state, prometheus });

        let mut app = Router::new().route("/rebalance", get(rebalance));
        if !health_check_disabled {
            app = app.route("/status", get(status));
        }
        if debug {
            app = app
                .route("/states/offset", get(offsets))
                .route("/states/followers", get(followers));
        }
        app = app.route(&metric_path, get(render_metrics));
        let app = app.with_state(inner);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| DcpError::network(format!("api cannot bind port {port}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| DcpError::network(e.to_string()))?;
        info!("api listening on {addr}");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while !*shutdown_rx.borrow_and_update() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
            if let Err(e) = result {
                warn!("api server stopped with error: {e}");
            }
        });

        Ok(Api { addr, shutdown_tx, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), self.task).await;
    }
}

async fn status(State(inner): State<Arc<Inner>>) -> impl IntoResponse {
    match inner.state.client.ping().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "cluster unreachable"),
    }
}

async fn rebalance(State(inner): State<Arc<Inner>>) -> impl IntoResponse {
    inner.state.bus.publish(Event::RebalanceRequested);
    (StatusCode::OK, "OK")
}

async fn offsets(State(inner): State<Arc<Inner>>) -> impl IntoResponse {
    Json(inner.state.stream.get_offsets())
}

async fn followers(State(inner): State<Arc<Inner>>) -> impl IntoResponse {
    match &inner.state.ha {
        Some(ha) => Json(ha.followers()).into_response(),
        None => (StatusCode::OK, "service discovery is not enabled").into_response(),
    }
}

async fn render_metrics(State(inner): State<Arc<Inner>>) -> impl IntoResponse {
    match &inner.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder unavailable".to_string()),
    }
}
