//! Metrics instrumentation
//!
//! Uses the `metrics` crate facade; the Prometheus recorder is installed by
//! the HTTP API and rendered at the configured metric path.
//!
//! # Metric naming convention
//!
//! All metrics follow `couchstream_{name}_{unit}`:
//!
//! - `couchstream_mutation_total{vbid}` / `_deletion_total` / `_expiration_total`
//! - `couchstream_seq_no_current{vbid}`, `couchstream_start_seq_no_current{vbid}`,
//!   `couchstream_end_seq_no_current{vbid}`, `couchstream_lag_current{vbid}`
//! - `couchstream_member_number_current`, `couchstream_total_members_current`,
//!   `couchstream_membership_type_current{type}`
//! - `couchstream_rebalance_current` (1 while a rebalance is in flight)
//! - `couchstream_offset_write_current`, `couchstream_offset_write_latency_ms_current`

use crate::membership::Model;
use crate::offset::{SeqNo, VbId};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static RECORDER: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder for embedding in an existing HTTP server.
///
/// Safe to call multiple times; only the first install wins (tests spin up
/// several clients in one process).
pub fn install_recorder() -> Option<PrometheusHandle> {
    RECORDER
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("prometheus recorder not installed: {e}");
                None
            }
        })
        .clone()
}

/// Stream-side metrics
pub struct StreamMetrics;

impl StreamMetrics {
    pub fn record_mutation(vb_id: VbId) {
        counter!("couchstream_mutation_total", "vbid" => vb_id.to_string()).increment(1);
    }

    pub fn record_deletion(vb_id: VbId) {
        counter!("couchstream_deletion_total", "vbid" => vb_id.to_string()).increment(1);
    }

    pub fn record_expiration(vb_id: VbId) {
        counter!("couchstream_expiration_total", "vbid" => vb_id.to_string()).increment(1);
    }

    pub fn set_seq_no(vb_id: VbId, seq_no: SeqNo) {
        gauge!("couchstream_seq_no_current", "vbid" => vb_id.to_string()).set(seq_no as f64);
    }

    pub fn set_snapshot(vb_id: VbId, start_seq_no: SeqNo, end_seq_no: SeqNo) {
        gauge!("couchstream_start_seq_no_current", "vbid" => vb_id.to_string())
            .set(start_seq_no as f64);
        gauge!("couchstream_end_seq_no_current", "vbid" => vb_id.to_string())
            .set(end_seq_no as f64);
    }

    pub fn set_lag(vb_id: VbId, lag: u64) {
        gauge!("couchstream_lag_current", "vbid" => vb_id.to_string()).set(lag as f64);
    }

    pub fn set_rebalance_in_flight(active: bool) {
        gauge!("couchstream_rebalance_current").set(if active { 1.0 } else { 0.0 });
    }

    /// Time spent inside the consumer callback for the last event
    pub fn set_process_latency_ms(latency_ms: f64) {
        gauge!("couchstream_process_latency_ms_current").set(latency_ms);
    }
}

/// Membership metrics
pub struct MembershipMetrics;

impl MembershipMetrics {
    pub fn set_model(model: Model) {
        gauge!("couchstream_member_number_current").set(model.member_number as f64);
        gauge!("couchstream_total_members_current").set(model.total_members as f64);
    }

    pub fn set_membership_type(membership_type: &str) {
        gauge!("couchstream_membership_type_current", "type" => membership_type.to_string())
            .set(1.0);
    }
}

/// Checkpoint metrics
pub struct CheckpointMetrics;

impl CheckpointMetrics {
    pub fn record_offset_write(count: usize, latency_ms: f64) {
        gauge!("couchstream_offset_write_current").set(count as f64);
        gauge!("couchstream_offset_write_latency_ms_current").set(latency_ms);
    }
}
