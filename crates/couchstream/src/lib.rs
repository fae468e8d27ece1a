//! # couchstream
//!
//! Scalable Couchbase DCP consumer. A fleet of instances sharing a group
//! name divides a bucket's vbucket space, streams each shard's mutations,
//! deletions and expirations to a consumer callback, and persists
//! per-vbucket checkpoints so restarts resume instead of replaying
//! history.
//!
//! ## Architecture
//!
//! - **Membership** resolves `(member_number, total_members)` — static,
//!   StatefulSet-ordinal, self-organizing via the metadata store, or
//!   leader-elected with follower RPC
//! - **VBucket discovery** maps the model to a contiguous vbucket range
//! - **Checkpoint engine** loads and periodically persists offsets, gated
//!   by **rollback mitigation** (never past the quorum-persisted seqno)
//! - **Stream coordinator** drives one state machine per vbucket and
//!   delivers events, in seqno order, to the consumer
//! - The **orchestrator** ([`Dcp`]) wires the layers and owns shutdown
//!
//! ## Usage
//!
//! ```rust,no_run
//! use couchstream::{Dcp, DcpConfig, Listener, ListenerContext};
//! use std::sync::Arc;
//!
//! # async fn run(client: couchstream::SharedClient) -> couchstream::Result<()> {
//! let config = DcpConfig::from_file("config.yml")?;
//!
//! let listener: Listener = Arc::new(|ctx: ListenerContext| {
//!     println!("vb {} seq {}", ctx.event.vb_id(), ctx.event.seq_no());
//!     ctx.ack(); // the checkpoint may now advance past this event
//! });
//!
//! let dcp = Dcp::new(config, client, listener)?;
//! dcp.start().await // runs until close()/SIGTERM
//! # }
//! ```
//!
//! Delivery is at-least-once: a crash between a consumer ack and the next
//! checkpoint flush re-delivers the tail after restart. Events of one
//! vbucket arrive in non-decreasing seqno order; across vbuckets there is
//! no ordering.

pub mod api;
pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod couchbase;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod membership;
pub mod metadata;
pub mod metrics;
pub mod offset;
pub mod rollback;
pub mod stream;

mod dcp;

pub use bus::{Bus, Event};
pub use config::{AutoReset, CheckpointType, DcpConfig, MembershipType, MetadataType};
pub use couchbase::{CouchbaseClient, DcpEvent, EndStreamReason, SharedClient, StreamEvent};
pub use dcp::Dcp;
pub use error::{DcpError, Result};
pub use membership::{LeadershipState, Model};
pub use offset::{FailoverEntry, Offset, SeqNo, Snapshot, VbId, VbUuid};
pub use stream::{ConsumerEvent, Listener, ListenerContext, VbStreamState};
