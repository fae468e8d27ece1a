//! Cluster-facing seam
//!
//! The memcached binary wire codec is not part of this crate; everything
//! the core needs from it sits behind [`CouchbaseClient`]. The in-memory
//! [`mock::MockCluster`] implements the same trait for tests and examples.

mod client;
pub mod mock;

pub use client::{
    CouchbaseClient, DcpEvent, EndStreamReason, ObserveResult, SharedClient, StreamEvent,
};
