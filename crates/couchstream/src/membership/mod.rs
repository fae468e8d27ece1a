//! Group membership
//!
//! Every variant produces the same thing: a [`Model`] — this instance's
//! 1-based position and the group size — published on the bus whenever it
//! changes. The stream coordinator turns each model into a vbucket
//! assignment; nothing else in the core cares how the model was derived.
//!
//! Variants:
//! - [`StaticMembership`] — fixed model from configuration
//! - [`StatefulSetMembership`] — ordinal parsed from the pod hostname
//! - [`CouchbaseMembership`] — self-organizing registry in the metadata store
//! - [`HaMembership`] — leader-elected, followers assigned over RPC

mod couchbase;
mod ha;
mod static_membership;
mod stateful_set;

pub use couchbase::{CouchbaseMembership, MembershipTiming};
pub use ha::{Frame, HaMembership, HaTiming, LeadershipState, ServiceDiscovery};
pub use static_membership::StaticMembership;
pub use stateful_set::StatefulSetMembership;

use crate::bus::Bus;
use crate::config::{DcpConfig, MembershipType};
use crate::error::{DcpError, Result};
use crate::metadata::SharedMetadataStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// `(member_number, total_members)`: this instance's 1-based position in
/// the group and the group size. Invariant: `member_number <= total_members`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub member_number: u16,
    pub total_members: u16,
}

impl Model {
    pub fn new(member_number: u16, total_members: u16) -> Self {
        debug_assert!(member_number >= 1 && member_number <= total_members);
        Self { member_number, total_members }
    }

    pub fn is_changed(&self, other: Option<Model>) -> bool {
        other != Some(*self)
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.member_number, self.total_members)
    }
}

/// A membership backend: resolves and tracks this instance's [`Model`]
#[async_trait]
pub trait Membership: Send + Sync {
    /// The current model; waits for the first resolution on a fresh start
    async fn get_info(&self) -> Result<Model>;

    /// Stop background tasks; the instance leaves the group
    async fn close(&self);

    /// Variant name, for the membership-type metric
    fn type_name(&self) -> &'static str;
}

/// Shared membership handle
pub type SharedMembership = Arc<dyn Membership>;

/// Pod identity, resolved from the downward API when present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub ip: String,
    pub name: String,
}

impl Identity {
    /// Resolve from `POD_IP` / `POD_NAME`, falling back to the hostname
    pub fn from_env() -> Self {
        let name = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("couchstream-{}", uuid::Uuid::new_v4()));
        let ip = std::env::var("POD_IP").unwrap_or_else(|_| "127.0.0.1".to_string());
        Self { ip, name }
    }
}

/// Build the configured membership variant.
///
/// `kubernetesHa` is wired by the orchestrator (it needs the leadership
/// watch from the external elector) and is rejected here.
pub fn new_membership(
    config: &DcpConfig,
    bus: Bus,
    metadata: SharedMetadataStore,
) -> Result<SharedMembership> {
    let membership = config.membership();
    match membership.membership_type {
        MembershipType::Static => Ok(Arc::new(StaticMembership::new(
            Model::new(membership.member_number, membership.total_members),
            bus,
        ))),
        MembershipType::KubernetesStatefulSet => Ok(Arc::new(StatefulSetMembership::from_env(
            membership.total_members,
            bus,
        )?)),
        MembershipType::Couchbase => Ok(Arc::new(CouchbaseMembership::start(
            config,
            bus,
            metadata,
            MembershipTiming::default(),
        ))),
        MembershipType::KubernetesHa => Err(DcpError::config(
            "kubernetesHa membership requires a leader elector; wire it through Dcp::with_leadership",
        )),
    }
}
