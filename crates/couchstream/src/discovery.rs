//! VBucket ownership
//!
//! Maps `(member_number, total_members)` to the contiguous range of
//! vbuckets this instance owns. Contiguous ranges keep the partitioning
//! deterministic and keep rebalances local: when the member count changes
//! by one, each member's range shifts by at most a few vbuckets instead of
//! reshuffling the whole space.

use crate::membership::Model;
use crate::offset::VbId;
use parking_lot::RwLock;
use std::ops::Range;
use tracing::info;

/// Compute the vbucket range owned by `member_number` of `total_members`
/// over a space of `vbucket_count` vbuckets.
///
/// With `q = V / total` and `r = V % total`, members `1..=r` receive
/// `q + 1` vbuckets and the rest receive `q`, ranges concatenated in
/// member order. Every vbucket is owned by exactly one member.
pub fn vbucket_range(member_number: u16, total_members: u16, vbucket_count: u16) -> Range<VbId> {
    debug_assert!(member_number >= 1 && member_number <= total_members);

    let v = vbucket_count as u32;
    let total = total_members as u32;
    let k = member_number as u32;

    let q = v / total;
    let r = v % total;

    // Members before k with the extra vbucket
    let extras_before = (k - 1).min(r);
    let start = (k - 1) * q + extras_before;
    let len = q + u32::from(k <= r);

    (start as VbId)..((start + len) as VbId)
}

/// Live view of this instance's assignment
pub struct VBucketDiscovery {
    vbucket_count: u16,
    model: RwLock<Model>,
}

impl VBucketDiscovery {
    pub fn new(vbucket_count: u16, model: Model) -> Self {
        Self {
            vbucket_count,
            model: RwLock::new(model),
        }
    }

    /// Replace the membership model after a change
    pub fn set_members(&self, model: Model) {
        *self.model.write() = model;
    }

    pub fn get_members(&self) -> Model {
        *self.model.read()
    }

    pub fn vbucket_count(&self) -> u16 {
        self.vbucket_count
    }

    /// The vbuckets currently owned by this instance
    pub fn get_vbuckets(&self) -> Vec<VbId> {
        let model = self.get_members();
        let range = vbucket_range(model.member_number, model.total_members, self.vbucket_count);
        info!(
            "member {}/{} owns vbuckets [{}, {})",
            model.member_number, model.total_members, range.start, range.end
        );
        range.collect()
    }
}
