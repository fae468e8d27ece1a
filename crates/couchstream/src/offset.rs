//! VBucket position types
//!
//! An [`Offset`] is the durable resume point of one vbucket stream: the
//! history lineage (`vb_uuid`), the last processed sequence number, and the
//! snapshot bounds the server delivered it in. Persisted as JSON under
//! `<prefix><group>:checkpoint:<vbid>`.

use serde::{Deserialize, Serialize};

/// VBucket identifier, `[0, vbucket_count)` (conventionally 1024)
pub type VbId = u16;

/// Sequence number, monotonically non-decreasing within one vbucket uuid
pub type SeqNo = u64;

/// Opaque identifier of a vbucket's current history lineage.
/// Issued by the server; changes on failover.
pub type VbUuid = u64;

/// Contiguous range of sequence numbers delivered together.
///
/// A consumer resuming mid-snapshot must re-enter at the snapshot's start
/// or later, so the bounds travel with every checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "start")]
    pub start_seq_no: SeqNo,
    #[serde(rename = "end")]
    pub end_seq_no: SeqNo,
}

impl Snapshot {
    pub fn new(start_seq_no: SeqNo, end_seq_no: SeqNo) -> Self {
        Self { start_seq_no, end_seq_no }
    }

    /// Check whether a sequence number falls inside the snapshot bounds
    pub fn contains(&self, seq_no: SeqNo) -> bool {
        seq_no >= self.start_seq_no && seq_no <= self.end_seq_no
    }
}

/// Durable per-vbucket resume point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset {
    #[serde(rename = "vbuuid")]
    pub vb_uuid: VbUuid,
    #[serde(rename = "seqNo")]
    pub seq_no: SeqNo,
    pub snapshot: Snapshot,
}

impl Offset {
    pub fn new(vb_uuid: VbUuid, seq_no: SeqNo, snapshot: Snapshot) -> Self {
        Self { vb_uuid, seq_no, snapshot }
    }

    /// Zero offset: stream from the beginning of history.
    /// The server supplies a fresh vb uuid on open.
    pub fn earliest() -> Self {
        Self::default()
    }

    /// Offset seeded at the current high seqno of a vbucket
    pub fn latest(vb_uuid: VbUuid, high_seq_no: SeqNo) -> Self {
        Self {
            vb_uuid,
            seq_no: high_seq_no,
            snapshot: Snapshot::new(high_seq_no, high_seq_no),
        }
    }
}

/// One entry of a vbucket's failover log: the `(vb_uuid, seq_no)` pair at
/// which that history lineage began. Ordered newest first, as served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    #[serde(rename = "vbuuid")]
    pub vb_uuid: VbUuid,
    #[serde(rename = "seqNo")]
    pub seq_no: SeqNo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_json_layout() {
        let offset = Offset::new(0xDEAD_BEEF, 1500, Snapshot::new(1400, 1600));
        let json = serde_json::to_string(&offset).unwrap();

        assert!(json.contains("\"vbuuid\":3735928559"));
        assert!(json.contains("\"seqNo\":1500"));
        assert!(json.contains("\"start\":1400"));
        assert!(json.contains("\"end\":1600"));

        let parsed: Offset = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, offset);
    }

    #[test]
    fn test_earliest_offset_is_zero() {
        let offset = Offset::earliest();
        assert_eq!(offset.vb_uuid, 0);
        assert_eq!(offset.seq_no, 0);
        assert_eq!(offset.snapshot, Snapshot::default());
    }

    #[test]
    fn test_latest_offset_seeds_snapshot() {
        let offset = Offset::latest(7, 9001);
        assert_eq!(offset.seq_no, 9001);
        assert_eq!(offset.snapshot.start_seq_no, 9001);
        assert_eq!(offset.snapshot.end_seq_no, 9001);
    }

    #[test]
    fn test_snapshot_contains() {
        let snapshot = Snapshot::new(100, 200);
        assert!(snapshot.contains(100));
        assert!(snapshot.contains(150));
        assert!(snapshot.contains(200));
        assert!(!snapshot.contains(99));
        assert!(!snapshot.contains(201));
    }
}
