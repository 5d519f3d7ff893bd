//! Core type definitions for SegVault
//!
//! Identifiers for cluster members, log segments and recovery partitions,
//! plus the partition map handed to backups at recovery start.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Unique identifier of a server in the cluster (master or backup).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
    Into,
)]
#[display("{_0}")]
pub struct ServerId(pub u64);

impl ServerId {
    /// Create a server id from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Identifier of a segment within one master's log.
///
/// Segment ids are assigned by the master and are unique per master, not
/// cluster-wide; replicas are therefore keyed by `(ServerId, SegmentId)`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
    Into,
)]
#[display("{_0}")]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// Create a segment id from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Identifier of a recovery partition.
///
/// During master recovery the key space is split into partitions, one per
/// recovery master; the builder emits one output segment per partition.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
    Into,
)]
#[display("{_0}")]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Create a partition id from its raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// 64-bit hash of an object key; determines tablet membership.
pub type KeyHash = u64;

/// A position in a master's log: a segment id plus a byte offset within it.
///
/// Positions order lexicographically, which matches the order entries were
/// appended to the log.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("({segment_id},{offset})")]
pub struct LogPosition {
    /// The segment containing the position.
    pub segment_id: SegmentId,
    /// Byte offset within the segment.
    pub offset: u32,
}

impl LogPosition {
    /// Create a log position.
    #[must_use]
    pub const fn new(segment_id: SegmentId, offset: u32) -> Self {
        Self { segment_id, offset }
    }
}

/// A contiguous key-hash range of one table, assigned to a recovery
/// partition.
///
/// `ctime` is the log position at which the tablet was created on the
/// crashed master; entries positioned before it predate the tablet and must
/// not be replayed into it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    /// Table the tablet belongs to.
    pub table_id: u64,
    /// First key hash covered (inclusive).
    pub start_key_hash: KeyHash,
    /// Last key hash covered (inclusive).
    pub end_key_hash: KeyHash,
    /// Recovery partition the tablet is assigned to.
    pub partition_id: PartitionId,
    /// Log position of the tablet's creation on the crashed master.
    pub ctime: LogPosition,
}

impl Tablet {
    /// Whether this tablet covers `key_hash` of `table_id`.
    #[must_use]
    pub fn contains(&self, table_id: u64, key_hash: KeyHash) -> bool {
        self.table_id == table_id
            && self.start_key_hash <= key_hash
            && key_hash <= self.end_key_hash
    }
}

/// The partition map supplied with a recovery: every tablet of the crashed
/// master, each tagged with the partition that will recover it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap {
    tablets: Vec<Tablet>,
}

impl PartitionMap {
    /// Create an empty partition map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tablet to the map.
    pub fn push(&mut self, tablet: Tablet) {
        self.tablets.push(tablet);
    }

    /// All tablets in the map.
    #[must_use]
    pub fn tablets(&self) -> &[Tablet] {
        &self.tablets
    }

    /// Find the tablet covering `key_hash` of `table_id`, if any.
    ///
    /// Tablet ranges are disjoint per table, so at most one tablet matches.
    #[must_use]
    pub fn find(&self, table_id: u64, key_hash: KeyHash) -> Option<&Tablet> {
        self.tablets.iter().find(|t| t.contains(table_id, key_hash))
    }

    /// Number of output partitions: `1 + max(partition_id)`, or zero for an
    /// empty map.
    #[must_use]
    pub fn partition_count(&self) -> u32 {
        self.tablets
            .iter()
            .map(|t| t.partition_id.as_u32() + 1)
            .max()
            .unwrap_or(0)
    }

    /// Whether the map holds no tablets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tablets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tablet(table_id: u64, start: u64, end: u64, partition: u32) -> Tablet {
        Tablet {
            table_id,
            start_key_hash: start,
            end_key_hash: end,
            partition_id: PartitionId::new(partition),
            ctime: LogPosition::new(SegmentId::new(0), 0),
        }
    }

    #[test]
    fn test_log_position_ordering() {
        let early = LogPosition::new(SegmentId::new(3), 500);
        let later_in_segment = LogPosition::new(SegmentId::new(3), 501);
        let later_segment = LogPosition::new(SegmentId::new(4), 0);

        assert!(early < later_in_segment);
        assert!(later_in_segment < later_segment);
    }

    #[test]
    fn test_tablet_contains() {
        let t = tablet(7, 100, 200, 0);
        assert!(t.contains(7, 100));
        assert!(t.contains(7, 200));
        assert!(!t.contains(7, 99));
        assert!(!t.contains(7, 201));
        assert!(!t.contains(8, 150));
    }

    #[test]
    fn test_partition_map_find() {
        let mut map = PartitionMap::new();
        map.push(tablet(7, 0, 100, 0));
        map.push(tablet(7, 101, u64::MAX, 1));
        map.push(tablet(9, 0, u64::MAX, 1));

        assert_eq!(map.find(7, 50).unwrap().partition_id, PartitionId::new(0));
        assert_eq!(map.find(7, 101).unwrap().partition_id, PartitionId::new(1));
        assert_eq!(map.find(9, 12345).unwrap().partition_id, PartitionId::new(1));
        assert!(map.find(10, 0).is_none());
    }

    #[test]
    fn test_partition_count() {
        let mut map = PartitionMap::new();
        assert_eq!(map.partition_count(), 0);
        map.push(tablet(7, 0, 100, 0));
        assert_eq!(map.partition_count(), 1);
        map.push(tablet(7, 101, 200, 3));
        assert_eq!(map.partition_count(), 4);
    }
}
