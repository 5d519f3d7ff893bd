//! Recovery-segment builder
//!
//! Filters one replica into per-partition output segments: object and
//! tombstone entries are routed by key hash to the tablet that owns them,
//! entries positioned before the tablet's creation are dropped, and every
//! output segment is sealed with its own certificate.
//!
//! Filtering runs on the backup rather than the recovering master: it
//! scales with the number of backups and keeps the unfiltered replica off
//! the network.

use segvault_common::{Error, LogPosition, PartitionMap, Result, SegmentId, Tablet};
use segvault_segment::{
    Certificate, EntryType, SegmentHeader, SegmentIterator, SegmentWriter, keyed_fields,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::trace;

/// One built output segment, ready to serve to a recovery master.
#[derive(Clone, Debug)]
pub struct RecoverySegment {
    /// The filtered entries.
    pub data: Vec<u8>,
    /// Certificate over `data`.
    pub certificate: Certificate,
}

/// Process-wide bound on concurrently running builds.
///
/// Builds are CPU-heavy; the gate keeps a recovery of many replicas from
/// starving the dispatch threads. Acquisition blocks (briefly, in small
/// sleeps) while the gate is at its ceiling.
pub struct BuilderGate {
    active: AtomicUsize,
    limit: usize,
}

impl BuilderGate {
    /// Create a gate admitting at most `limit` concurrent builds.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            limit: limit.max(1),
        }
    }

    /// Acquire a build slot, blocking until one is free.
    pub fn acquire(&self) -> BuilderSlot<'_> {
        loop {
            let active = self.active.load(Ordering::Acquire);
            if active < self.limit
                && self
                    .active
                    .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return BuilderSlot { gate: self };
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Number of builds currently running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// RAII token for one admitted build.
pub struct BuilderSlot<'a> {
    gate: &'a BuilderGate,
}

impl Drop for BuilderSlot<'_> {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Whether an entry at `position` postdates the tablet's creation.
///
/// Entries at or after the creation position are alive; this keeps entries
/// the master wrote into the log head at the instant the tablet was
/// created, while dropping anything left over from a previous incarnation
/// of the tablet.
#[must_use]
pub fn is_entry_alive(position: LogPosition, tablet: &Tablet) -> bool {
    position >= tablet.ctime
}

/// Build the per-partition recovery segments for one replica.
///
/// `input` is the replica's frame contents and `certificate` the replica's
/// last known certificate; iteration fails (and with it the whole build)
/// if the certificate does not validate. The replica must contain a
/// segment header entry.
pub fn build_recovery_segments(
    input: &[u8],
    certificate: &Certificate,
    partitions: &PartitionMap,
    segment_size: u32,
) -> Result<Vec<RecoverySegment>> {
    let entries: Vec<_> =
        SegmentIterator::new(input, certificate)?.collect::<Result<Vec<_>>>()?;

    let header = entries
        .iter()
        .find(|e| e.entry_type == EntryType::SegHeader)
        .map(|e| SegmentHeader::from_bytes(e.payload))
        .transpose()?
        .ok_or_else(|| Error::recovery_failed("replica has no segment header entry"))?;

    let mut writers: Vec<SegmentWriter> = (0..partitions.partition_count())
        .map(|_| SegmentWriter::with_capacity(segment_size))
        .collect();

    for entry in &entries {
        let Some((table_id, key_hash)) = keyed_fields(entry.entry_type, entry.payload)? else {
            continue;
        };
        let Some(tablet) = partitions.find(table_id, key_hash) else {
            trace!(table_id, key_hash, "entry matches no tablet; dropping");
            continue;
        };
        let position = LogPosition::new(SegmentId::new(header.segment_id), entry.offset);
        if !is_entry_alive(position, tablet) {
            trace!(
                table_id,
                %position,
                "entry predates tablet creation at {}; dropping",
                tablet.ctime
            );
            continue;
        }
        writers[tablet.partition_id.as_u32() as usize].append(entry.entry_type, entry.payload)?;
    }

    Ok(writers
        .into_iter()
        .map(|writer| {
            let (data, certificate) = writer.finish();
            RecoverySegment { data, certificate }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use segvault_common::PartitionId;

    #[test]
    fn test_gate_bounds_concurrency() {
        let gate = BuilderGate::new(2);
        let a = gate.acquire();
        let b = gate.acquire();
        assert_eq!(gate.active(), 2);
        drop(a);
        let _c = gate.acquire();
        assert_eq!(gate.active(), 2);
        drop(b);
        assert_eq!(gate.active(), 1);
    }

    #[test]
    fn test_build_requires_header() {
        let mut writer = SegmentWriter::new();
        writer.append(EntryType::Object, b"not a real object").ok();
        let (data, certificate) = writer.finish();

        let result =
            build_recovery_segments(&data, &certificate, &PartitionMap::new(), 4096);
        assert!(result.is_err());
    }

    #[test]
    fn test_liveness_positions() {
        let tablet = Tablet {
            table_id: 1,
            start_key_hash: 0,
            end_key_hash: u64::MAX,
            partition_id: PartitionId::new(0),
            ctime: LogPosition::new(SegmentId::new(5), 100),
        };

        // same segment, before / at / after creation offset
        assert!(!is_entry_alive(
            LogPosition::new(SegmentId::new(5), 99),
            &tablet
        ));
        assert!(is_entry_alive(
            LogPosition::new(SegmentId::new(5), 100),
            &tablet
        ));
        assert!(is_entry_alive(
            LogPosition::new(SegmentId::new(5), 101),
            &tablet
        ));

        // earlier and later segments
        assert!(!is_entry_alive(
            LogPosition::new(SegmentId::new(4), 5000),
            &tablet
        ));
        assert!(is_entry_alive(
            LogPosition::new(SegmentId::new(6), 0),
            &tablet
        ));
    }
}
