//! Per-segment replica state machine
//!
//! A [`Replica`] tracks one segment replica on this backup: its storage
//! frame, how far the master has written it, and where it is in the
//! open/closed/recovering lifecycle. All public calls are serialized by
//! the replica's mutex; anything that touches storage or runs the builder
//! releases the mutex for the duration and reacquires it to publish
//! results, so the dispatch path never sleeps on I/O while holding it.

use crate::recovery::{BuilderGate, RecoverySegment, build_recovery_segments};
use crate::wire::RecoveryData;
use parking_lot::{Condvar, Mutex};
use segvault_common::{Error, PartitionMap, PartitionId, Result, SegmentId, ServerId};
use segvault_segment::{Certificate, EntryType, SegmentIterator};
use segvault_storage::{FrameId, FrameStore, ReplicaTrailer};
use tracing::{debug, warn};

/// Sentinel reported as a closed replica's written length.
///
/// Callers of `start_reading_data` use it to tell closed replicas apart
/// from open ones without a separate flag.
pub const BYTES_WRITTEN_CLOSED: u32 = u32::MAX;

/// Lifecycle state of a replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaState {
    /// Created but no frame reserved yet.
    Uninit,
    /// Frame reserved, master may still write.
    Open,
    /// Sealed by the master; immutable on stable storage.
    Closed,
    /// Serving a recovery; writes are refused, recovery segments are
    /// being (or have been) built.
    Recovering,
    /// Frame released; terminal.
    Freed,
}

struct Inner {
    state: ReplicaState,
    created_by_current_process: bool,
    /// Highest byte offset any append has reached, or
    /// [`BYTES_WRITTEN_CLOSED`] once the replica is sealed.
    rightmost_written_offset: u32,
    frame: Option<FrameId>,
    /// Latest certificate supplied by the master; persisted in the frame
    /// trailer and used to gate iteration at recovery time.
    append_certificate: Certificate,
    /// Partition map stashed for a deferred (secondary) build.
    recovery_partitions: Option<PartitionMap>,
    recovery_segments: Option<Vec<RecoverySegment>>,
    recovery_error: Option<String>,
    /// A build is running; waiters sleep on the condvar.
    build_running: bool,
    /// A storage write is in flight with the mutex released; `free` waits
    /// for it so the frame is never released out from under an I/O.
    io_inflight: u32,
}

/// One segment replica held by this backup.
pub struct Replica {
    /// Master whose log the segment belongs to.
    pub master_id: ServerId,
    /// The replicated segment.
    pub segment_id: SegmentId,
    /// Whether this backup holds the primary copy; primaries get their
    /// recovery segments built eagerly at recovery start.
    pub primary: bool,
    segment_size: u32,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Replica {
    /// Create a fresh replica for a master's first open-write.
    #[must_use]
    pub fn new(
        master_id: ServerId,
        segment_id: SegmentId,
        segment_size: u32,
        primary: bool,
    ) -> Self {
        Self {
            master_id,
            segment_id,
            primary,
            segment_size,
            inner: Mutex::new(Inner {
                state: ReplicaState::Uninit,
                created_by_current_process: true,
                rightmost_written_offset: 0,
                frame: None,
                append_certificate: Certificate::default(),
                recovery_partitions: None,
                recovery_segments: None,
                recovery_error: None,
                build_running: false,
                io_inflight: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Reconstruct a replica the restart scanner found on storage.
    ///
    /// The frame must already be claimed in the store. An open replica's
    /// written length is taken from the trailer's certificate, which is
    /// the farthest point the master ever certified.
    #[must_use]
    pub fn from_storage(
        segment_size: u32,
        frame: FrameId,
        trailer: &ReplicaTrailer,
    ) -> Self {
        let (state, rightmost) = if trailer.closed {
            (ReplicaState::Closed, BYTES_WRITTEN_CLOSED)
        } else {
            (ReplicaState::Open, trailer.certificate.length)
        };
        Self {
            master_id: ServerId::new(trailer.log_id),
            segment_id: SegmentId::new(trailer.segment_id),
            primary: false,
            segment_size,
            inner: Mutex::new(Inner {
                state,
                created_by_current_process: false,
                rightmost_written_offset: rightmost,
                frame: Some(frame),
                append_certificate: trailer.certificate,
                recovery_partitions: None,
                recovery_segments: None,
                recovery_error: None,
                build_running: false,
                io_inflight: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ReplicaState {
        self.inner.lock().state
    }

    /// Whether the master may still write this replica.
    ///
    /// Deliberately not the same as `state() == Open`: a replica that
    /// entered recovery while still open keeps counting as open, which is
    /// what digest selection needs.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().rightmost_written_offset != BYTES_WRITTEN_CLOSED
    }

    /// The written length reported to `start_reading_data`.
    #[must_use]
    pub fn rightmost_written_offset(&self) -> u32 {
        self.inner.lock().rightmost_written_offset
    }

    /// Whether this process created the replica (as opposed to the
    /// restart scanner inheriting it from a previous process).
    #[must_use]
    pub fn created_by_current_process(&self) -> bool {
        self.inner.lock().created_by_current_process
    }

    #[cfg(test)]
    pub(crate) fn pretend_inherited_from_storage(&self) {
        self.inner.lock().created_by_current_process = false;
    }

    /// The replica's storage frame, if one is reserved.
    #[must_use]
    pub fn frame(&self) -> Option<FrameId> {
        self.inner.lock().frame
    }

    /// Reserve a storage frame and become writable.
    ///
    /// Legal only from `Uninit`; a repeated open of a live replica is
    /// handled (idempotently) by the service before it gets here.
    pub fn open(&self, store: &dyn FrameStore) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            ReplicaState::Uninit => {}
            ReplicaState::Open => return Ok(()),
            _ => return Err(Error::bad_segment_id(self.master_id, self.segment_id)),
        }
        let frame = store.allocate().ok_or(Error::StorageExhausted)?;
        inner.frame = Some(frame);
        inner.state = ReplicaState::Open;
        inner.rightmost_written_offset = 0;
        // Persist an initial trailer so the replica survives a restart
        // even if the master never sends another byte.
        let trailer = self.trailer(&inner, false);
        inner.io_inflight += 1;
        drop(inner);

        let result = store.write(frame, &[], 0, Some(&trailer));

        let mut inner = self.inner.lock();
        inner.io_inflight -= 1;
        self.cond.notify_all();
        if let Err(e) = result {
            // Roll all the way back so the failed open leaks no frame.
            if let Some(frame) = inner.frame.take() {
                let _ = store.free(frame);
            }
            inner.state = ReplicaState::Uninit;
            return Err(e);
        }
        Ok(())
    }

    /// Apply one write from the master.
    ///
    /// Idempotent: the master's RPC layer retries, and rewriting the same
    /// bytes at the same offset converges to the same replica.
    pub fn append(
        &self,
        store: &dyn FrameStore,
        data: &[u8],
        offset: u32,
        certificate: Option<&Certificate>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ReplicaState::Open {
            return Err(Error::bad_segment_id(self.master_id, self.segment_id));
        }
        let end = u64::from(offset) + data.len() as u64;
        if end > u64::from(self.segment_size) {
            return Err(Error::SegmentOverflow {
                offset,
                length: data.len() as u32,
                segment_size: self.segment_size,
            });
        }
        let frame = inner.frame.expect("open replica always has a frame");
        let new_certificate = certificate.copied().unwrap_or(inner.append_certificate);
        let trailer = ReplicaTrailer::new(
            new_certificate,
            self.master_id.as_u64(),
            self.segment_id.as_u64(),
            self.segment_size,
            false,
        );
        inner.io_inflight += 1;
        drop(inner);

        let result = store.write(frame, data, offset, Some(&trailer));

        let mut inner = self.inner.lock();
        inner.io_inflight -= 1;
        self.cond.notify_all();
        result?;
        if inner.state == ReplicaState::Open {
            inner.rightmost_written_offset = inner.rightmost_written_offset.max(end as u32);
            inner.append_certificate = new_certificate;
        }
        Ok(())
    }

    /// Seal the replica. A close of an already-closed replica is a no-op;
    /// the master retries closes like any other write.
    pub fn close(&self, store: &dyn FrameStore) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            ReplicaState::Closed => return Ok(()),
            ReplicaState::Open => {}
            _ => return Err(Error::bad_segment_id(self.master_id, self.segment_id)),
        }
        let frame = inner.frame.expect("open replica always has a frame");
        let trailer = self.trailer(&inner, true);
        inner.io_inflight += 1;
        drop(inner);

        let result = store
            .write(frame, &[], 0, Some(&trailer))
            .and_then(|()| store.flush(frame));

        let mut inner = self.inner.lock();
        inner.io_inflight -= 1;
        self.cond.notify_all();
        result?;
        if inner.state == ReplicaState::Open {
            inner.state = ReplicaState::Closed;
            inner.rightmost_written_offset = BYTES_WRITTEN_CLOSED;
        }
        Ok(())
    }

    /// Enter recovery. For secondaries the partition map is stashed for a
    /// deferred build; primaries get `None` here and their build is
    /// launched by the service. Returns whether the replica was already
    /// recovering, so repeated recovery starts don't launch extra builds.
    pub fn set_recovering(&self, partitions: Option<&PartitionMap>) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            ReplicaState::Open | ReplicaState::Closed | ReplicaState::Recovering => {}
            _ => return Err(Error::bad_segment_id(self.master_id, self.segment_id)),
        }
        let was_recovering = inner.state == ReplicaState::Recovering;
        inner.state = ReplicaState::Recovering;
        if let Some(partitions) = partitions
            && inner.recovery_partitions.is_none()
        {
            inner.recovery_partitions = Some(partitions.clone());
        }
        Ok(was_recovering)
    }

    /// Claim the (single) eager build for this replica. Returns what the
    /// builder thread needs, or `None` if a build already ran or is
    /// running.
    pub fn begin_build(&self) -> Option<(FrameId, Certificate)> {
        let mut inner = self.inner.lock();
        if inner.state != ReplicaState::Recovering
            || inner.build_running
            || inner.recovery_segments.is_some()
            || inner.recovery_error.is_some()
        {
            return None;
        }
        let frame = inner.frame?;
        inner.build_running = true;
        Some((frame, inner.append_certificate))
    }

    /// Publish a finished build. Discarded if the replica left recovery
    /// (it was freed) while the builder ran.
    pub fn finish_build(&self, result: Result<Vec<RecoverySegment>>) {
        let mut inner = self.inner.lock();
        inner.build_running = false;
        if inner.state == ReplicaState::Recovering {
            match result {
                Ok(segments) => inner.recovery_segments = Some(segments),
                Err(e) => {
                    warn!(
                        master_id = %self.master_id,
                        segment_id = %self.segment_id,
                        error = %e,
                        "recovery segment build failed"
                    );
                    inner.recovery_error = Some(e.to_string());
                }
            }
        }
        self.cond.notify_all();
    }

    /// Fetch one partition's recovery segment, building lazily if this is
    /// a secondary replica and blocking while a build is in flight.
    pub fn recovery_segment(
        &self,
        partition_id: PartitionId,
        store: &dyn FrameStore,
        gate: &BuilderGate,
    ) -> Result<RecoveryData> {
        let mut inner = self.inner.lock();
        loop {
            if inner.state != ReplicaState::Recovering {
                return Err(Error::bad_segment_id(self.master_id, self.segment_id));
            }
            if let Some(error) = &inner.recovery_error {
                return Err(Error::recovery_failed(error.clone()));
            }
            if let Some(segments) = &inner.recovery_segments {
                let segment = segments.get(partition_id.as_u32() as usize).ok_or_else(|| {
                    Error::bad_segment_id(self.master_id, self.segment_id)
                })?;
                return Ok(RecoveryData {
                    data: segment.data.clone(),
                    certificate: segment.certificate,
                });
            }
            if !inner.build_running {
                // Deferred build: this is a secondary replica, built on
                // first demand so recovery start stays cheap for it.
                let Some(partitions) = inner.recovery_partitions.clone() else {
                    return Err(Error::recovery_failed(
                        "no partition map supplied for deferred build",
                    ));
                };
                let Some(frame) = inner.frame else {
                    return Err(Error::recovery_failed("replica has no storage frame"));
                };
                let certificate = inner.append_certificate;
                inner.build_running = true;
                drop(inner);

                let result = {
                    let _slot = gate.acquire();
                    store.load(frame).and_then(|bytes| {
                        build_recovery_segments(
                            &bytes,
                            &certificate,
                            &partitions,
                            self.segment_size,
                        )
                    })
                };
                self.finish_build(result);
                inner = self.inner.lock();
                continue;
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Return the log digest from this replica's head, if it carries one.
    ///
    /// Only meaningful for open replicas; the caller checks openness. Any
    /// load or iteration failure just means "no digest"; a half-written
    /// head must not fail recovery start.
    pub fn log_digest(&self, store: &dyn FrameStore) -> Option<(u32, Vec<u8>)> {
        let (frame, certificate) = {
            let inner = self.inner.lock();
            (inner.frame?, inner.append_certificate)
        };
        let bytes = match store.load(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(
                    master_id = %self.master_id,
                    segment_id = %self.segment_id,
                    error = %e,
                    "could not load replica while looking for a log digest"
                );
                return None;
            }
        };
        let iterator = SegmentIterator::new(&bytes, &certificate).ok()?;
        for entry in iterator {
            match entry {
                Ok(entry) if entry.entry_type == EntryType::LogDigest => {
                    return Some((certificate.length, entry.payload.to_vec()));
                }
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    }

    /// Release the frame and retire the replica. Legal from any state;
    /// terminal. Waits out any in-flight write or build so the frame is
    /// never pulled out from under one.
    pub fn free(&self, store: &dyn FrameStore) -> Result<()> {
        let mut inner = self.inner.lock();
        while inner.io_inflight > 0 || inner.build_running {
            self.cond.wait(&mut inner);
        }
        if inner.state == ReplicaState::Freed {
            return Ok(());
        }
        inner.state = ReplicaState::Freed;
        inner.recovery_segments = None;
        inner.recovery_partitions = None;
        if let Some(frame) = inner.frame.take() {
            store.free(frame)?;
        }
        Ok(())
    }

    fn trailer(&self, inner: &Inner, closed: bool) -> ReplicaTrailer {
        ReplicaTrailer::new(
            inner.append_certificate,
            self.master_id.as_u64(),
            self.segment_id.as_u64(),
            self.segment_size,
            closed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segvault_storage::MemoryStore;

    const SEGMENT_SIZE: u32 = 1024;

    fn store() -> MemoryStore {
        MemoryStore::new("testing", SEGMENT_SIZE, 4)
    }

    fn open_replica(store: &MemoryStore) -> Replica {
        let replica = Replica::new(ServerId::new(99), SegmentId::new(88), SEGMENT_SIZE, true);
        replica.open(store).unwrap();
        replica
    }

    #[test]
    fn test_open_reserves_frame_and_trailer() {
        let store = store();
        let replica = open_replica(&store);

        assert_eq!(replica.state(), ReplicaState::Open);
        assert!(replica.is_open());
        assert_eq!(replica.rightmost_written_offset(), 0);

        let frame = replica.frame().unwrap();
        let trailer = store.read_trailer(frame).unwrap().unwrap();
        assert_eq!(trailer.log_id, 99);
        assert_eq!(trailer.segment_id, 88);
        assert!(!trailer.closed);
    }

    #[test]
    fn test_open_exhausted() {
        let store = MemoryStore::new("testing", SEGMENT_SIZE, 1);
        let _first = open_replica(&store);

        let second = Replica::new(ServerId::new(99), SegmentId::new(89), SEGMENT_SIZE, true);
        assert!(matches!(second.open(&store), Err(Error::StorageExhausted)));
        assert_eq!(second.state(), ReplicaState::Uninit);
    }

    #[test]
    fn test_append_tracks_rightmost() {
        let store = store();
        let replica = open_replica(&store);

        replica.append(&store, b"test", 10, None).unwrap();
        assert_eq!(replica.rightmost_written_offset(), 14);

        replica.append(&store, b"ab", 2, None).unwrap();
        // earlier writes never move the high-water mark backward
        assert_eq!(replica.rightmost_written_offset(), 14);

        let bytes = store.load(replica.frame().unwrap()).unwrap();
        assert_eq!(&bytes[10..14], b"test");
        assert_eq!(&bytes[2..4], b"ab");
    }

    #[test]
    fn test_append_bounds() {
        let store = store();
        let replica = open_replica(&store);

        let err = replica
            .append(&store, b"test", SEGMENT_SIZE - 2, None)
            .unwrap_err();
        assert!(matches!(err, Error::SegmentOverflow { .. }));

        let oversize = vec![0u8; SEGMENT_SIZE as usize + 1];
        let err = replica.append(&store, &oversize, 0, None).unwrap_err();
        assert!(matches!(err, Error::SegmentOverflow { .. }));
    }

    #[test]
    fn test_close_seals_replica() {
        let store = store();
        let replica = open_replica(&store);
        replica.append(&store, b"test", 10, None).unwrap();

        replica.close(&store).unwrap();
        assert_eq!(replica.state(), ReplicaState::Closed);
        assert!(!replica.is_open());
        assert_eq!(replica.rightmost_written_offset(), BYTES_WRITTEN_CLOSED);
        assert!(store.read_trailer(replica.frame().unwrap()).unwrap().unwrap().closed);

        // idempotent
        replica.close(&store).unwrap();

        // but data writes are refused now
        let err = replica.append(&store, b"x", 0, None).unwrap_err();
        assert!(matches!(err, Error::BadSegmentId { .. }));
    }

    #[test]
    fn test_free_is_terminal() {
        let store = store();
        let replica = open_replica(&store);
        assert_eq!(store.free_frames(), 3);

        replica.free(&store).unwrap();
        assert_eq!(replica.state(), ReplicaState::Freed);
        assert_eq!(store.free_frames(), 4);
        assert!(replica.frame().is_none());

        // repeat free is harmless
        replica.free(&store).unwrap();

        // nothing else is legal anymore
        assert!(replica.append(&store, b"x", 0, None).is_err());
        assert!(replica.close(&store).is_err());
        assert!(replica.set_recovering(None).is_err());
    }

    #[test]
    fn test_set_recovering_stashes_partitions_once() {
        let store = store();
        let replica = open_replica(&store);

        let partitions = PartitionMap::new();
        assert!(!replica.set_recovering(Some(&partitions)).unwrap());
        assert!(replica.set_recovering(Some(&partitions)).unwrap());
        assert_eq!(replica.state(), ReplicaState::Recovering);
        // still "open" to digest selection
        assert!(replica.is_open());
    }

    #[test]
    fn test_recovery_segment_outside_recovery() {
        let store = store();
        let replica = open_replica(&store);
        let gate = BuilderGate::new(1);

        let err = replica
            .recovery_segment(PartitionId::new(0), &store, &gate)
            .unwrap_err();
        assert!(matches!(err, Error::BadSegmentId { .. }));
    }

    #[test]
    fn test_build_failure_is_sticky() {
        let store = store();
        let replica = open_replica(&store);
        // no header entry was ever written, so the build must fail
        replica.close(&store).unwrap();
        replica.set_recovering(Some(&PartitionMap::new())).unwrap();

        let gate = BuilderGate::new(1);
        for _ in 0..2 {
            let err = replica
                .recovery_segment(PartitionId::new(0), &store, &gate)
                .unwrap_err();
            assert!(matches!(err, Error::SegmentRecoveryFailed(_)));
        }
    }
}
