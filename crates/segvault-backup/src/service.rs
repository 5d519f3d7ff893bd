//! The backup service
//!
//! Owns the registry of replicas keyed by `(master_id, segment_id)` and
//! exposes the operations the RPC layer dispatches into: `write_segment`,
//! `free_segment`, `start_reading_data`, `get_recovery_data`,
//! `assign_group` and `quiesce`, plus the restart scanner that rebuilds
//! the registry from storage after a process restart.
//!
//! The registry mutex is held only across lookups and insert/erase;
//! everything stateful happens under the individual replica's own mutex.

use crate::cluster::{MasterClient, MembershipTracker};
use crate::gc::{
    GarbageCollectDownServerTask, GarbageCollectReplicasFoundOnStorageTask, GcTask, TaskQueue,
};
use crate::recovery::{BuilderGate, build_recovery_segments};
use crate::replica::Replica;
use crate::replica::ReplicaState;
use crate::wire::{
    DigestInfo, RecoveryData, SegmentInfo, StartReadingDataResponse, WriteFlags,
    WriteSegmentRequest, WriteSegmentResponse,
};
use parking_lot::Mutex;
use segvault_common::{
    BackupConfig, Error, PartitionId, PartitionMap, Result, SegmentId, ServerId,
};
use segvault_storage::FrameStore;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

#[derive(Default)]
struct ReplicationGroup {
    group_id: u64,
    backups: Vec<ServerId>,
}

/// The backup-side service of the cluster.
pub struct BackupService {
    store: Arc<dyn FrameStore>,
    registry: Mutex<HashMap<(ServerId, SegmentId), Arc<Replica>>>,
    replication: Mutex<ReplicationGroup>,
    gate: Arc<BuilderGate>,
    gc_queue: TaskQueue,
    gc_enabled: bool,
    membership: Arc<dyn MembershipTracker>,
    master_client: Arc<dyn MasterClient>,
}

impl BackupService {
    /// Create the service over `store`.
    pub fn new(
        store: Arc<dyn FrameStore>,
        config: &BackupConfig,
        membership: Arc<dyn MembershipTracker>,
        master_client: Arc<dyn MasterClient>,
    ) -> Self {
        info!(
            cluster = %store.cluster_name(),
            segment_size = store.segment_size(),
            frames = store.frame_count(),
            "backup service starting"
        );
        Self {
            store,
            registry: Mutex::new(HashMap::new()),
            replication: Mutex::new(ReplicationGroup::default()),
            gate: Arc::new(BuilderGate::new(config.io.max_concurrent_builds)),
            gc_queue: TaskQueue::new(),
            gc_enabled: config.gc.enabled,
            membership,
            master_client,
        }
    }

    /// Look up a replica.
    #[must_use]
    pub fn find_replica(
        &self,
        master_id: ServerId,
        segment_id: SegmentId,
    ) -> Option<Arc<Replica>> {
        self.registry.lock().get(&(master_id, segment_id)).cloned()
    }

    /// Number of replicas in the registry.
    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Apply one replica write from a master.
    pub fn write_segment(&self, req: WriteSegmentRequest) -> Result<WriteSegmentResponse> {
        let key = (req.master_id, req.segment_id);
        let existing = self.registry.lock().get(&key).cloned();

        let replica = match existing {
            Some(replica) => {
                if !replica.created_by_current_process() {
                    // Replicas inherited across a restart belong to a log
                    // the master already considers lost; it must open a
                    // fresh replica elsewhere.
                    return Err(if req.flags.is_open() {
                        Error::open_rejected(
                            req.master_id,
                            req.segment_id,
                            "replica was inherited from storage",
                        )
                    } else {
                        Error::bad_segment_id(req.master_id, req.segment_id)
                    });
                }
                replica
            }
            None => {
                if !req.flags.is_open() {
                    return Err(Error::bad_segment_id(req.master_id, req.segment_id));
                }
                self.open_replica(&req)?
            }
        };

        if replica.state() == ReplicaState::Closed {
            if req.flags.is_close() {
                // The master is retrying a close that already took
                // effect; accept it silently, payload and all.
                return Ok(self.write_response(req.flags));
            }
            return Err(Error::bad_segment_id(req.master_id, req.segment_id));
        }

        if !req.data.is_empty() || req.certificate.is_some() {
            replica.append(
                self.store.as_ref(),
                &req.data,
                req.offset,
                req.certificate.as_ref(),
            )?;
        }
        if req.flags.is_close() {
            replica.close(self.store.as_ref())?;
        }
        Ok(self.write_response(req.flags))
    }

    fn open_replica(&self, req: &WriteSegmentRequest) -> Result<Arc<Replica>> {
        let fresh = Arc::new(Replica::new(
            req.master_id,
            req.segment_id,
            self.store.segment_size(),
            req.flags.is_primary(),
        ));
        match fresh.open(self.store.as_ref()) {
            Ok(()) => {}
            Err(Error::StorageExhausted) => {
                warn!(
                    master_id = %req.master_id,
                    segment_id = %req.segment_id,
                    "open rejected; no free storage frames"
                );
                return Err(Error::open_rejected(
                    req.master_id,
                    req.segment_id,
                    "no free storage frames",
                ));
            }
            Err(e) => return Err(e),
        }

        let key = (req.master_id, req.segment_id);
        let (replica, race_loser) = match self.registry.lock().entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), Some(fresh)),
            Entry::Vacant(vacant) => {
                vacant.insert(fresh.clone());
                (fresh, None)
            }
        };
        if let Some(loser) = race_loser {
            // A concurrent retry of the same open won; give the frame back.
            let _ = loser.free(self.store.as_ref());
        } else {
            info!(
                master_id = %req.master_id,
                segment_id = %req.segment_id,
                primary = req.flags.is_primary(),
                "opened replica"
            );
        }
        Ok(replica)
    }

    fn write_response(&self, flags: WriteFlags) -> WriteSegmentResponse {
        let group = if flags.is_open() {
            self.replication.lock().backups.clone()
        } else {
            Vec::new()
        };
        WriteSegmentResponse { group }
    }

    /// Drop a replica and release its frame. Freeing a segment this
    /// backup does not hold is not an error; frees are retried too.
    pub fn free_segment(&self, master_id: ServerId, segment_id: SegmentId) -> Result<()> {
        let removed = self.registry.lock().remove(&(master_id, segment_id));
        match removed {
            Some(replica) => {
                info!(master_id = %master_id, segment_id = %segment_id, "freeing replica");
                replica.free(self.store.as_ref())
            }
            None => Ok(()),
        }
    }

    /// Move every replica of `master_id` into recovery and report what
    /// this backup holds.
    ///
    /// Primaries are listed first and get their recovery segments built
    /// eagerly on worker threads; secondaries stash the partition map and
    /// build on first demand. The digest comes from the still-open
    /// replica with the smallest segment id: when a master crashed
    /// mid-rollover there can be several open heads, and the oldest one
    /// is the authoritative log head.
    pub fn start_reading_data(
        &self,
        master_id: ServerId,
        partitions: &PartitionMap,
    ) -> Result<StartReadingDataResponse> {
        let mut replicas: Vec<Arc<Replica>> = {
            let registry = self.registry.lock();
            registry
                .iter()
                .filter(|((m, _), _)| *m == master_id)
                .map(|(_, r)| r.clone())
                .collect()
        };
        replicas.sort_by_key(|r| (!r.primary, r.segment_id));

        let mut segments = Vec::with_capacity(replicas.len());
        let mut to_build = Vec::new();
        for replica in &replicas {
            let stash = if replica.primary { None } else { Some(partitions) };
            let Ok(_was_recovering) = replica.set_recovering(stash) else {
                // freed concurrently
                continue;
            };
            segments.push(SegmentInfo {
                segment_id: replica.segment_id,
                length: replica.rightmost_written_offset(),
            });
            if replica.primary
                && let Some((frame, certificate)) = replica.begin_build()
            {
                to_build.push((replica.clone(), frame, certificate));
            }
        }

        let mut digest = None;
        let mut open_replicas: Vec<_> = replicas.iter().filter(|r| r.is_open()).collect();
        open_replicas.sort_by_key(|r| r.segment_id);
        for replica in open_replicas {
            if let Some((segment_length, bytes)) = replica.log_digest(self.store.as_ref()) {
                digest = Some(DigestInfo {
                    segment_id: replica.segment_id,
                    segment_length,
                    digest: bytes,
                });
                break;
            }
        }

        let segment_size = self.store.segment_size();
        for (replica, frame, certificate) in to_build {
            let store = Arc::clone(&self.store);
            let gate = Arc::clone(&self.gate);
            let partitions = partitions.clone();
            thread::spawn(move || {
                let _slot = gate.acquire();
                let result = store.load(frame).and_then(|bytes| {
                    build_recovery_segments(&bytes, &certificate, &partitions, segment_size)
                });
                replica.finish_build(result);
            });
        }

        info!(
            master_id = %master_id,
            replicas = segments.len(),
            digest_segment = digest.as_ref().map(|d| d.segment_id.as_u64()),
            "started reading data for master recovery"
        );
        Ok(StartReadingDataResponse { segments, digest })
    }

    /// Serve one partition's recovery segment, blocking until its build
    /// completes (or running it now, for secondaries).
    pub fn get_recovery_data(
        &self,
        master_id: ServerId,
        segment_id: SegmentId,
        partition_id: PartitionId,
    ) -> Result<RecoveryData> {
        let replica = self
            .find_replica(master_id, segment_id)
            .ok_or_else(|| Error::bad_segment_id(master_id, segment_id))?;
        replica.recovery_segment(partition_id, self.store.as_ref(), &self.gate)
    }

    /// Set this backup's replication group; returned to masters on open
    /// so they can colocate the replicas of one segment.
    pub fn assign_group(&self, group_id: u64, backups: &[ServerId]) {
        info!(group_id, backups = backups.len(), "assigned replication group");
        let mut replication = self.replication.lock();
        replication.group_id = group_id;
        replication.backups = backups.to_vec();
    }

    /// The current replication group id.
    #[must_use]
    pub fn replication_group_id(&self) -> u64 {
        self.replication.lock().group_id
    }

    /// Wait until everything written so far is durable.
    pub fn quiesce(&self) -> Result<()> {
        let replicas: Vec<Arc<Replica>> = self.registry.lock().values().cloned().collect();
        for replica in replicas {
            if let Some(frame) = replica.frame() {
                self.store.flush(frame)?;
            }
        }
        Ok(())
    }

    /// Rebuild the registry from storage after a process restart.
    ///
    /// Every frame whose trailer survives integrity and capacity checks
    /// becomes a replica again (open or closed per the trailer); one
    /// probe task per discovered master is queued so replicas of masters
    /// that moved on can eventually be reclaimed.
    pub fn restart_from_storage(&self) -> Result<usize> {
        let mut by_master: HashMap<ServerId, Vec<SegmentId>> = HashMap::new();
        let mut found = 0usize;

        for (frame, trailer) in self.store.enumerate()? {
            let Some(trailer) = trailer else { continue };
            if !self.store.claim(frame) {
                warn!(%frame, "frame already claimed during restart scan; skipping");
                continue;
            }
            let replica = Arc::new(Replica::from_storage(
                self.store.segment_size(),
                frame,
                &trailer,
            ));
            let master_id = replica.master_id;
            let segment_id = replica.segment_id;

            match self.registry.lock().entry((master_id, segment_id)) {
                Entry::Occupied(_) => {
                    warn!(
                        master_id = %master_id,
                        segment_id = %segment_id,
                        %frame,
                        "duplicate replica on storage; keeping the first, freeing this frame"
                    );
                    drop(replica);
                    self.store.free(frame)?;
                    continue;
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(replica);
                }
            }
            info!(
                master_id = %master_id,
                segment_id = %segment_id,
                %frame,
                closed = trailer.closed,
                "found stored replica on backup storage"
            );
            by_master.entry(master_id).or_default().push(segment_id);
            found += 1;
        }

        for (master_id, mut segment_ids) in by_master {
            segment_ids.sort_unstable();
            let mut task = GarbageCollectReplicasFoundOnStorageTask::new(master_id);
            for segment_id in segment_ids {
                task.add_segment_id(segment_id);
            }
            self.gc_queue.schedule(Box::new(task));
        }
        Ok(found)
    }

    /// React to a `SERVER_REMOVED` membership event: queue a task that
    /// frees the removed master's replicas.
    pub fn note_server_removed(&self, master_id: ServerId) {
        self.gc_queue
            .schedule(Box::new(GarbageCollectDownServerTask::new(master_id)));
    }

    /// Queue an arbitrary GC task.
    pub fn schedule_gc_task(&self, task: Box<dyn GcTask>) {
        self.gc_queue.schedule(task);
    }

    /// Run one GC step; returns whether a task ran. The daemon loops this
    /// on a dedicated thread with backoff.
    pub fn perform_gc_task(&self) -> bool {
        self.gc_queue.perform_task(self)
    }

    /// Number of queued GC tasks.
    #[must_use]
    pub fn gc_outstanding(&self) -> usize {
        self.gc_queue.outstanding()
    }

    pub(crate) fn gc_enabled(&self) -> bool {
        self.gc_enabled
    }

    pub(crate) fn membership(&self) -> &dyn MembershipTracker {
        self.membership.as_ref()
    }

    pub(crate) fn master_client(&self) -> &dyn MasterClient {
        self.master_client.as_ref()
    }

    /// The smallest segment id this backup holds for `master_id`.
    pub(crate) fn any_segment_of(&self, master_id: ServerId) -> Option<SegmentId> {
        self.registry
            .lock()
            .keys()
            .filter(|(m, _)| *m == master_id)
            .map(|&(_, s)| s)
            .min()
    }

    /// Remove and free one replica on behalf of a GC task.
    pub(crate) fn delete_replica(&self, master_id: ServerId, segment_id: SegmentId) {
        let removed = self.registry.lock().remove(&(master_id, segment_id));
        if let Some(replica) = removed
            && let Err(e) = replica.free(self.store.as_ref())
        {
            warn!(
                master_id = %master_id,
                segment_id = %segment_id,
                error = %e,
                "failed to release frame of garbage collected replica"
            );
        }
    }
}
