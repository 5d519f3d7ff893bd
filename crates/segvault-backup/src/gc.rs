//! Garbage collection of dead masters' replicas
//!
//! Two cooperative state machines reclaim frames: one fires when the
//! cluster removes a master, the other probes masters that survived a
//! backup restart to ask whether inherited replicas are still wanted.
//! Both run on a single-threaded task queue and advance one small step
//! per call, so they never race the dispatch path and tests can drive
//! them deterministically.

use crate::cluster::{MasterStatus, PendingProbe, ProbeOutcome};
use crate::service::BackupService;
use parking_lot::Mutex;
use segvault_common::{SegmentId, ServerId};
use std::collections::VecDeque;
use tracing::{debug, info};

/// What a task wants after one step.
pub enum TaskStep {
    /// Put the task back on the queue.
    Reschedule,
    /// The task is finished; drop it.
    Done,
}

/// One cooperative GC state machine.
pub trait GcTask: Send {
    /// Advance by one step.
    fn step(&mut self, service: &BackupService) -> TaskStep;
}

/// FIFO queue of GC tasks, driven one step at a time.
///
/// The queue itself owns no thread; the daemon loops `perform_task` on a
/// dedicated thread with backoff, and tests call it directly.
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Box<dyn GcTask>>>,
}

impl TaskQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task.
    pub fn schedule(&self, task: Box<dyn GcTask>) {
        self.tasks.lock().push_back(task);
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Pop one task and run one step of it; requeue it if it asked to be
    /// rescheduled. Returns whether a task ran.
    pub fn perform_task(&self, service: &BackupService) -> bool {
        let Some(mut task) = self.tasks.lock().pop_front() else {
            return false;
        };
        match task.step(service) {
            TaskStep::Reschedule => self.tasks.lock().push_back(task),
            TaskStep::Done => {}
        }
        true
    }
}

/// Frees the replicas of a master the cluster has removed.
///
/// Fired by `SERVER_REMOVED` membership events. Frees at most one replica
/// per step so a master with many replicas never monopolizes the queue.
pub struct GarbageCollectDownServerTask {
    master_id: ServerId,
}

impl GarbageCollectDownServerTask {
    /// Create the task for `master_id`.
    #[must_use]
    pub fn new(master_id: ServerId) -> Self {
        Self { master_id }
    }
}

impl GcTask for GarbageCollectDownServerTask {
    fn step(&mut self, service: &BackupService) -> TaskStep {
        if !service.gc_enabled() {
            return TaskStep::Done;
        }
        let Some(segment_id) = service.any_segment_of(self.master_id) else {
            return TaskStep::Done;
        };
        info!(
            master_id = %self.master_id,
            segment_id = %segment_id,
            "master removed from cluster; freeing its replica"
        );
        service.delete_replica(self.master_id, segment_id);
        TaskStep::Reschedule
    }
}

/// Probes a master about replicas inherited across a backup restart.
///
/// The restart scanner creates one of these per master found on storage.
/// The master may have already re-replicated those segments elsewhere (it
/// saw this backup die), in which case holding them just wastes frames;
/// but they can only be freed with the master's consent, or once the
/// master itself is gone from the cluster.
pub struct GarbageCollectReplicasFoundOnStorageTask {
    master_id: ServerId,
    segment_ids: VecDeque<SegmentId>,
    probe: Option<Box<dyn PendingProbe>>,
}

impl GarbageCollectReplicasFoundOnStorageTask {
    /// Create the task for `master_id`.
    #[must_use]
    pub fn new(master_id: ServerId) -> Self {
        Self {
            master_id,
            segment_ids: VecDeque::new(),
            probe: None,
        }
    }

    /// Add a segment the scanner found for this master.
    pub fn add_segment_id(&mut self, segment_id: SegmentId) {
        self.segment_ids.push_back(segment_id);
    }

    /// Whether a probe RPC is currently in flight.
    #[must_use]
    pub fn probe_in_flight(&self) -> bool {
        self.probe.is_some()
    }
}

impl GcTask for GarbageCollectReplicasFoundOnStorageTask {
    fn step(&mut self, service: &BackupService) -> TaskStep {
        if !service.gc_enabled() {
            return TaskStep::Done;
        }
        let Some(&segment_id) = self.segment_ids.front() else {
            return TaskStep::Done;
        };

        // Someone else (a free RPC, the down-server task) may have beaten
        // us to the replica.
        if service.find_replica(self.master_id, segment_id).is_none() {
            self.probe = None;
            self.segment_ids.pop_front();
            return TaskStep::Reschedule;
        }

        if let Some(probe) = &mut self.probe {
            match probe.poll() {
                ProbeOutcome::Pending => {}
                ProbeOutcome::Needed => {
                    debug!(
                        master_id = %self.master_id,
                        segment_id = %segment_id,
                        "master still wants the replica; retaining it and probing again later"
                    );
                    self.probe = None;
                    // Rotate to the back; it gets probed again until the
                    // master leaves the cluster.
                    self.segment_ids.rotate_left(1);
                }
                ProbeOutcome::NotNeeded => {
                    info!(
                        master_id = %self.master_id,
                        segment_id = %segment_id,
                        "master no longer needs the replica; freeing it"
                    );
                    self.probe = None;
                    service.delete_replica(self.master_id, segment_id);
                    self.segment_ids.pop_front();
                }
            }
            return TaskStep::Reschedule;
        }

        match service.membership().status(self.master_id) {
            Some(MasterStatus::Up) => {
                self.probe = Some(
                    service
                        .master_client()
                        .is_replica_needed(self.master_id, segment_id),
                );
            }
            Some(MasterStatus::Crashed) => {
                debug!(
                    master_id = %self.master_id,
                    segment_id = %segment_id,
                    "master crashed; waiting for the cluster to recover it before freeing"
                );
            }
            None => {
                info!(
                    master_id = %self.master_id,
                    segment_id = %segment_id,
                    "master gone from the cluster; freeing inherited replica"
                );
                service.delete_replica(self.master_id, segment_id);
                self.segment_ids.pop_front();
            }
        }
        TaskStep::Reschedule
    }
}
