//! SegVault Backup Engine
//!
//! The backup-side component of the cluster: masters stream their
//! append-only segment log here, and when one of them crashes the cluster
//! pulls filtered recovery segments back out. This crate implements:
//! - The per-replica state machine ([`replica::Replica`])
//! - The recovery-segment builder ([`recovery`])
//! - The service registry and operations ([`service::BackupService`])
//! - Restart inventory and cooperative garbage collection ([`gc`])
//!
//! # Threading
//!
//! The service is synchronous and thread-safe: the RPC dispatcher calls
//! straight into it, recovery builds run on spawned worker threads bounded
//! by a [`recovery::BuilderGate`], and the GC state machines advance one
//! step at a time on a single-threaded [`gc::TaskQueue`]. Replica mutexes
//! are released around storage I/O and builds, so dispatch never sleeps
//! behind a disk.

pub mod cluster;
pub mod gc;
pub mod recovery;
pub mod replica;
pub mod service;
pub mod wire;

pub use cluster::{MasterClient, MasterStatus, MembershipTracker, PendingProbe, ProbeOutcome};
pub use gc::{
    GarbageCollectDownServerTask, GarbageCollectReplicasFoundOnStorageTask, GcTask, TaskQueue,
    TaskStep,
};
pub use recovery::{BuilderGate, RecoverySegment, build_recovery_segments, is_entry_alive};
pub use replica::{BYTES_WRITTEN_CLOSED, Replica, ReplicaState};
pub use service::BackupService;
pub use wire::{
    DigestInfo, RecoveryData, SegmentInfo, StartReadingDataResponse, WriteFlags,
    WriteSegmentRequest, WriteSegmentResponse,
};
