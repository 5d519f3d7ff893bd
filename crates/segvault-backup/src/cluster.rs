//! Cluster collaborator interfaces
//!
//! The membership tracker and the outbound probe to masters are external
//! collaborators; the backup only depends on these traits. Concrete
//! implementations belong to the transport layer.

use segvault_common::{SegmentId, ServerId};

/// Liveness of a server as the cluster coordinator sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MasterStatus {
    /// The server is up and serving.
    Up,
    /// The server crashed and the cluster has not yet recovered from it.
    Crashed,
}

/// View of cluster membership.
///
/// `None` means the server is not in the membership list at all: it is
/// fully down and the cluster has recovered from its failure.
pub trait MembershipTracker: Send + Sync {
    /// Look up a server's status.
    fn status(&self, server_id: ServerId) -> Option<MasterStatus>;
}

/// Result of polling an in-flight `IsReplicaNeeded` probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// No reply yet.
    Pending,
    /// The master still wants the replica kept.
    Needed,
    /// The master has re-replicated the segment (or is unreachable,
    /// which means the cluster recovered without it); the replica can go.
    NotNeeded,
}

/// An in-flight `IsReplicaNeeded` probe.
pub trait PendingProbe: Send {
    /// Poll for the master's answer.
    fn poll(&mut self) -> ProbeOutcome;
}

/// Outbound RPC surface toward masters.
pub trait MasterClient: Send + Sync {
    /// Ask `master_id` whether it still needs the replica of `segment_id`.
    fn is_replica_needed(&self, master_id: ServerId, segment_id: SegmentId)
    -> Box<dyn PendingProbe>;
}

/// A membership view with no servers in it; stands in until a transport
/// is wired up.
pub struct NullMembership;

impl MembershipTracker for NullMembership {
    fn status(&self, _server_id: ServerId) -> Option<MasterStatus> {
        None
    }
}

/// A master client with no transport behind it; every probe reports the
/// master unreachable.
pub struct NullMasterClient;

struct UnreachableProbe;

impl PendingProbe for UnreachableProbe {
    fn poll(&mut self) -> ProbeOutcome {
        ProbeOutcome::NotNeeded
    }
}

impl MasterClient for NullMasterClient {
    fn is_replica_needed(
        &self,
        _master_id: ServerId,
        _segment_id: SegmentId,
    ) -> Box<dyn PendingProbe> {
        Box::new(UnreachableProbe)
    }
}
