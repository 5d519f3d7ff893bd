//! Frame store trait definition

use crate::layout::ReplicaTrailer;
use derive_more::Display;
use segvault_common::Result;

/// Handle to one storage frame, valid for the lifetime of its allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[display("frame:{_0}")]
pub struct FrameId(pub u32);

impl FrameId {
    /// The frame's slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Stable storage carved into fixed-size frames, each holding at most one
/// segment replica plus its trailer.
///
/// # Invariants
///
/// - A frame returned by `allocate` is exclusively owned until `free`
/// - `write` places bytes at an absolute offset within the frame's segment
///   region and, when a trailer is supplied, rewrites the frame's trailer
/// - Bytes written are visible to every subsequent `load` in this process;
///   they are durable once `flush` returns (or immediately, for stores
///   opened in synchronous mode)
/// - `enumerate` reports only trailers that pass integrity and capacity
///   checks; anything else reads as an empty frame
///
/// # Implementors
///
/// - [`super::FileStore`] - single-file store on stable storage
/// - [`super::MemoryStore`] - for testing
pub trait FrameStore: Send + Sync {
    /// Capacity of one replica in bytes.
    fn segment_size(&self) -> u32;

    /// Total number of frames.
    fn frame_count(&self) -> u32;

    /// Number of unallocated frames.
    fn free_frames(&self) -> u32;

    /// Cluster name the store's replicas belong to.
    fn cluster_name(&self) -> &str;

    /// Reserve a free frame, or `None` when storage is exhausted.
    fn allocate(&self) -> Option<FrameId>;

    /// Mark a specific frame allocated. Used by the restart scanner after
    /// it validates the frame's trailer.
    fn claim(&self, frame: FrameId) -> bool;

    /// Return a frame to the free pool and invalidate its trailer.
    fn free(&self, frame: FrameId) -> Result<()>;

    /// Write `data` at `dest_offset` within the frame's segment region,
    /// optionally replacing the frame's trailer.
    fn write(
        &self,
        frame: FrameId,
        data: &[u8],
        dest_offset: u32,
        trailer: Option<&ReplicaTrailer>,
    ) -> Result<()>;

    /// Read back the frame's full segment region.
    fn load(&self, frame: FrameId) -> Result<Vec<u8>>;

    /// Read the frame's trailer; `None` if it fails integrity or was
    /// written under a different segment capacity.
    fn read_trailer(&self, frame: FrameId) -> Result<Option<ReplicaTrailer>>;

    /// Make the frame's written bytes and trailer durable.
    fn flush(&self, frame: FrameId) -> Result<()>;

    /// Walk every frame, reporting its validated trailer if one survives.
    /// Only used at startup, before any allocation has happened.
    fn enumerate(&self) -> Result<Vec<(FrameId, Option<ReplicaTrailer>)>>;

    /// Destroy every trailer on storage so no replica written previously
    /// can be mistaken for live data.
    fn scrub_all(&self) -> Result<()>;
}
