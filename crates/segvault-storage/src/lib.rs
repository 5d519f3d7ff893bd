//! SegVault Frame Storage
//!
//! Stable storage for segment replicas, carved into fixed-size frames:
//! - On-storage layout: superblock and the per-frame replica trailer
//! - Bitmap-based frame allocation
//! - [`FrameStore`] trait with two interchangeable backends:
//!   [`FileStore`] (single file) and [`MemoryStore`] (testing)
//!
//! ```text
//! +------------------+  offset 0
//! |    Superblock    |  4KB - magic, version, volume id, cluster name,
//! +------------------+        frame geometry
//! |     Frame 0      |  segment_size bytes of replica data
//! |   + trailer      |  33-byte replica trailer, end-aligned
//! +------------------+
//! |     Frame 1      |
//! |       ...        |
//! +------------------+
//! ```

pub mod backend;
pub mod bitmap;
pub mod file;
pub mod layout;
pub mod memory;

pub use backend::{FrameId, FrameStore};
pub use bitmap::FrameBitmap;
pub use file::{FileStore, StoreStats};
pub use layout::{
    FORMAT_VERSION, MAGIC, ReplicaTrailer, SUPERBLOCK_LEN, Superblock, TRAILER_LEN,
};
pub use memory::MemoryStore;
