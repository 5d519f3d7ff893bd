//! In-memory frame store
//!
//! Mirrors the [`FrameStore`] contract without touching disk. Used for
//! tests and for backups configured to hold replicas in RAM only (where
//! durability is traded for write latency and replicas simply do not
//! survive a restart).

use crate::backend::{FrameId, FrameStore};
use crate::bitmap::FrameBitmap;
use crate::layout::{ReplicaTrailer, TRAILER_LEN};
use parking_lot::RwLock;
use segvault_common::{Error, Result};

struct FrameSlot {
    data: Vec<u8>,
    trailer: [u8; TRAILER_LEN],
}

/// A frame store held entirely in memory.
pub struct MemoryStore {
    cluster_name: String,
    segment_size: u32,
    frames: Vec<RwLock<FrameSlot>>,
    bitmap: FrameBitmap,
}

impl MemoryStore {
    /// Create a store with `frame_count` frames of `segment_size` bytes.
    #[must_use]
    pub fn new(cluster_name: &str, segment_size: u32, frame_count: u32) -> Self {
        let frames = (0..frame_count)
            .map(|_| {
                RwLock::new(FrameSlot {
                    data: vec![0u8; segment_size as usize],
                    trailer: [0u8; TRAILER_LEN],
                })
            })
            .collect();
        Self {
            cluster_name: cluster_name.to_string(),
            segment_size,
            frames,
            bitmap: FrameBitmap::new(frame_count),
        }
    }

    fn slot(&self, frame: FrameId) -> Result<&RwLock<FrameSlot>> {
        self.frames.get(frame.index() as usize).ok_or_else(|| {
            Error::internal(format!(
                "{frame} out of range (frame count {})",
                self.frames.len()
            ))
        })
    }
}

impl FrameStore for MemoryStore {
    fn segment_size(&self) -> u32 {
        self.segment_size
    }

    fn frame_count(&self) -> u32 {
        self.frames.len() as u32
    }

    fn free_frames(&self) -> u32 {
        self.bitmap.free_frames()
    }

    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn allocate(&self) -> Option<FrameId> {
        self.bitmap.allocate().map(FrameId)
    }

    fn claim(&self, frame: FrameId) -> bool {
        self.bitmap.claim(frame.index())
    }

    fn free(&self, frame: FrameId) -> Result<()> {
        let mut slot = self.slot(frame)?.write();
        slot.data.fill(0);
        slot.trailer = [0u8; TRAILER_LEN];
        drop(slot);
        self.bitmap.free(frame.index());
        Ok(())
    }

    fn write(
        &self,
        frame: FrameId,
        data: &[u8],
        dest_offset: u32,
        trailer: Option<&ReplicaTrailer>,
    ) -> Result<()> {
        let mut slot = self.slot(frame)?.write();
        let start = dest_offset as usize;
        let end = start + data.len();
        if end as u64 > u64::from(self.segment_size) {
            return Err(Error::SegmentOverflow {
                offset: dest_offset,
                length: data.len() as u32,
                segment_size: self.segment_size,
            });
        }
        slot.data[start..end].copy_from_slice(data);
        if let Some(trailer) = trailer {
            slot.trailer = trailer.to_bytes();
        }
        Ok(())
    }

    fn load(&self, frame: FrameId) -> Result<Vec<u8>> {
        Ok(self.slot(frame)?.read().data.clone())
    }

    fn read_trailer(&self, frame: FrameId) -> Result<Option<ReplicaTrailer>> {
        let slot = self.slot(frame)?.read();
        let Ok(trailer) = ReplicaTrailer::from_bytes(&slot.trailer) else {
            return Ok(None);
        };
        if !trailer.check_integrity() || trailer.segment_capacity != self.segment_size {
            return Ok(None);
        }
        Ok(Some(trailer))
    }

    fn flush(&self, _frame: FrameId) -> Result<()> {
        Ok(())
    }

    fn enumerate(&self) -> Result<Vec<(FrameId, Option<ReplicaTrailer>)>> {
        (0..self.frame_count())
            .map(|i| {
                let frame = FrameId(i);
                Ok((frame, self.read_trailer(frame)?))
            })
            .collect()
    }

    fn scrub_all(&self) -> Result<()> {
        for slot in &self.frames {
            slot.write().trailer = [0u8; TRAILER_LEN];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segvault_segment::Certificate;

    #[test]
    fn test_write_load_roundtrip() {
        let store = MemoryStore::new("testing", 256, 2);
        let frame = store.allocate().unwrap();
        store.write(frame, b"hello", 7, None).unwrap();

        let bytes = store.load(frame).unwrap();
        assert_eq!(&bytes[7..12], b"hello");
    }

    #[test]
    fn test_exhaustion() {
        let store = MemoryStore::new("testing", 256, 2);
        assert!(store.allocate().is_some());
        assert!(store.allocate().is_some());
        assert!(store.allocate().is_none());
    }

    #[test]
    fn test_free_clears_frame() {
        let store = MemoryStore::new("testing", 256, 1);
        let frame = store.allocate().unwrap();
        let trailer = ReplicaTrailer::new(Certificate::default(), 1, 2, 256, false);
        store.write(frame, b"data", 0, Some(&trailer)).unwrap();

        store.free(frame).unwrap();
        let frame = store.allocate().unwrap();
        assert!(store.load(frame).unwrap().iter().all(|&b| b == 0));
        assert!(store.read_trailer(frame).unwrap().is_none());
    }

    #[test]
    fn test_trailer_roundtrip_and_capacity_check() {
        let store = MemoryStore::new("testing", 256, 1);
        let frame = store.allocate().unwrap();

        let good = ReplicaTrailer::new(Certificate::default(), 1, 2, 256, true);
        store.write(frame, &[], 0, Some(&good)).unwrap();
        assert_eq!(store.read_trailer(frame).unwrap(), Some(good));

        let wrong_capacity = ReplicaTrailer::new(Certificate::default(), 1, 2, 512, true);
        store.write(frame, &[], 0, Some(&wrong_capacity)).unwrap();
        assert!(store.read_trailer(frame).unwrap().is_none());
    }
}
