//! Single-file frame store
//!
//! Frames live in one large file: the superblock region, then frame `i` at
//! `SUPERBLOCK_LEN + i * (segment_size + TRAILER_LEN)` with its trailer in
//! the last 33 bytes. The allocation bitmap is in-memory only; after a
//! restart, occupancy is rebuilt from whichever trailers still verify.

use crate::backend::{FrameId, FrameStore};
use crate::bitmap::FrameBitmap;
use crate::layout::{ReplicaTrailer, SUPERBLOCK_LEN, Superblock, TRAILER_LEN};
use segvault_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Per-store I/O statistics.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub trailer_rejects: AtomicU64,
}

/// A frame store backed by a single file on stable storage.
pub struct FileStore {
    file: File,
    path: PathBuf,
    cluster_name: String,
    segment_size: u32,
    frame_count: u32,
    sync: bool,
    bitmap: FrameBitmap,
    stats: StoreStats,
}

impl FileStore {
    /// Open or create the store at `path`.
    ///
    /// If the file already holds a store written under the same cluster
    /// name, its replicas are preserved for the restart scanner. Under a
    /// different cluster name (or an unreadable superblock) every trailer
    /// is scrubbed first so stale replicas can never serve a recovery.
    pub fn open(
        path: &Path,
        cluster_name: &str,
        segment_size: u32,
        frame_count: u32,
        sync: bool,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let prior_len = file.metadata()?.len();
        let prior = if prior_len >= SUPERBLOCK_LEN {
            let mut region = vec![0u8; SUPERBLOCK_LEN as usize];
            file.read_exact_at(&mut region, 0)?;
            Superblock::from_bytes(&region).ok()
        } else {
            None
        };

        let frame_len = u64::from(segment_size) + TRAILER_LEN as u64;
        file.set_len(SUPERBLOCK_LEN + u64::from(frame_count) * frame_len)?;

        let (preserved_volume, scrub_needed) = match &prior {
            Some(sb) if sb.cluster_name == cluster_name => (Some(sb.volume_id), false),
            Some(sb) => {
                warn!(
                    stored = %sb.cluster_name,
                    configured = %cluster_name,
                    "replicas on storage belong to a different cluster; scrubbing all frames"
                );
                (None, true)
            }
            None => (None, prior_len > 0),
        };

        let store = Self {
            file,
            path: path.to_path_buf(),
            cluster_name: cluster_name.to_string(),
            segment_size,
            frame_count,
            sync,
            bitmap: FrameBitmap::new(frame_count),
            stats: StoreStats::default(),
        };

        if scrub_needed {
            store.scrub_all()?;
        } else if prior.is_some() {
            info!(
                cluster = %cluster_name,
                "replicas on storage match the configured cluster; \
                 they will be inventoried for recoveries"
            );
        }

        let mut superblock = Superblock::new(cluster_name, segment_size, frame_count)?;
        if let Some(volume_id) = preserved_volume {
            superblock.volume_id = volume_id;
        }
        store.file.write_all_at(&superblock.to_bytes(), 0)?;
        store.file.sync_data()?;

        Ok(store)
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// I/O statistics.
    #[must_use]
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    fn check_frame(&self, frame: FrameId) -> Result<()> {
        if frame.index() >= self.frame_count {
            return Err(Error::internal(format!(
                "{frame} out of range (frame count {})",
                self.frame_count
            )));
        }
        Ok(())
    }

    fn frame_offset(&self, frame: FrameId) -> u64 {
        let frame_len = u64::from(self.segment_size) + TRAILER_LEN as u64;
        SUPERBLOCK_LEN + u64::from(frame.index()) * frame_len
    }

    fn trailer_offset(&self, frame: FrameId) -> u64 {
        self.frame_offset(frame) + u64::from(self.segment_size)
    }
}

impl FrameStore for FileStore {
    fn segment_size(&self) -> u32 {
        self.segment_size
    }

    fn frame_count(&self) -> u32 {
        self.frame_count
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
        self.check_frame(frame)?;
        self.file
            .write_all_at(&[0u8; TRAILER_LEN], self.trailer_offset(frame))?;
        if self.sync {
            self.file.sync_data()?;
        }
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
        self.check_frame(frame)?;
        let end = u64::from(dest_offset) + data.len() as u64;
        if end > u64::from(self.segment_size) {
            return Err(Error::SegmentOverflow {
                offset: dest_offset,
                length: data.len() as u32,
                segment_size: self.segment_size,
            });
        }

        if !data.is_empty() {
            self.file
                .write_all_at(data, self.frame_offset(frame) + u64::from(dest_offset))?;
        }
        if let Some(trailer) = trailer {
            self.file
                .write_all_at(&trailer.to_bytes(), self.trailer_offset(frame))?;
        }
        if self.sync {
            self.file.sync_data()?;
        }

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn load(&self, frame: FrameId) -> Result<Vec<u8>> {
        self.check_frame(frame)?;
        let mut buf = vec![0u8; self.segment_size as usize];
        self.file.read_exact_at(&mut buf, self.frame_offset(frame))?;

        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(u64::from(self.segment_size), Ordering::Relaxed);
        Ok(buf)
    }

    fn read_trailer(&self, frame: FrameId) -> Result<Option<ReplicaTrailer>> {
        self.check_frame(frame)?;
        let mut buf = [0u8; TRAILER_LEN];
        self.file.read_exact_at(&mut buf, self.trailer_offset(frame))?;

        let Ok(trailer) = ReplicaTrailer::from_bytes(&buf) else {
            return Ok(None);
        };
        if !trailer.check_integrity() || trailer.segment_capacity != self.segment_size {
            self.stats.trailer_rejects.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        Ok(Some(trailer))
    }

    fn flush(&self, frame: FrameId) -> Result<()> {
        self.check_frame(frame)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn enumerate(&self) -> Result<Vec<(FrameId, Option<ReplicaTrailer>)>> {
        (0..self.frame_count)
            .map(|i| {
                let frame = FrameId(i);
                Ok((frame, self.read_trailer(frame)?))
            })
            .collect()
    }

    fn scrub_all(&self) -> Result<()> {
        // Invalidating the trailer retires the replica; the data region
        // can be left behind since nothing will ever certify it again.
        for i in 0..self.frame_count {
            self.file
                .write_all_at(&[0u8; TRAILER_LEN], self.trailer_offset(FrameId(i)))?;
        }
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segvault_segment::Certificate;
    use tempfile::tempdir;

    const SEGMENT_SIZE: u32 = 1024;

    fn open_store(path: &Path) -> FileStore {
        FileStore::open(path, "testing", SEGMENT_SIZE, 4, false).unwrap()
    }

    fn trailer(segment_id: u64, closed: bool) -> ReplicaTrailer {
        ReplicaTrailer::new(Certificate::default(), 70, segment_id, SEGMENT_SIZE, closed)
    }

    #[test]
    fn test_write_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("frames"));

        let frame = store.allocate().unwrap();
        store.write(frame, b"test", 10, None).unwrap();

        let bytes = store.load(frame).unwrap();
        assert_eq!(bytes.len(), SEGMENT_SIZE as usize);
        assert_eq!(&bytes[10..14], b"test");
    }

    #[test]
    fn test_write_out_of_bounds() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("frames"));
        let frame = store.allocate().unwrap();

        let err = store.write(frame, b"xx", SEGMENT_SIZE - 1, None).unwrap_err();
        assert!(matches!(err, Error::SegmentOverflow { .. }));
    }

    #[test]
    fn test_trailer_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frames");

        {
            let store = open_store(&path);
            let frame = store.allocate().unwrap();
            store.write(frame, b"abc", 0, Some(&trailer(88, true))).unwrap();
            store.flush(frame).unwrap();
        }

        let store = open_store(&path);
        let frames = store.enumerate().unwrap();
        let survivors: Vec<_> = frames.iter().filter(|(_, t)| t.is_some()).collect();
        assert_eq!(survivors.len(), 1);
        let &(frame, Some(found)) = survivors[0] else {
            unreachable!()
        };
        assert_eq!(found.segment_id, 88);
        assert!(found.closed);
        // The bitmap starts fresh; the scanner claims surviving frames.
        assert!(!store.bitmap.is_allocated(frame.index()));
    }

    #[test]
    fn test_cluster_mismatch_scrubs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frames");

        {
            let store = open_store(&path);
            let frame = store.allocate().unwrap();
            store.write(frame, b"abc", 0, Some(&trailer(88, true))).unwrap();
        }

        let store = FileStore::open(&path, "other-cluster", SEGMENT_SIZE, 4, false).unwrap();
        assert!(store.enumerate().unwrap().iter().all(|(_, t)| t.is_none()));
    }

    #[test]
    fn test_capacity_mismatch_rejects_trailer() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("frames"));
        let frame = store.allocate().unwrap();

        let wrong =
            ReplicaTrailer::new(Certificate::default(), 70, 91, SEGMENT_SIZE * 2, true);
        store.write(frame, &[], 0, Some(&wrong)).unwrap();
        assert!(store.read_trailer(frame).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_trailer_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("frames"));
        let frame = store.allocate().unwrap();

        let mut bad = trailer(90, true);
        bad.checksum = 0;
        store.write(frame, &[], 0, Some(&bad)).unwrap();
        assert!(store.read_trailer(frame).unwrap().is_none());
        assert_eq!(store.stats().trailer_rejects.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_free_invalidates_trailer() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir.path().join("frames"));
        let frame = store.allocate().unwrap();
        store.write(frame, &[], 0, Some(&trailer(88, false))).unwrap();

        store.free(frame).unwrap();
        assert!(store.read_trailer(frame).unwrap().is_none());
        assert_eq!(store.free_frames(), 4);
    }
}
