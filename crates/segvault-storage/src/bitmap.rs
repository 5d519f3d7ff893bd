//! Frame allocation bitmap
//!
//! One bit per frame: 0 = free, 1 = in use. The bitmap is in-memory only;
//! occupancy is rediscovered after a restart by scanning frame trailers.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Bitmap tracking which frames hold replicas.
pub struct FrameBitmap {
    data: Mutex<Vec<u8>>,
    total_frames: u32,
    free_frames: AtomicU32,
    search_hint: AtomicU32,
}

impl FrameBitmap {
    /// Create a bitmap with all frames free.
    #[must_use]
    pub fn new(total_frames: u32) -> Self {
        let bytes_needed = (total_frames as usize).div_ceil(8);
        Self {
            data: Mutex::new(vec![0u8; bytes_needed]),
            total_frames,
            free_frames: AtomicU32::new(total_frames),
            search_hint: AtomicU32::new(0),
        }
    }

    /// Number of frames tracked.
    #[must_use]
    pub fn total_frames(&self) -> u32 {
        self.total_frames
    }

    /// Number of free frames.
    #[must_use]
    pub fn free_frames(&self) -> u32 {
        self.free_frames.load(Ordering::Relaxed)
    }

    /// Whether `frame` is in use. Out-of-range frames count as in use.
    pub fn is_allocated(&self, frame: u32) -> bool {
        if frame >= self.total_frames {
            return true;
        }
        let data = self.data.lock();
        Self::is_set(&data, frame)
    }

    /// Allocate a free frame, searching from the last allocation onward.
    pub fn allocate(&self) -> Option<u32> {
        let mut data = self.data.lock();
        let hint = self.search_hint.load(Ordering::Relaxed);

        let found = Self::find_free(&data, hint, self.total_frames)
            .or_else(|| Self::find_free(&data, 0, hint.min(self.total_frames)));
        let frame = found?;
        Self::set(&mut data, frame);
        self.free_frames.fetch_sub(1, Ordering::Relaxed);
        self.search_hint.store(frame + 1, Ordering::Relaxed);
        Some(frame)
    }

    /// Mark a specific frame as in use. Used by the restart scanner when it
    /// finds a valid replica in the frame. Returns false if the frame was
    /// already in use.
    pub fn claim(&self, frame: u32) -> bool {
        if frame >= self.total_frames {
            return false;
        }
        let mut data = self.data.lock();
        if Self::is_set(&data, frame) {
            return false;
        }
        Self::set(&mut data, frame);
        self.free_frames.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Return a frame to the free pool.
    pub fn free(&self, frame: u32) {
        if frame >= self.total_frames {
            return;
        }
        let mut data = self.data.lock();
        if Self::is_set(&data, frame) {
            Self::clear(&mut data, frame);
            self.free_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn is_set(data: &[u8], frame: u32) -> bool {
        data[(frame / 8) as usize] & (1 << (frame % 8)) != 0
    }

    fn set(data: &mut [u8], frame: u32) {
        data[(frame / 8) as usize] |= 1 << (frame % 8);
    }

    fn clear(data: &mut [u8], frame: u32) {
        data[(frame / 8) as usize] &= !(1 << (frame % 8));
    }

    fn find_free(data: &[u8], start: u32, end: u32) -> Option<u32> {
        (start..end).find(|&frame| !Self::is_set(data, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_all_then_exhaust() {
        let bitmap = FrameBitmap::new(5);
        let mut frames: Vec<u32> = (0..5).map(|_| bitmap.allocate().unwrap()).collect();
        frames.sort_unstable();
        assert_eq!(frames, vec![0, 1, 2, 3, 4]);
        assert_eq!(bitmap.free_frames(), 0);
        assert!(bitmap.allocate().is_none());
    }

    #[test]
    fn test_free_and_reallocate() {
        let bitmap = FrameBitmap::new(3);
        for _ in 0..3 {
            bitmap.allocate().unwrap();
        }
        bitmap.free(1);
        assert_eq!(bitmap.free_frames(), 1);
        assert_eq!(bitmap.allocate(), Some(1));
    }

    #[test]
    fn test_double_free_is_harmless() {
        let bitmap = FrameBitmap::new(2);
        let frame = bitmap.allocate().unwrap();
        bitmap.free(frame);
        bitmap.free(frame);
        assert_eq!(bitmap.free_frames(), 2);
    }

    #[test]
    fn test_claim() {
        let bitmap = FrameBitmap::new(4);
        assert!(bitmap.claim(2));
        assert!(!bitmap.claim(2));
        assert!(bitmap.is_allocated(2));
        assert_eq!(bitmap.free_frames(), 3);

        // allocation skips the claimed frame
        let mut rest: Vec<u32> = (0..3).map(|_| bitmap.allocate().unwrap()).collect();
        rest.sort_unstable();
        assert_eq!(rest, vec![0, 1, 3]);
    }

    #[test]
    fn test_out_of_range() {
        let bitmap = FrameBitmap::new(2);
        assert!(bitmap.is_allocated(2));
        assert!(!bitmap.claim(2));
        bitmap.free(7); // no-op
        assert_eq!(bitmap.free_frames(), 2);
    }
}
