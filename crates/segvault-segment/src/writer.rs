//! Segment writer
//!
//! Append-side of the codec: masters build segments with this before
//! replicating them, and the recovery builder uses it to assemble
//! per-partition output segments.

use crate::certificate::Certificate;
use crate::entry::{EntryType, write_entry};
use segvault_common::{Error, Result};

/// An in-memory segment under construction.
#[derive(Debug, Default)]
pub struct SegmentWriter {
    buf: Vec<u8>,
    capacity: Option<u32>,
}

impl SegmentWriter {
    /// Create an unbounded writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer that refuses to grow past `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            buf: Vec::new(),
            capacity: Some(capacity),
        }
    }

    /// Append a typed entry; returns the offset at which it was placed.
    pub fn append(&mut self, entry_type: EntryType, payload: &[u8]) -> Result<u32> {
        let offset = self.buf.len() as u32;
        write_entry(&mut self.buf, entry_type, payload);
        if let Some(capacity) = self.capacity
            && self.buf.len() as u64 > u64::from(capacity)
        {
            self.buf.truncate(offset as usize);
            return Err(Error::SegmentOverflow {
                offset,
                length: payload.len() as u32,
                segment_size: capacity,
            });
        }
        Ok(offset)
    }

    /// Number of bytes appended so far.
    #[must_use]
    pub fn appended_len(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Certificate sealing everything appended so far.
    #[must_use]
    pub fn certificate(&self) -> Certificate {
        Certificate::compute(&self.buf, self.buf.len() as u32)
            .expect("writer length always covers its own buffer")
    }

    /// The appended bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer, returning the segment bytes and certificate.
    #[must_use]
    pub fn finish(self) -> (Vec<u8>, Certificate) {
        let certificate = self.certificate();
        (self.buf, certificate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::SegmentIterator;

    #[test]
    fn test_append_and_iterate() {
        let mut writer = SegmentWriter::new();
        let off_a = writer.append(EntryType::Object, b"aaa").unwrap();
        let off_b = writer.append(EntryType::Tombstone, b"bb").unwrap();
        assert_eq!(off_a, 0);
        assert!(off_b > off_a);

        let (bytes, certificate) = writer.finish();
        let entries: Vec<_> = SegmentIterator::new(&bytes, &certificate)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry_type, EntryType::Object);
        assert_eq!(entries[0].payload, b"aaa");
        assert_eq!(entries[1].entry_type, EntryType::Tombstone);
        assert_eq!(entries[1].payload, b"bb");
    }

    #[test]
    fn test_capacity_enforced() {
        let mut writer = SegmentWriter::with_capacity(8);
        writer.append(EntryType::Object, b"1234").unwrap();
        let err = writer.append(EntryType::Object, b"56789").unwrap_err();
        assert!(matches!(err, Error::SegmentOverflow { .. }));
        // The failed append left no partial bytes behind.
        assert_eq!(writer.appended_len(), 6);
    }

    #[test]
    fn test_empty_writer_certificate() {
        let writer = SegmentWriter::new();
        let cert = writer.certificate();
        assert_eq!(cert.length, 0);
        cert.validate(&[]).unwrap();
    }
}
