//! Certificate-gated segment iteration
//!
//! Iteration never begins on an unverified buffer: the iterator constructor
//! validates the certificate, then walks the certified prefix entry by
//! entry. An entry whose framing runs past the certified length is
//! corruption, not end-of-segment; the certificate promised those bytes
//! were well-formed.

use crate::certificate::Certificate;
use crate::entry::{EntryType, read_entry_header};
use segvault_common::{Error, Result};

/// One entry yielded by iteration.
#[derive(Clone, Copy, Debug)]
pub struct SegmentEntry<'a> {
    /// The entry's type.
    pub entry_type: EntryType,
    /// Offset of the entry's frame within the segment.
    pub offset: u32,
    /// The entry payload.
    pub payload: &'a [u8],
}

/// Iterator over the entries of a certified segment prefix.
pub struct SegmentIterator<'a> {
    buf: &'a [u8],
    length: u32,
    pos: u32,
}

impl<'a> SegmentIterator<'a> {
    /// Validate `certificate` against `buf` and position at the first
    /// entry. Fails with a checksum error if the certificate does not
    /// cover `buf`'s prefix.
    pub fn new(buf: &'a [u8], certificate: &Certificate) -> Result<Self> {
        certificate.validate(buf)?;
        Ok(Self {
            buf,
            length: certificate.length,
            pos: 0,
        })
    }

    /// Whether iteration has consumed the certified prefix.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.pos >= self.length
    }
}

impl<'a> Iterator for SegmentIterator<'a> {
    type Item = Result<SegmentEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_done() {
            return None;
        }
        let header = match read_entry_header(self.buf, self.pos) {
            Ok(header) => header,
            Err(e) => {
                self.pos = self.length;
                return Some(Err(e));
            }
        };
        let offset = self.pos;
        let payload_start = offset + header.header_len;
        let payload_end = payload_start as u64 + u64::from(header.payload_len);
        if payload_end > u64::from(self.length) {
            self.pos = self.length;
            return Some(Err(Error::corruption(format!(
                "entry at offset {} runs past certified length {}",
                offset, self.length
            ))));
        }
        let entry = SegmentEntry {
            entry_type: header.entry_type,
            offset,
            payload: &self.buf[payload_start as usize..payload_end as usize],
        };
        self.pos = payload_end as u32;
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::SegmentWriter;

    #[test]
    fn test_refuses_bad_certificate() {
        let mut writer = SegmentWriter::new();
        writer.append(EntryType::Object, b"data").unwrap();
        let (mut bytes, certificate) = writer.finish();

        bytes[2] ^= 0xff;
        assert!(SegmentIterator::new(&bytes, &certificate).is_err());
    }

    #[test]
    fn test_stops_at_certified_length() {
        let mut writer = SegmentWriter::new();
        writer.append(EntryType::Object, b"one").unwrap();
        let certificate = writer.certificate();
        writer.append(EntryType::Object, b"two-uncertified").unwrap();

        // The second entry is past the certificate; it must not be yielded.
        let entries: Vec<_> = SegmentIterator::new(writer.as_slice(), &certificate)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, b"one");
    }

    #[test]
    fn test_offsets_reported() {
        let mut writer = SegmentWriter::new();
        let off_a = writer.append(EntryType::Object, b"aaaa").unwrap();
        let off_b = writer.append(EntryType::Tombstone, b"b").unwrap();
        let (bytes, certificate) = writer.finish();

        let entries: Vec<_> = SegmentIterator::new(&bytes, &certificate)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries[0].offset, off_a);
        assert_eq!(entries[1].offset, off_b);
    }

    #[test]
    fn test_truncated_entry_is_corruption() {
        // Hand-build a buffer whose single entry claims more payload than
        // the certificate covers.
        let mut bytes = vec![EntryType::Object.as_byte(), 10];
        bytes.extend_from_slice(b"abc");
        let certificate = Certificate::compute(&bytes, bytes.len() as u32).unwrap();

        let mut it = SegmentIterator::new(&bytes, &certificate).unwrap();
        assert!(it.next().unwrap().is_err());
        assert!(it.next().is_none());
    }
}
