//! SegVault Segment Codec
//!
//! A segment is an ordered sequence of length-prefixed, typed log entries
//! sealed by a certificate. This crate implements:
//! - Entry framing (type byte + varint length + payload)
//! - Certificates (length + CRC32C over the certified prefix)
//! - Appending via [`SegmentWriter`], reading via [`SegmentIterator`]
//! - The typed records the backup must understand (segment header,
//!   object, tombstone, log digest)

pub mod certificate;
pub mod entry;
pub mod iterator;
pub mod records;
pub mod writer;

pub use certificate::{CERTIFICATE_LEN, Certificate};
pub use entry::{EntryHeader, EntryType};
pub use iterator::{SegmentEntry, SegmentIterator};
pub use records::{LogDigest, ObjectRecord, SegmentHeader, TombstoneRecord, keyed_fields};
pub use writer::SegmentWriter;
