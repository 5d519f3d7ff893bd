//! Typed entry payloads
//!
//! The payload encodings of the entry types the backup inspects. All
//! integers are little-endian. Object and tombstone records carry their
//! key inline behind a u16 length; the remainder of an object record is
//! its value.

use crate::entry::EntryType;
use bytes::{Buf, BufMut};
use segvault_common::checksum::key_hash;
use segvault_common::{Error, KeyHash, Result};

/// Payload of a [`EntryType::SegHeader`] entry.
///
/// First entry of every well-formed segment; names the log (master) the
/// segment belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Id of the log (i.e. the master) the segment belongs to.
    pub log_id: u64,
    /// Id of this segment within that log.
    pub segment_id: u64,
    /// Capacity in bytes the master allocated for the segment.
    pub capacity: u32,
}

impl SegmentHeader {
    /// Encoded payload size.
    pub const LEN: usize = 20;

    /// Serialize to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        let mut cursor = &mut buf[..];
        cursor.put_u64_le(self.log_id);
        cursor.put_u64_le(self.segment_id);
        cursor.put_u32_le(self.capacity);
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(Error::corruption("segment header too short"));
        }
        let mut buf = data;
        Ok(Self {
            log_id: buf.get_u64_le(),
            segment_id: buf.get_u64_le(),
            capacity: buf.get_u32_le(),
        })
    }
}

/// Payload of an [`EntryType::Object`] entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Table the object belongs to.
    pub table_id: u64,
    /// Version timestamp assigned by the master.
    pub timestamp: u64,
    /// The object's key.
    pub key: Vec<u8>,
    /// The object's value.
    pub value: Vec<u8>,
}

impl ObjectRecord {
    /// Serialize to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18 + self.key.len() + self.value.len());
        buf.put_u64_le(self.table_id);
        buf.put_u64_le(self.timestamp);
        buf.put_u16_le(self.key.len() as u16);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 18 {
            return Err(Error::corruption("object record too short"));
        }
        let mut buf = data;
        let table_id = buf.get_u64_le();
        let timestamp = buf.get_u64_le();
        let key_len = buf.get_u16_le() as usize;
        if buf.remaining() < key_len {
            return Err(Error::corruption("object key truncated"));
        }
        let key = buf[..key_len].to_vec();
        buf.advance(key_len);
        Ok(Self {
            table_id,
            timestamp,
            key,
            value: buf.to_vec(),
        })
    }

    /// Hash of the record's key.
    #[must_use]
    pub fn key_hash(&self) -> KeyHash {
        key_hash(self.table_id, &self.key)
    }
}

/// Payload of an [`EntryType::Tombstone`] entry.
///
/// Refers to the deleted object by table and key, plus the id of the
/// segment the object was written in so the cleaner can tell when the
/// tombstone itself becomes collectible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TombstoneRecord {
    /// Table the deleted object belonged to.
    pub table_id: u64,
    /// Segment the deleted object was written in.
    pub segment_id: u64,
    /// The deleted object's key.
    pub key: Vec<u8>,
}

impl TombstoneRecord {
    /// Serialize to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18 + self.key.len());
        buf.put_u64_le(self.table_id);
        buf.put_u64_le(self.segment_id);
        buf.put_u16_le(self.key.len() as u16);
        buf.put_slice(&self.key);
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 18 {
            return Err(Error::corruption("tombstone record too short"));
        }
        let mut buf = data;
        let table_id = buf.get_u64_le();
        let segment_id = buf.get_u64_le();
        let key_len = buf.get_u16_le() as usize;
        if buf.remaining() < key_len {
            return Err(Error::corruption("tombstone key truncated"));
        }
        Ok(Self {
            table_id,
            segment_id,
            key: buf[..key_len].to_vec(),
        })
    }

    /// Hash of the record's key.
    #[must_use]
    pub fn key_hash(&self) -> KeyHash {
        key_hash(self.table_id, &self.key)
    }
}

/// Payload of an [`EntryType::LogDigest`] entry: the segment ids making up
/// the master's log at the time the digest was written.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogDigest {
    /// The segment ids, in log order.
    pub segment_ids: Vec<u64>,
}

impl LogDigest {
    /// Serialize to bytes: a u32 count followed by the ids.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 8 * self.segment_ids.len());
        buf.put_u32_le(self.segment_ids.len() as u32);
        for id in &self.segment_ids {
            buf.put_u64_le(*id);
        }
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("log digest too short"));
        }
        let mut buf = data;
        let count = buf.get_u32_le() as usize;
        if buf.remaining() < count * 8 {
            return Err(Error::corruption("log digest truncated"));
        }
        let mut segment_ids = Vec::with_capacity(count);
        for _ in 0..count {
            segment_ids.push(buf.get_u64_le());
        }
        Ok(Self { segment_ids })
    }
}

/// Extract `(table_id, key_hash)` from an object or tombstone payload
/// without decoding the full record. Returns `None` for other entry types.
pub fn keyed_fields(entry_type: EntryType, payload: &[u8]) -> Result<Option<(u64, KeyHash)>> {
    match entry_type {
        EntryType::Object => {
            let record = ObjectRecord::from_bytes(payload)?;
            Ok(Some((record.table_id, record.key_hash())))
        }
        EntryType::Tombstone => {
            let record = TombstoneRecord::from_bytes(payload)?;
            Ok(Some((record.table_id, record.key_hash())))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_header_roundtrip() {
        let header = SegmentHeader {
            log_id: 99,
            segment_id: 88,
            capacity: 4096,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), SegmentHeader::LEN);
        assert_eq!(SegmentHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_object_roundtrip() {
        let object = ObjectRecord {
            table_id: 123,
            timestamp: 7,
            key: b"29".to_vec(),
            value: b"test1".to_vec(),
        };
        let decoded = ObjectRecord::from_bytes(&object.to_bytes()).unwrap();
        assert_eq!(decoded, object);
        assert_eq!(decoded.key_hash(), key_hash(123, b"29"));
    }

    #[test]
    fn test_object_empty_value() {
        let object = ObjectRecord {
            table_id: 1,
            timestamp: 0,
            key: b"k".to_vec(),
            value: Vec::new(),
        };
        assert_eq!(ObjectRecord::from_bytes(&object.to_bytes()).unwrap(), object);
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let tomb = TombstoneRecord {
            table_id: 124,
            segment_id: 88,
            key: b"20".to_vec(),
        };
        assert_eq!(TombstoneRecord::from_bytes(&tomb.to_bytes()).unwrap(), tomb);
    }

    #[test]
    fn test_log_digest_roundtrip() {
        let digest = LogDigest {
            segment_ids: vec![0x3f17c2451f0caf, 88, 89],
        };
        let bytes = digest.to_bytes();
        assert_eq!(bytes.len(), 4 + 3 * 8);
        assert_eq!(LogDigest::from_bytes(&bytes).unwrap(), digest);
    }

    #[test]
    fn test_keyed_fields() {
        let object = ObjectRecord {
            table_id: 5,
            timestamp: 0,
            key: b"abc".to_vec(),
            value: b"v".to_vec(),
        };
        let fields = keyed_fields(EntryType::Object, &object.to_bytes()).unwrap();
        assert_eq!(fields, Some((5, key_hash(5, b"abc"))));

        assert_eq!(keyed_fields(EntryType::LogDigest, &[]).unwrap(), None);
    }

    #[test]
    fn test_truncated_records_rejected() {
        assert!(ObjectRecord::from_bytes(&[0u8; 4]).is_err());
        assert!(TombstoneRecord::from_bytes(&[0u8; 17]).is_err());

        // key length field claims more bytes than are present
        let mut bytes = TombstoneRecord {
            table_id: 1,
            segment_id: 1,
            key: b"xy".to_vec(),
        }
        .to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(TombstoneRecord::from_bytes(&bytes).is_err());
    }
}
