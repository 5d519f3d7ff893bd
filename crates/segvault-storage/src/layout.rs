//! On-storage layout definitions
//!
//! Two records live on storage besides replica data: the superblock at the
//! head of the store, and one replica trailer end-aligned in each frame.
//! Both carry a trailing CRC32C over all preceding bytes and are rejected
//! wholesale when it does not verify.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use segvault_common::checksum::compute_crc32c;
use segvault_common::{Error, Result};
use segvault_segment::{CERTIFICATE_LEN, Certificate};
use uuid::Uuid;

/// Magic number identifying a SegVault store.
pub const MAGIC: [u8; 8] = *b"SEGVAULT";

/// Current storage format version.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the superblock region at the head of the store (4KB).
pub const SUPERBLOCK_LEN: u64 = 4096;

/// Fixed space reserved for the cluster name within the superblock.
const CLUSTER_NAME_FIELD: usize = 256;

/// Offset of the superblock checksum:
/// magic(8) + version(4) + volume_id(16) + segment_size(4) + frame_count(4)
/// + name_len(2) + name(256) = 294
const SUPERBLOCK_CHECKSUM_OFFSET: usize = 294;

/// Encoded size of the replica trailer:
/// certificate(8) + log_id(8) + segment_id(8) + segment_capacity(4)
/// + closed(1) + checksum(4) = 33, no padding.
pub const TRAILER_LEN: usize = 33;

/// Superblock stored at the beginning of the store.
///
/// Records the store geometry and the cluster name the replicas were
/// written under. A cluster-name mismatch at startup means the replicas on
/// storage belong to some other cluster's masters and must be scrubbed
/// rather than offered for recoveries.
#[derive(Clone, Debug)]
pub struct Superblock {
    /// Magic number for format identification.
    pub magic: [u8; 8],
    /// Storage format version.
    pub version: u32,
    /// Unique id of this storage volume.
    pub volume_id: Uuid,
    /// Segment capacity the frames were sized for.
    pub segment_size: u32,
    /// Number of frames in the store.
    pub frame_count: u32,
    /// Cluster name the replicas belong to.
    pub cluster_name: String,
    /// CRC32C over all preceding fields.
    pub checksum: u32,
}

impl Superblock {
    /// Create a superblock for a fresh store.
    pub fn new(cluster_name: &str, segment_size: u32, frame_count: u32) -> Result<Self> {
        if cluster_name.len() > CLUSTER_NAME_FIELD {
            return Err(Error::configuration(format!(
                "cluster name exceeds {CLUSTER_NAME_FIELD} bytes"
            )));
        }
        let mut sb = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            volume_id: Uuid::new_v4(),
            segment_size,
            frame_count,
            cluster_name: cluster_name.to_string(),
            checksum: 0,
        };
        sb.checksum = sb.compute_checksum();
        Ok(sb)
    }

    /// Serialize to the fixed superblock region.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SUPERBLOCK_LEN as usize);

        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_slice(self.volume_id.as_bytes());
        buf.put_u32_le(self.segment_size);
        buf.put_u32_le(self.frame_count);
        buf.put_u16_le(self.cluster_name.len() as u16);
        buf.put_slice(self.cluster_name.as_bytes());
        buf.resize(SUPERBLOCK_CHECKSUM_OFFSET, 0);
        buf.put_u32_le(self.checksum);

        buf.resize(SUPERBLOCK_LEN as usize, 0);
        buf.freeze()
    }

    /// Parse and verify a superblock region.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SUPERBLOCK_CHECKSUM_OFFSET + 4 {
            return Err(Error::corruption("superblock region too small"));
        }

        let mut buf = data;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(Error::corruption("invalid superblock magic"));
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported storage format version: {version}"
            )));
        }

        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        let volume_id = Uuid::from_bytes(uuid_bytes);

        let segment_size = buf.get_u32_le();
        let frame_count = buf.get_u32_le();

        let name_len = buf.get_u16_le() as usize;
        if name_len > CLUSTER_NAME_FIELD {
            return Err(Error::corruption("superblock cluster name overlong"));
        }
        let cluster_name = String::from_utf8(buf[..name_len].to_vec())
            .map_err(|_| Error::corruption("superblock cluster name not utf-8"))?;

        let checksum = u32::from_le_bytes(
            data[SUPERBLOCK_CHECKSUM_OFFSET..SUPERBLOCK_CHECKSUM_OFFSET + 4]
                .try_into()
                .unwrap(),
        );

        let sb = Self {
            magic,
            version,
            volume_id,
            segment_size,
            frame_count,
            cluster_name,
            checksum,
        };
        if sb.compute_checksum() != checksum {
            return Err(Error::corruption("superblock checksum mismatch"));
        }
        Ok(sb)
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        compute_crc32c(&bytes[..SUPERBLOCK_CHECKSUM_OFFSET])
    }
}

/// Self-describing metadata stored end-aligned in each frame.
///
/// The trailer is everything the restart scanner needs to re-inventory a
/// replica: whose segment it is, how far it is certified, and whether the
/// master closed it. Written on every flush of the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaTrailer {
    /// Certificate covering the replica bytes in the frame.
    pub certificate: Certificate,
    /// Id of the log (master) the replica belongs to.
    pub log_id: u64,
    /// Id of the replicated segment.
    pub segment_id: u64,
    /// Segment capacity the frame was written under. A mismatch with the
    /// store's configured capacity invalidates the trailer even when the
    /// CRC verifies.
    pub segment_capacity: u32,
    /// Whether the master closed the replica.
    pub closed: bool,
    /// CRC32C over all preceding bytes.
    pub checksum: u32,
}

impl ReplicaTrailer {
    /// Create a trailer sealed with its checksum.
    #[must_use]
    pub fn new(
        certificate: Certificate,
        log_id: u64,
        segment_id: u64,
        segment_capacity: u32,
        closed: bool,
    ) -> Self {
        let mut trailer = Self {
            certificate,
            log_id,
            segment_id,
            segment_capacity,
            closed,
            checksum: 0,
        };
        trailer.checksum = trailer.compute_checksum();
        trailer
    }

    /// Serialize to the fixed 33-byte encoding.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TRAILER_LEN] {
        let mut buf = [0u8; TRAILER_LEN];
        let mut cursor = &mut buf[..];
        cursor.put_slice(&self.certificate.to_bytes());
        cursor.put_u64_le(self.log_id);
        cursor.put_u64_le(self.segment_id);
        cursor.put_u32_le(self.segment_capacity);
        cursor.put_u8(u8::from(self.closed));
        cursor.put_u32_le(self.checksum);
        buf
    }

    /// Parse from bytes without verifying integrity; see
    /// [`ReplicaTrailer::check_integrity`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < TRAILER_LEN {
            return Err(Error::bad_trailer("trailer too short"));
        }
        let certificate = Certificate::from_bytes(&data[..CERTIFICATE_LEN])?;
        let mut buf = &data[CERTIFICATE_LEN..];
        Ok(Self {
            certificate,
            log_id: buf.get_u64_le(),
            segment_id: buf.get_u64_le(),
            segment_capacity: buf.get_u32_le(),
            closed: buf.get_u8() != 0,
            checksum: buf.get_u32_le(),
        })
    }

    /// Whether the stored checksum matches the fields. Only consulted at
    /// backup startup, the one time trailers are ever read back.
    #[must_use]
    pub fn check_integrity(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        compute_crc32c(&bytes[..TRAILER_LEN - 4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_roundtrip() {
        let sb = Superblock::new("testing", 4096, 6).unwrap();
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len() as u64, SUPERBLOCK_LEN);

        let decoded = Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.volume_id, sb.volume_id);
        assert_eq!(decoded.cluster_name, "testing");
        assert_eq!(decoded.segment_size, 4096);
        assert_eq!(decoded.frame_count, 6);
    }

    #[test]
    fn test_superblock_detects_corruption() {
        let sb = Superblock::new("testing", 4096, 6).unwrap();
        let mut bytes = sb.to_bytes().to_vec();
        bytes[20] ^= 0x01;
        assert!(Superblock::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_superblock_rejects_overlong_name() {
        let name = "x".repeat(CLUSTER_NAME_FIELD + 1);
        assert!(Superblock::new(&name, 4096, 6).is_err());
    }

    #[test]
    fn test_trailer_is_33_bytes() {
        let trailer = ReplicaTrailer::new(Certificate::default(), 70, 88, 4096, true);
        assert_eq!(trailer.to_bytes().len(), 33);
    }

    #[test]
    fn test_trailer_roundtrip() {
        let certificate = Certificate {
            length: 1234,
            checksum: 0xdead_beef,
        };
        let trailer = ReplicaTrailer::new(certificate, 70, 88, 4096, false);
        let decoded = ReplicaTrailer::from_bytes(&trailer.to_bytes()).unwrap();
        assert_eq!(decoded, trailer);
        assert!(decoded.check_integrity());
    }

    #[test]
    fn test_trailer_integrity() {
        let mut trailer = ReplicaTrailer::new(Certificate::default(), 70, 90, 4096, true);
        assert!(trailer.check_integrity());

        trailer.checksum = 0;
        assert!(!trailer.check_integrity());

        let decoded = ReplicaTrailer::from_bytes(&trailer.to_bytes()).unwrap();
        assert!(!decoded.check_integrity());
    }
}
