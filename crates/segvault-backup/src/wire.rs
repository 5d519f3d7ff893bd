//! Request and response types of the backup service
//!
//! These are the operation boundary the RPC transport marshals; the
//! service itself only sees these plain types.

use segvault_common::{SegmentId, ServerId};
use segvault_segment::Certificate;
use serde::{Deserialize, Serialize};

/// Flags carried by a [`WriteSegmentRequest`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFlags(u8);

impl WriteFlags {
    /// Plain data write.
    pub const NONE: Self = Self(0);
    /// Open the replica (secondary copy).
    pub const OPEN: Self = Self(0x01);
    /// Close the replica after applying the write.
    pub const CLOSE: Self = Self(0x02);
    /// Open and immediately close (single-RPC empty segment).
    pub const OPEN_CLOSE: Self = Self(0x03);
    /// Open the replica as the primary copy.
    pub const OPEN_PRIMARY: Self = Self(0x05);

    /// Create flags from the raw wire byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// The raw wire byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Whether the write opens the replica.
    #[must_use]
    pub const fn is_open(self) -> bool {
        self.0 & 0x01 != 0
    }

    /// Whether the write closes the replica.
    #[must_use]
    pub const fn is_close(self) -> bool {
        self.0 & 0x02 != 0
    }

    /// Whether an open makes this backup the primary copy.
    #[must_use]
    pub const fn is_primary(self) -> bool {
        self.0 & 0x04 != 0
    }
}

/// A master's (possibly partial, possibly repeated) write to one replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteSegmentRequest {
    /// Master whose log the segment belongs to.
    pub master_id: ServerId,
    /// Segment being replicated.
    pub segment_id: SegmentId,
    /// Destination offset of the write within the segment.
    pub offset: u32,
    /// The bytes to place at `offset`.
    pub data: Vec<u8>,
    /// Certificate covering the segment prefix after this write, when the
    /// master wants the replica to be recoverable up to it.
    pub certificate: Option<Certificate>,
    /// Open/close flags.
    pub flags: WriteFlags,
}

/// Reply to a write; the replication group is only populated for opens so
/// masters can colocate the remaining replicas of the segment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WriteSegmentResponse {
    /// This backup's replication group, on open.
    pub group: Vec<ServerId>,
}

/// One replica this backup holds for the crashed master.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// The replicated segment.
    pub segment_id: SegmentId,
    /// Bytes written to the replica, or [`crate::replica::BYTES_WRITTEN_CLOSED`]
    /// when the master closed it.
    pub length: u32,
}

/// The log digest returned by `start_reading_data`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestInfo {
    /// Segment the digest was found in.
    pub segment_id: SegmentId,
    /// Certified length of that segment.
    pub segment_length: u32,
    /// The encoded digest payload.
    pub digest: Vec<u8>,
}

/// Reply to `start_reading_data`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartReadingDataResponse {
    /// Every replica held for the crashed master, primaries first.
    pub segments: Vec<SegmentInfo>,
    /// Digest from the still-open replica with the smallest segment id,
    /// if any open replica carries one.
    pub digest: Option<DigestInfo>,
}

/// One partition's recovery segment, sealed by its certificate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryData {
    /// The filtered segment bytes.
    pub data: Vec<u8>,
    /// Certificate over `data`.
    pub certificate: Certificate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits() {
        assert!(!WriteFlags::NONE.is_open());
        assert!(WriteFlags::OPEN.is_open());
        assert!(!WriteFlags::OPEN.is_close());
        assert!(!WriteFlags::OPEN.is_primary());

        assert!(WriteFlags::OPEN_PRIMARY.is_open());
        assert!(WriteFlags::OPEN_PRIMARY.is_primary());

        assert!(WriteFlags::OPEN_CLOSE.is_open());
        assert!(WriteFlags::OPEN_CLOSE.is_close());

        assert!(WriteFlags::CLOSE.is_close());
        assert!(!WriteFlags::CLOSE.is_open());
    }

    #[test]
    fn test_flag_byte_roundtrip() {
        for flags in [
            WriteFlags::NONE,
            WriteFlags::OPEN,
            WriteFlags::CLOSE,
            WriteFlags::OPEN_CLOSE,
            WriteFlags::OPEN_PRIMARY,
        ] {
            assert_eq!(WriteFlags::from_byte(flags.as_byte()), flags);
        }
    }
}
