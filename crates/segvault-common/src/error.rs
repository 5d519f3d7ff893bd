//! Error types for SegVault
//!
//! One shared error enum covers the whole backup engine. The first group of
//! variants is the set of error kinds surfaced to masters over the wire;
//! the rest are integrity and environment failures local to the backup.

use crate::types::{SegmentId, ServerId};
use thiserror::Error;

/// Common result type for SegVault operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for SegVault.
#[derive(Debug, Error)]
pub enum Error {
    // Errors surfaced over the wire
    #[error("no writable replica for segment <{master_id},{segment_id}>")]
    BadSegmentId {
        master_id: ServerId,
        segment_id: SegmentId,
    },

    #[error("write of {length} bytes at offset {offset} exceeds segment size {segment_size}")]
    SegmentOverflow {
        offset: u32,
        length: u32,
        segment_size: u32,
    },

    #[error("no free storage frames")]
    StorageExhausted,

    #[error("open rejected for segment <{master_id},{segment_id}>: {reason}")]
    BackupOpenRejected {
        master_id: ServerId,
        segment_id: SegmentId,
        reason: String,
    },

    #[error("recovery segment build failed: {0}")]
    SegmentRecoveryFailed(String),

    // Integrity errors
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("frame metadata rejected: {0}")]
    BadTrailer(String),

    #[error("segment corrupted: {0}")]
    Corruption(String),

    // Environment errors
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a bad-segment-id error.
    pub fn bad_segment_id(master_id: ServerId, segment_id: SegmentId) -> Self {
        Self::BadSegmentId {
            master_id,
            segment_id,
        }
    }

    /// Create an open-rejected error.
    pub fn open_rejected(
        master_id: ServerId,
        segment_id: SegmentId,
        reason: impl Into<String>,
    ) -> Self {
        Self::BackupOpenRejected {
            master_id,
            segment_id,
            reason: reason.into(),
        }
    }

    /// Create a recovery-failed error.
    pub fn recovery_failed(msg: impl Into<String>) -> Self {
        Self::SegmentRecoveryFailed(msg.into())
    }

    /// Create a corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a bad-trailer error.
    pub fn bad_trailer(msg: impl Into<String>) -> Self {
        Self::BadTrailer(msg.into())
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is the caller's fault and left backup state
    /// unchanged.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::BadSegmentId { .. }
                | Self::SegmentOverflow { .. }
                | Self::BackupOpenRejected { .. }
        )
    }

    /// Whether this error indicates corrupted or untrustworthy storage
    /// contents.
    #[must_use]
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::BadTrailer(_) | Self::Corruption(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let client = Error::bad_segment_id(ServerId::new(1), SegmentId::new(2));
        assert!(client.is_client_error());
        assert!(!client.is_integrity_error());

        let integrity = Error::corruption("truncated entry");
        assert!(integrity.is_integrity_error());
        assert!(!integrity.is_client_error());

        assert!(!Error::StorageExhausted.is_client_error());
    }

    #[test]
    fn test_error_display() {
        let err = Error::SegmentOverflow {
            offset: 4090,
            length: 100,
            segment_size: 4096,
        };
        let msg = err.to_string();
        assert!(msg.contains("4090"));
        assert!(msg.contains("4096"));
    }
}
