//! Segment certificates
//!
//! A certificate seals a prefix of a segment as well-formed: it records the
//! certified byte length and a CRC32C over exactly those bytes. Masters
//! attach a certificate to replica writes; backups refuse to iterate a
//! segment whose certificate does not validate.

use bytes::{Buf, BufMut};
use segvault_common::checksum::compute_crc32c;
use segvault_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Encoded size of a certificate in bytes.
pub const CERTIFICATE_LEN: usize = 8;

/// Length and checksum sealing a segment prefix.
///
/// The default certificate (`length == 0`, `checksum == 0`) validates an
/// empty prefix, so a freshly opened replica is trivially well-formed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Number of bytes covered by the checksum.
    pub length: u32,
    /// CRC32C over the first `length` bytes.
    pub checksum: u32,
}

impl Certificate {
    /// Compute the certificate covering `buf[..length]`.
    pub fn compute(buf: &[u8], length: u32) -> Result<Self> {
        let len = length as usize;
        if len > buf.len() {
            return Err(Error::corruption(format!(
                "certificate length {} exceeds buffer length {}",
                length,
                buf.len()
            )));
        }
        Ok(Self {
            length,
            checksum: compute_crc32c(&buf[..len]),
        })
    }

    /// Verify that `buf` begins with the certified prefix.
    pub fn validate(&self, buf: &[u8]) -> Result<()> {
        let len = self.length as usize;
        if len > buf.len() {
            return Err(Error::corruption(format!(
                "certified length {} exceeds buffer length {}",
                self.length,
                buf.len()
            )));
        }
        let actual = compute_crc32c(&buf[..len]);
        if actual != self.checksum {
            return Err(Error::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Serialize to the fixed 8-byte encoding.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CERTIFICATE_LEN] {
        let mut buf = [0u8; CERTIFICATE_LEN];
        let mut cursor = &mut buf[..];
        cursor.put_u32_le(self.length);
        cursor.put_u32_le(self.checksum);
        buf
    }

    /// Parse from the fixed 8-byte encoding.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CERTIFICATE_LEN {
            return Err(Error::corruption("certificate too short"));
        }
        let mut buf = data;
        Ok(Self {
            length: buf.get_u32_le(),
            checksum: buf.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_and_validate() {
        let data = b"entry bytes go here";
        let cert = Certificate::compute(data, data.len() as u32).unwrap();
        cert.validate(data).unwrap();

        // A longer buffer with the same prefix still validates.
        let mut extended = data.to_vec();
        extended.extend_from_slice(b"uncertified tail");
        cert.validate(&extended).unwrap();
    }

    #[test]
    fn test_validate_detects_corruption() {
        let data = b"entry bytes go here";
        let cert = Certificate::compute(data, data.len() as u32).unwrap();

        let mut corrupted = data.to_vec();
        corrupted[3] ^= 0x40;
        assert!(matches!(
            cert.validate(&corrupted),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_short_buffer() {
        let data = b"entry bytes go here";
        let cert = Certificate::compute(data, data.len() as u32).unwrap();
        assert!(cert.validate(&data[..4]).is_err());
    }

    #[test]
    fn test_default_validates_empty() {
        Certificate::default().validate(&[]).unwrap();
        Certificate::default().validate(b"anything").unwrap();
    }

    #[test]
    fn test_roundtrip() {
        let cert = Certificate {
            length: 0x1234_5678,
            checksum: 0x9abc_def0,
        };
        let bytes = cert.to_bytes();
        assert_eq!(bytes.len(), CERTIFICATE_LEN);
        assert_eq!(Certificate::from_bytes(&bytes).unwrap(), cert);
    }
}
