//! Big data (db) cells for value payloads over 16,344 bytes.
//!
//! ```text
//! Offset  Size  Description
//! 0x00    2     Signature ("db")
//! 0x02    2     Number of segments
//! 0x04    4     Offset of the segment list cell
//! ```

use crate::error::{RegistryError, Result};
use crate::utils::{read_u16_le, read_u32_le};

/// Payloads longer than this are split into big data segments.
pub const MAX_DIRECT_DATA: usize = 16344;

/// Big data block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigDataBlock {
    /// Number of data segments.
    pub segment_count: u16,
    /// Offset of the cell listing segment offsets.
    pub segment_list_offset: u32,
}

impl BigDataBlock {
    const SIZE: usize = 8;

    /// Parses a big data header from cell data.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        if &data[0..2] != b"db" {
            return Err(RegistryError::format_error(format!(
                "Expected 'db' signature at offset {:#x}, found {:?}",
                offset,
                &data[0..2]
            )));
        }

        Ok(BigDataBlock {
            segment_count: read_u16_le(data, 0x02)?,
            segment_list_offset: read_u32_le(data, 0x04)?,
        })
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(b"db");
        out.extend_from_slice(&self.segment_count.to_le_bytes());
        out.extend_from_slice(&self.segment_list_offset.to_le_bytes());
        out
    }
}

/// Splits a payload into big data segments.
pub fn segments(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.chunks(MAX_DIRECT_DATA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bigdata_minimum_size() {
        assert!(BigDataBlock::parse(&[0u8; 7], 0).is_err());
    }

    #[test]
    fn test_bigdata_invalid_signature() {
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(b"XX");
        assert!(BigDataBlock::parse(&data, 0).is_err());
    }

    #[test]
    fn test_bigdata_roundtrip() {
        let block = BigDataBlock {
            segment_count: 5,
            segment_list_offset: 0x20,
        };
        assert_eq!(BigDataBlock::parse(&block.to_bytes(), 0).unwrap(), block);
    }

    #[test]
    fn test_segments() {
        let data = vec![7u8; MAX_DIRECT_DATA * 2 + 1];
        let lens: Vec<usize> = segments(&data).map(<[u8]>::len).collect();
        assert_eq!(lens, vec![MAX_DIRECT_DATA, MAX_DIRECT_DATA, 1]);
    }
}
