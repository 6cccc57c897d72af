//! Hive base block (the first 4 KiB of a regf file).

use crate::error::{RegistryError, Result};
use crate::utils::{filetime_to_datetime, read_u32_le, read_u64_le, utf16_bytes, utf16_lossy};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;

/// Size of the base block in bytes.
pub const BASE_BLOCK_SIZE: usize = 4096;

/// Expected signature for a valid registry hive ("regf").
pub const REGF_SIGNATURE: &[u8; 4] = b"regf";

/// Offset of the embedded file name.
const FILE_NAME_OFFSET: usize = 0x30;

/// Length of the file name field in bytes (64 UTF-16 code units).
const FILE_NAME_LENGTH: usize = 128;

/// Offset of the checksum field.
const CHECKSUM_OFFSET: usize = 0x1FC;

/// Minor version written by this crate (lh lists, big data blocks).
pub const WRITE_MINOR_VERSION: u32 = 5;

/// Hive base block header.
#[derive(Debug, Clone)]
pub struct BaseBlock {
    /// Primary sequence number.
    pub primary_sequence: u32,
    /// Secondary sequence number.
    pub secondary_sequence: u32,
    /// Last written timestamp (FILETIME).
    pub last_written: u64,
    /// Major format version.
    pub major_version: u32,
    /// Minor format version.
    pub minor_version: u32,
    /// Offset of the root key cell.
    pub root_cell_offset: u32,
    /// Total size of the hive bins in bytes.
    pub hive_length: u32,
    /// Embedded file name.
    pub file_name: String,
}

impl BaseBlock {
    /// Parses a base block from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is too small, the signature or checksum
    /// is wrong, or the version is outside 1.3 to 1.6.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: data.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }
        if &data[0..4] != REGF_SIGNATURE {
            return Err(RegistryError::invalid_signature(REGF_SIGNATURE, &data[0..4]));
        }

        let stored = read_u32_le(data, CHECKSUM_OFFSET)?;
        let calculated = calculate_checksum(data);
        if stored != calculated {
            return Err(RegistryError::ChecksumMismatch {
                expected: stored,
                calculated,
            });
        }

        let major_version = read_u32_le(data, 0x14)?;
        let minor_version = read_u32_le(data, 0x18)?;
        if major_version != 1 || !(3..=6).contains(&minor_version) {
            return Err(RegistryError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        let name_bytes = &data[FILE_NAME_OFFSET..FILE_NAME_OFFSET + FILE_NAME_LENGTH];
        let file_name = utf16_lossy(name_bytes)
            .trim_end_matches('\0')
            .to_string();

        Ok(BaseBlock {
            primary_sequence: read_u32_le(data, 0x04)?,
            secondary_sequence: read_u32_le(data, 0x08)?,
            last_written: read_u64_le(data, 0x0C)?,
            major_version,
            minor_version,
            root_cell_offset: read_u32_le(data, 0x24)?,
            hive_length: read_u32_le(data, 0x28)?,
            file_name,
        })
    }

    /// Creates a header for a freshly serialized hive.
    pub fn for_write(root_cell_offset: u32, hive_length: u32, last_written: u64, file_name: &str) -> Self {
        Self {
            primary_sequence: 1,
            secondary_sequence: 1,
            last_written,
            major_version: 1,
            minor_version: WRITE_MINOR_VERSION,
            root_cell_offset,
            hive_length,
            file_name: file_name.chars().take(FILE_NAME_LENGTH / 2 - 1).collect(),
        }
    }

    /// Serializes the base block, checksum included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BASE_BLOCK_SIZE);
        out.extend_from_slice(REGF_SIGNATURE);
        // Writes into a Vec cannot fail.
        let _ = out.write_u32::<LittleEndian>(self.primary_sequence);
        let _ = out.write_u32::<LittleEndian>(self.secondary_sequence);
        let _ = out.write_u64::<LittleEndian>(self.last_written);
        let _ = out.write_u32::<LittleEndian>(self.major_version);
        let _ = out.write_u32::<LittleEndian>(self.minor_version);
        let _ = out.write_u32::<LittleEndian>(0); // file type: primary
        let _ = out.write_u32::<LittleEndian>(1); // file format: direct memory load
        let _ = out.write_u32::<LittleEndian>(self.root_cell_offset);
        let _ = out.write_u32::<LittleEndian>(self.hive_length);
        let _ = out.write_u32::<LittleEndian>(1); // clustering factor

        let mut name = utf16_bytes(&self.file_name, false);
        name.resize(FILE_NAME_LENGTH, 0);
        out.extend_from_slice(&name);
        out.resize(BASE_BLOCK_SIZE, 0);

        let checksum = calculate_checksum(&out);
        out[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Returns true if the hive was cleanly flushed.
    pub fn is_consistent(&self) -> bool {
        self.primary_sequence == self.secondary_sequence
    }
}

impl fmt::Display for BaseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "regf {}.{} root={:#x} length={} consistent={} written={}",
            self.major_version,
            self.minor_version,
            self.root_cell_offset,
            self.hive_length,
            self.is_consistent(),
            filetime_to_datetime(self.last_written)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        )
    }
}

/// XOR of the first 127 dwords of the base block.
pub fn calculate_checksum(data: &[u8]) -> u32 {
    (0..CHECKSUM_OFFSET)
        .step_by(4)
        .filter_map(|i| read_u32_le(data, i).ok())
        .fold(0, |acc, dword| acc ^ dword)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_header() {
        let header = BaseBlock::for_write(0x20, 0x1000, 132_223_104_000_000_000, "SYSTEM");
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), BASE_BLOCK_SIZE);

        let parsed = BaseBlock::parse(&bytes).unwrap();
        assert_eq!(parsed.root_cell_offset, 0x20);
        assert_eq!(parsed.hive_length, 0x1000);
        assert_eq!(parsed.minor_version, WRITE_MINOR_VERSION);
        assert_eq!(parsed.file_name, "SYSTEM");
        assert!(parsed.is_consistent());
    }

    #[test]
    fn test_invalid_signature() {
        let mut data = vec![0u8; BASE_BLOCK_SIZE];
        data[0..4].copy_from_slice(b"XXXX");
        assert!(matches!(
            BaseBlock::parse(&data).unwrap_err(),
            RegistryError::InvalidSignature { .. }
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = BaseBlock::for_write(0x20, 0x1000, 0, "X").to_bytes();
        bytes[0x24] ^= 0xFF;
        assert!(matches!(
            BaseBlock::parse(&bytes).unwrap_err(),
            RegistryError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn test_too_small() {
        assert!(matches!(
            BaseBlock::parse(&[0u8; 100]).unwrap_err(),
            RegistryError::HiveTooSmall { .. }
        ));
    }
}
