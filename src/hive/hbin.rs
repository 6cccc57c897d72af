//! Hive bin (hbin) headers.

use crate::error::{RegistryError, Result};
use crate::utils::{read_u32_le, read_u64_le};

/// Expected signature for hive bins ("hbin").
pub const HBIN_SIGNATURE: &[u8; 4] = b"hbin";

/// Size of an hbin header.
pub const HBIN_HEADER_SIZE: usize = 0x20;

/// Hive bins are sized in multiples of this.
pub const HBIN_ALIGNMENT: usize = 0x1000;

/// Hive bin header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbinHeader {
    /// Offset of this bin relative to the first bin.
    pub offset: u32,
    /// Size of this bin including the header.
    pub size: u32,
    /// Timestamp (FILETIME), only meaningful in the first bin.
    pub timestamp: u64,
}

impl HbinHeader {
    /// Creates a header for a bin at `offset` of `size` bytes.
    pub fn new(offset: u32, size: u32, timestamp: u64) -> Self {
        Self {
            offset,
            size,
            timestamp,
        }
    }

    /// Parses an hbin header.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is short, the signature is wrong, or the
    /// stored offset disagrees with where the bin was found.
    pub fn parse(data: &[u8], expected_offset: u32) -> Result<Self> {
        if data.len() < HBIN_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset: expected_offset,
                expected: HBIN_HEADER_SIZE,
                actual: data.len(),
            });
        }
        if &data[0..4] != HBIN_SIGNATURE {
            return Err(RegistryError::invalid_signature(HBIN_SIGNATURE, &data[0..4]));
        }

        let offset = read_u32_le(data, 0x04)?;
        if offset != expected_offset {
            return Err(RegistryError::format_error(format!(
                "Hbin offset mismatch: expected {:#x}, found {:#x}",
                expected_offset, offset
            )));
        }
        let size = read_u32_le(data, 0x08)?;
        if size as usize % HBIN_ALIGNMENT != 0 || size == 0 {
            return Err(RegistryError::format_error(format!(
                "Hbin at {:#x} has unaligned size {:#x}",
                offset, size
            )));
        }

        Ok(HbinHeader {
            offset,
            size,
            timestamp: read_u64_le(data, 0x14)?,
        })
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; HBIN_HEADER_SIZE] {
        let mut out = [0u8; HBIN_HEADER_SIZE];
        out[0..4].copy_from_slice(HBIN_SIGNATURE);
        out[0x04..0x08].copy_from_slice(&self.offset.to_le_bytes());
        out[0x08..0x0C].copy_from_slice(&self.size.to_le_bytes());
        out[0x14..0x1C].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }
}
