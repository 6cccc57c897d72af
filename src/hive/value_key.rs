//! Value key (vk) cells.

use crate::error::{RegistryError, Result};
use crate::hive::cell::{encode_name, NO_CELL};
use crate::utils::{read_latin1_string, read_u16_le, read_u32_le, read_utf16_string};
use crate::value::ValueType;
use byteorder::{LittleEndian, WriteBytesExt};

/// Offset of the value name; also the fixed part's size.
const VALUE_NAME_OFFSET: usize = 0x14;

/// High bit of the data length marks data stored in the offset field.
const INLINE_DATA_FLAG: u32 = 0x8000_0000;

/// Value name is stored compressed (Latin-1).
const VALUE_COMP_NAME: u16 = 0x0001;

/// Largest payload that fits in the offset field.
pub const MAX_INLINE_DATA: usize = 4;

/// Value key (vk) structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueKey {
    /// Payload length in bytes.
    pub data_length: u32,
    /// Whether the payload lives in `data_offset` itself.
    pub inline: bool,
    /// Offset of the payload cell, or the inline payload.
    pub data_offset: u32,
    /// Value type.
    pub data_type: ValueType,
    /// Value name; empty for the default value.
    pub name: String,
}

impl ValueKey {
    /// Parses a value key from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (size field excluded, starting with "vk").
    /// * `offset` - Offset of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < VALUE_NAME_OFFSET {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: VALUE_NAME_OFFSET,
                actual: data.len(),
            });
        }
        if &data[0..2] != b"vk" {
            return Err(RegistryError::format_error(format!(
                "Expected 'vk' signature at offset {:#x}",
                offset
            )));
        }

        let name_length = read_u16_le(data, 0x02)? as usize;
        let raw_length = read_u32_le(data, 0x04)?;
        let flags = read_u16_le(data, 0x10)?;

        let name_end = VALUE_NAME_OFFSET + name_length;
        let name_data = data.get(VALUE_NAME_OFFSET..name_end).ok_or(RegistryError::TruncatedData {
            offset,
            expected: name_end,
            actual: data.len(),
        })?;
        let name = if flags & VALUE_COMP_NAME != 0 {
            read_latin1_string(name_data)
        } else {
            read_utf16_string(name_data, offset)?
        };

        Ok(ValueKey {
            data_length: raw_length & !INLINE_DATA_FLAG,
            inline: raw_length & INLINE_DATA_FLAG != 0,
            data_offset: read_u32_le(data, 0x08)?,
            data_type: ValueType::from_u32(read_u32_le(data, 0x0C)?),
            name,
        })
    }

    /// Builds a value key whose payload is stored inline.
    ///
    /// Returns `None` if the payload is too large for the offset field.
    pub fn inline(name: &str, data_type: ValueType, data: &[u8]) -> Option<Self> {
        if data.is_empty() || data.len() > MAX_INLINE_DATA {
            return None;
        }
        let mut packed = [0u8; 4];
        packed[..data.len()].copy_from_slice(data);
        Some(Self {
            data_length: data.len() as u32,
            inline: true,
            data_offset: u32::from_le_bytes(packed),
            data_type,
            name: name.to_string(),
        })
    }

    /// Builds a value key pointing at a payload cell (or none when empty).
    pub fn external(name: &str, data_type: ValueType, data_length: u32, data_offset: u32) -> Self {
        Self {
            data_length,
            inline: false,
            data_offset: if data_length == 0 { NO_CELL } else { data_offset },
            data_type,
            name: name.to_string(),
        }
    }

    /// Extracts the inline payload.
    pub fn inline_data(&self) -> Vec<u8> {
        let len = (self.data_length as usize).min(MAX_INLINE_DATA);
        self.data_offset.to_le_bytes()[..len].to_vec()
    }

    /// Serializes the value key into cell data (without the size field).
    pub fn to_bytes(&self) -> Vec<u8> {
        let (name, compressed) = encode_name(&self.name);
        let raw_length = if self.inline {
            self.data_length | INLINE_DATA_FLAG
        } else {
            self.data_length
        };

        let mut out = Vec::with_capacity(VALUE_NAME_OFFSET + name.len());
        out.extend_from_slice(b"vk");
        // Writes into a Vec cannot fail.
        let _ = out.write_u16::<LittleEndian>(name.len() as u16);
        let _ = out.write_u32::<LittleEndian>(raw_length);
        let _ = out.write_u32::<LittleEndian>(self.data_offset);
        let _ = out.write_u32::<LittleEndian>(self.data_type.as_u32());
        let _ = out.write_u16::<LittleEndian>(if compressed { VALUE_COMP_NAME } else { 0 });
        let _ = out.write_u16::<LittleEndian>(0); // spare
        out.extend_from_slice(&name);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_key_minimum_size() {
        assert!(ValueKey::parse(&[0u8; 19], 0).is_err());
    }

    #[test]
    fn test_value_key_invalid_signature() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"XX");
        assert!(ValueKey::parse(&data, 0).is_err());
    }

    #[test]
    fn test_inline_roundtrip() {
        let vk = ValueKey::inline("Start", ValueType::Dword, &[0x02, 0, 0, 0]).unwrap();
        let parsed = ValueKey::parse(&vk.to_bytes(), 0).unwrap();
        assert!(parsed.inline);
        assert_eq!(parsed.name, "Start");
        assert_eq!(parsed.data_type, ValueType::Dword);
        assert_eq!(parsed.inline_data(), vec![0x02, 0, 0, 0]);
    }

    #[test]
    fn test_external_default_value() {
        let vk = ValueKey::external("", ValueType::String, 10, 0x340);
        let parsed = ValueKey::parse(&vk.to_bytes(), 0).unwrap();
        assert!(!parsed.inline);
        assert_eq!(parsed.name, "");
        assert_eq!(parsed.data_length, 10);
        assert_eq!(parsed.data_offset, 0x340);
    }

    #[test]
    fn test_inline_rejects_large() {
        assert!(ValueKey::inline("x", ValueType::Binary, &[0; 5]).is_none());
        assert!(ValueKey::inline("x", ValueType::Binary, &[]).is_none());
    }
}
