//! Key node (nk) cells.

use crate::error::{RegistryError, Result};
use crate::hive::cell::{encode_name, KeyNodeFlags, NO_CELL};
use crate::utils::{read_latin1_string, read_u16_le, read_u32_le, read_u64_le, read_utf16_string};
use byteorder::{LittleEndian, WriteBytesExt};

/// Offset of the key name; also the fixed part's size.
const KEY_NAME_OFFSET: usize = 0x4C;

/// Key node (nk) structure, minus the fields this crate never uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNode {
    /// Flags for this key.
    pub flags: KeyNodeFlags,
    /// Last written timestamp (FILETIME).
    pub last_written: u64,
    /// Offset of the parent key node.
    pub parent_offset: u32,
    /// Number of stable subkeys.
    pub subkey_count: u32,
    /// Offset of the stable subkey list.
    pub subkey_list_offset: u32,
    /// Number of values.
    pub value_count: u32,
    /// Offset of the value list.
    pub value_list_offset: u32,
    /// Offset of the security cell.
    pub security_offset: u32,
    /// Offset of the class name.
    pub class_name_offset: u32,
    /// Longest subkey name in bytes (UTF-16).
    pub max_subkey_name_len: u32,
    /// Longest value name in bytes (UTF-16).
    pub max_value_name_len: u32,
    /// Largest value payload in bytes.
    pub max_value_data_len: u32,
    /// Key name.
    pub name: String,
}

impl KeyNode {
    /// Creates an empty node with the given name; lists are unset.
    pub fn new(name: &str, flags: KeyNodeFlags, last_written: u64) -> Self {
        Self {
            flags,
            last_written,
            parent_offset: NO_CELL,
            subkey_count: 0,
            subkey_list_offset: NO_CELL,
            value_count: 0,
            value_list_offset: NO_CELL,
            security_offset: NO_CELL,
            class_name_offset: NO_CELL,
            max_subkey_name_len: 0,
            max_value_name_len: 0,
            max_value_data_len: 0,
            name: name.to_string(),
        }
    }

    /// Parses a key node from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (size field excluded, starting with "nk").
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < KEY_NAME_OFFSET {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: KEY_NAME_OFFSET,
                actual: data.len(),
            });
        }
        if &data[0..2] != b"nk" {
            return Err(RegistryError::format_error(format!(
                "Expected 'nk' signature at offset {:#x}",
                offset
            )));
        }

        let flags = KeyNodeFlags(read_u16_le(data, 0x02)?);
        let name_length = read_u16_le(data, 0x48)? as usize;
        let name_end = KEY_NAME_OFFSET + name_length;
        let name_data = data.get(KEY_NAME_OFFSET..name_end).ok_or(RegistryError::TruncatedData {
            offset,
            expected: name_end,
            actual: data.len(),
        })?;
        let name = if flags.is_compressed() {
            read_latin1_string(name_data)
        } else {
            read_utf16_string(name_data, offset)?
        };

        Ok(KeyNode {
            flags,
            last_written: read_u64_le(data, 0x04)?,
            parent_offset: read_u32_le(data, 0x10)?,
            subkey_count: read_u32_le(data, 0x14)?,
            subkey_list_offset: read_u32_le(data, 0x1C)?,
            value_count: read_u32_le(data, 0x24)?,
            value_list_offset: read_u32_le(data, 0x28)?,
            security_offset: read_u32_le(data, 0x2C)?,
            class_name_offset: read_u32_le(data, 0x30)?,
            max_subkey_name_len: read_u32_le(data, 0x34)?,
            max_value_name_len: read_u32_le(data, 0x3C)?,
            max_value_data_len: read_u32_le(data, 0x40)?,
            name,
        })
    }

    /// Serializes the node into cell data (without the size field).
    ///
    /// The name is stored compressed when it fits Latin-1, and the
    /// `COMP_NAME` flag is set to match.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (name, compressed) = encode_name(&self.name);
        let flags = self.flags.with(KeyNodeFlags::COMP_NAME, compressed);

        let mut out = Vec::with_capacity(KEY_NAME_OFFSET + name.len());
        out.extend_from_slice(b"nk");
        // Writes into a Vec cannot fail.
        let _ = out.write_u16::<LittleEndian>(flags.0);
        let _ = out.write_u64::<LittleEndian>(self.last_written);
        let _ = out.write_u32::<LittleEndian>(0); // access bits
        let _ = out.write_u32::<LittleEndian>(self.parent_offset);
        let _ = out.write_u32::<LittleEndian>(self.subkey_count);
        let _ = out.write_u32::<LittleEndian>(0); // volatile subkey count
        let _ = out.write_u32::<LittleEndian>(self.subkey_list_offset);
        let _ = out.write_u32::<LittleEndian>(NO_CELL); // volatile subkey list
        let _ = out.write_u32::<LittleEndian>(self.value_count);
        let _ = out.write_u32::<LittleEndian>(self.value_list_offset);
        let _ = out.write_u32::<LittleEndian>(self.security_offset);
        let _ = out.write_u32::<LittleEndian>(self.class_name_offset);
        let _ = out.write_u32::<LittleEndian>(self.max_subkey_name_len);
        let _ = out.write_u32::<LittleEndian>(0); // max subkey class length
        let _ = out.write_u32::<LittleEndian>(self.max_value_name_len);
        let _ = out.write_u32::<LittleEndian>(self.max_value_data_len);
        let _ = out.write_u32::<LittleEndian>(0); // work var
        let _ = out.write_u16::<LittleEndian>(name.len() as u16);
        let _ = out.write_u16::<LittleEndian>(0); // class name length
        out.extend_from_slice(&name);
        out
    }

    /// Returns true if the subkey list offset points somewhere.
    pub fn has_subkeys(&self) -> bool {
        self.subkey_count > 0 && self.subkey_list_offset != NO_CELL
    }

    /// Returns true if the value list offset points somewhere.
    pub fn has_values(&self) -> bool {
        self.value_count > 0 && self.value_list_offset != NO_CELL
    }
}
