//! Cell signatures, key node flags and cell addressing.
//!
//! Cells are the allocation unit inside hive bins. Each starts with a signed
//! 32-bit size (negative while allocated) followed by a 2-byte signature.

use crate::error::{RegistryError, Result};

/// Offset of the first hive bin in the file; cell offsets are relative to it.
pub const HBIN_START_OFFSET: u32 = 0x1000;

/// Marker for "no cell" in offset fields.
pub const NO_CELL: u32 = 0xFFFF_FFFF;

/// Cells are padded to this alignment.
pub const CELL_ALIGNMENT: usize = 8;

/// Cell type signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    /// Key node (nk).
    KeyNode,
    /// Value key (vk).
    ValueKey,
    /// Security descriptor (sk).
    Security,
    /// Index leaf (li).
    IndexLeaf,
    /// Fast leaf (lf).
    FastLeaf,
    /// Hash leaf (lh).
    HashLeaf,
    /// Index root (ri).
    IndexRoot,
    /// Big data block (db).
    DataBlock,
}

impl CellType {
    /// Parses a cell type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2]) -> Result<Self> {
        match sig {
            b"nk" => Ok(CellType::KeyNode),
            b"vk" => Ok(CellType::ValueKey),
            b"sk" => Ok(CellType::Security),
            b"li" => Ok(CellType::IndexLeaf),
            b"lf" => Ok(CellType::FastLeaf),
            b"lh" => Ok(CellType::HashLeaf),
            b"ri" => Ok(CellType::IndexRoot),
            b"db" => Ok(CellType::DataBlock),
            _ => Err(RegistryError::format_error(format!(
                "Unknown cell signature {:?}",
                sig
            ))),
        }
    }

    /// Returns the 2-byte signature for this cell type.
    pub fn signature(&self) -> &'static [u8; 2] {
        match self {
            CellType::KeyNode => b"nk",
            CellType::ValueKey => b"vk",
            CellType::Security => b"sk",
            CellType::IndexLeaf => b"li",
            CellType::FastLeaf => b"lf",
            CellType::HashLeaf => b"lh",
            CellType::IndexRoot => b"ri",
            CellType::DataBlock => b"db",
        }
    }

    /// Identifies a cell from its data, if it carries a known signature.
    pub fn of(data: &[u8]) -> Option<Self> {
        let sig: [u8; 2] = data.get(0..2)?.try_into().ok()?;
        Self::from_signature(&sig).ok()
    }
}

/// Flags for key nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyNodeFlags(pub u16);

impl KeyNodeFlags {
    /// Key is volatile (not stored on disk).
    pub const VOLATILE: u16 = 0x0001;
    /// Key is a mount point for another hive.
    pub const HIVE_EXIT: u16 = 0x0002;
    /// Key is the hive root.
    pub const HIVE_ENTRY: u16 = 0x0004;
    /// Key cannot be deleted.
    pub const NO_DELETE: u16 = 0x0008;
    /// Key is a symbolic link.
    pub const SYM_LINK: u16 = 0x0010;
    /// Key name is stored compressed (Latin-1).
    pub const COMP_NAME: u16 = 0x0020;

    /// Returns true if the specified flag is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    /// Returns the flags with `flag` set or cleared.
    pub fn with(self, flag: u16, on: bool) -> Self {
        if on {
            Self(self.0 | flag)
        } else {
            Self(self.0 & !flag)
        }
    }

    /// Returns true if the key name is compressed.
    pub fn is_compressed(&self) -> bool {
        self.has_flag(Self::COMP_NAME)
    }

    /// Returns true if this is a symbolic link key.
    pub fn is_symlink(&self) -> bool {
        self.has_flag(Self::SYM_LINK)
    }

    /// Returns true if this is the hive root.
    pub fn is_root(&self) -> bool {
        self.has_flag(Self::HIVE_ENTRY)
    }
}

/// Converts a relative cell offset to an absolute file offset.
///
/// # Errors
///
/// Returns `RegistryError::InvalidOffset` if the addition would overflow.
#[inline]
pub fn cell_offset_to_absolute(cell_offset: u32) -> Result<u32> {
    cell_offset
        .checked_add(HBIN_START_OFFSET)
        .ok_or_else(|| RegistryError::invalid_offset(cell_offset, 0))
}

/// Rounds a cell's total size (size field included) up to the alignment.
#[inline]
pub fn aligned_cell_size(payload_len: usize) -> usize {
    (payload_len + 4 + CELL_ALIGNMENT - 1) & !(CELL_ALIGNMENT - 1)
}

/// Returns true if a name fits the compressed (Latin-1) encoding.
pub fn is_compressible(name: &str) -> bool {
    name.chars().all(|c| (c as u32) <= 0xFF)
}

/// Encodes a key or value name, compressed when possible.
///
/// Returns the bytes and whether they are compressed.
pub fn encode_name(name: &str) -> (Vec<u8>, bool) {
    if is_compressible(name) {
        (name.chars().map(|c| c as u32 as u8).collect(), true)
    } else {
        (crate::utils::utf16_bytes(name, false), false)
    }
}
