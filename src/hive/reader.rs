//! Reads a regf hive into a [`HiveKey`] tree.

use crate::error::{RegistryError, Result};
use crate::hive::bigdata::{BigDataBlock, MAX_DIRECT_DATA};
use crate::hive::cell::{cell_offset_to_absolute, CellType, NO_CELL};
use crate::hive::hbin::HbinHeader;
use crate::hive::header::{BaseBlock, BASE_BLOCK_SIZE};
use crate::hive::key::KeyNode;
use crate::hive::subkey_list::SubkeyList;
use crate::hive::tree::HiveKey;
use crate::hive::value_key::ValueKey;
use crate::utils::read_u32_le;
use crate::value::ValueEntry;
use memmap2::Mmap;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Deepest key nesting accepted before the hive is treated as corrupt.
const MAX_KEY_DEPTH: usize = 512;

/// Hive data, either memory-mapped or owned.
enum HiveData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl HiveData {
    fn as_slice(&self) -> &[u8] {
        match self {
            HiveData::Mapped(mmap) => mmap,
            HiveData::Owned(data) => data,
        }
    }
}

/// Read-only view over a hive file's cells.
pub struct HiveReader {
    data: HiveData,
    base_block: BaseBlock,
}

impl HiveReader {
    /// Memory-maps and validates a hive file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is not a valid hive.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len() as usize;
        if file_size < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: file_size,
                minimum: BASE_BLOCK_SIZE,
            });
        }

        // SAFETY: the file is opened read-only, its size was checked above, the
        // map lives no longer than the reader, and every access below goes
        // through bounds-checked slicing.
        let mmap = unsafe { Mmap::map(&file)? };
        debug!(size = mmap.len(), "Memory mapped hive file");
        Self::from_data(HiveData::Mapped(mmap))
    }

    /// Wraps hive bytes already in memory.
    pub fn from_vec(data: Vec<u8>) -> Result<Self> {
        Self::from_data(HiveData::Owned(data))
    }

    fn from_data(data: HiveData) -> Result<Self> {
        let bytes = data.as_slice();
        let base_block = BaseBlock::parse(bytes)?;
        HbinHeader::parse(&bytes[BASE_BLOCK_SIZE..], 0)?;
        if !base_block.is_consistent() {
            warn!(
                primary = base_block.primary_sequence,
                secondary = base_block.secondary_sequence,
                "Hive was not cleanly flushed; reading primary image as-is"
            );
        }
        Ok(Self { data, base_block })
    }

    /// Parsed base block.
    pub fn base_block(&self) -> &BaseBlock {
        &self.base_block
    }

    /// Loads the whole key tree.
    pub fn load_tree(&self) -> Result<HiveKey> {
        let mut visited = HashSet::new();
        let root = self.load_key(self.base_block.root_cell_offset, 0, &mut visited)?;
        info!(keys = visited.len(), "Loaded hive tree");
        Ok(root)
    }

    fn load_key(&self, offset: u32, depth: usize, visited: &mut HashSet<u32>) -> Result<HiveKey> {
        if depth > MAX_KEY_DEPTH || !visited.insert(offset) {
            return Err(RegistryError::format_error(format!(
                "Key node {:#x} is nested too deeply or referenced twice",
                offset
            )));
        }

        let node = KeyNode::parse(self.read_cell(offset)?, offset)?;
        let mut key = HiveKey {
            name: node.name.clone(),
            is_link: node.flags.is_symlink(),
            last_written: node.last_written,
            values: Vec::new(),
            subkeys: Vec::new(),
        };

        if node.has_values() {
            key.values = self.load_values(&node)?;
        }

        if node.has_subkeys() {
            let mut offsets = Vec::new();
            self.collect_subkey_offsets(node.subkey_list_offset, &mut offsets, 0)?;
            for child_offset in offsets {
                key.subkeys.push(self.load_key(child_offset, depth + 1, visited)?);
            }
        }

        Ok(key)
    }

    fn collect_subkey_offsets(&self, list_offset: u32, out: &mut Vec<u32>, depth: usize) -> Result<()> {
        if list_offset == NO_CELL || list_offset == 0 {
            return Ok(());
        }
        match SubkeyList::parse(self.read_cell(list_offset)?, list_offset)? {
            SubkeyList::Leaf(offsets) => out.extend(offsets),
            SubkeyList::IndexRoot(lists) => {
                // An index root only ever points at leaves.
                if depth > 0 {
                    return Err(RegistryError::format_error(format!(
                        "Nested index root at {:#x}",
                        list_offset
                    )));
                }
                for sub in lists {
                    self.collect_subkey_offsets(sub, out, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn load_values(&self, node: &KeyNode) -> Result<Vec<ValueEntry>> {
        let list = self.read_cell(node.value_list_offset)?;
        let count = node.value_count as usize;
        if list.len() / 4 < count {
            return Err(RegistryError::TruncatedData {
                offset: node.value_list_offset,
                expected: count.saturating_mul(4),
                actual: list.len(),
            });
        }

        (0..count)
            .map(|i| {
                let vk_offset = read_u32_le(list, i * 4)?;
                let vk = ValueKey::parse(self.read_cell(vk_offset)?, vk_offset)?;
                let data = self.read_value_data(&vk)?;
                Ok(ValueEntry::new(vk.name, vk.data_type, data))
            })
            .collect()
    }

    fn read_value_data(&self, vk: &ValueKey) -> Result<Vec<u8>> {
        if vk.inline {
            return Ok(vk.inline_data());
        }
        if vk.data_length == 0 || vk.data_offset == NO_CELL {
            return Ok(Vec::new());
        }

        let length = vk.data_length as usize;
        let cell = self.read_cell(vk.data_offset)?;
        if length > MAX_DIRECT_DATA && CellType::of(cell) == Some(CellType::DataBlock) {
            return self.read_big_data(cell, vk.data_offset, length);
        }
        if cell.len() < length {
            return Err(RegistryError::TruncatedData {
                offset: vk.data_offset,
                expected: length,
                actual: cell.len(),
            });
        }
        Ok(cell[..length].to_vec())
    }

    fn read_big_data(&self, header: &[u8], offset: u32, length: usize) -> Result<Vec<u8>> {
        let db = BigDataBlock::parse(header, offset)?;
        debug!(segments = db.segment_count, length, "Reading big data block");

        let capacity = db.segment_count as usize * MAX_DIRECT_DATA;
        if length > capacity {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: length,
                actual: capacity,
            });
        }

        let list = self.read_cell(db.segment_list_offset)?;
        let mut data = Vec::with_capacity(length);
        for i in 0..db.segment_count as usize {
            let segment_offset = read_u32_le(list, i * 4)?;
            let segment = self.read_cell(segment_offset)?;
            let take = (length - data.len()).min(segment.len()).min(MAX_DIRECT_DATA);
            data.extend_from_slice(&segment[..take]);
            if data.len() >= length {
                break;
            }
        }

        if data.len() < length {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: length,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Reads a cell's data (size field excluded).
    fn read_cell(&self, offset: u32) -> Result<&[u8]> {
        let data = self.data.as_slice();
        let abs = cell_offset_to_absolute(offset)? as usize;
        if abs + 4 > data.len() {
            return Err(RegistryError::invalid_offset(offset, data.len()));
        }

        let size = i32::from_le_bytes([data[abs], data[abs + 1], data[abs + 2], data[abs + 3]]);
        let abs_size = size.unsigned_abs() as usize;
        if abs_size < 8 {
            return Err(RegistryError::invalid_cell_size(size, offset));
        }

        let end = abs + abs_size;
        if end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: abs_size,
                actual: data.len() - abs,
            });
        }
        Ok(&data[abs + 4..end])
    }
}
