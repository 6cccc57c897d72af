//! Serializes a [`HiveKey`] tree into a regf 1.5 image.
//!
//! The image has a single hbin. Cells are allocated front to back; a key node
//! is allocated first as a placeholder and rewritten in place once its value
//! and subkey lists exist, so a parent always precedes its children.

use crate::error::{RegistryError, Result};
use crate::hive::bigdata::{segments, BigDataBlock, MAX_DIRECT_DATA};
use crate::hive::cell::{aligned_cell_size, KeyNodeFlags, NO_CELL};
use crate::hive::hbin::{HbinHeader, HBIN_ALIGNMENT, HBIN_HEADER_SIZE};
use crate::hive::header::BaseBlock;
use crate::hive::key::KeyNode;
use crate::hive::subkey_list::{SubkeyList, MAX_LEAF_ENTRIES, SPLIT_LEAF_ENTRIES};
use crate::hive::tree::HiveKey;
use crate::hive::value_key::{ValueKey, MAX_INLINE_DATA};
use crate::utils::filetime_now;
use crate::value::ValueEntry;
use tracing::debug;

/// Self-relative security descriptor granting full control to Everyone.
const DEFAULT_SECURITY_DESCRIPTOR: [u8; 48] = [
    // SECURITY_DESCRIPTOR_RELATIVE: revision 1, control SE_SELF_RELATIVE | SE_DACL_PRESENT
    0x01, 0x00, 0x04, 0x80, //
    0x00, 0x00, 0x00, 0x00, // owner
    0x00, 0x00, 0x00, 0x00, // group
    0x00, 0x00, 0x00, 0x00, // sacl
    0x14, 0x00, 0x00, 0x00, // dacl
    // ACL: revision 2, size 28, one ACE
    0x02, 0x00, 0x1C, 0x00, 0x01, 0x00, 0x00, 0x00, //
    // ACCESS_ALLOWED_ACE: inherit to objects and containers, KEY_ALL_ACCESS
    0x00, 0x03, 0x14, 0x00, 0x3F, 0x00, 0x0F, 0x00, //
    // S-1-1-0
    0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
];

/// Offset of the reference count inside an sk cell's data.
const SECURITY_REFCOUNT_OFFSET: usize = 0x0C;

/// Builds a hive image cell by cell.
pub struct HiveWriter {
    bin: Vec<u8>,
    security_offset: u32,
    security_refs: u32,
}

impl HiveWriter {
    /// Serializes `root` as the root key of a new hive image.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is too large for the big data format.
    pub fn serialize(root: &HiveKey, file_name: &str) -> Result<Vec<u8>> {
        let mut writer = HiveWriter {
            bin: vec![0u8; HBIN_HEADER_SIZE],
            security_offset: NO_CELL,
            security_refs: 0,
        };
        writer.security_offset = writer.alloc_security();

        let root_offset = writer.write_key(root, NO_CELL, true)?;
        writer.patch_security_refs();
        let hive_length = writer.pad();

        let now = filetime_now();
        writer.bin[..HBIN_HEADER_SIZE]
            .copy_from_slice(&HbinHeader::new(0, hive_length, now).to_bytes());

        let mut image = BaseBlock::for_write(root_offset, hive_length, now, file_name).to_bytes();
        image.extend_from_slice(&writer.bin);
        debug!(
            keys = root.key_count(),
            bytes = image.len(),
            "Serialized hive image"
        );
        Ok(image)
    }

    /// Allocates a used cell holding `payload`; returns its relative offset.
    fn alloc(&mut self, payload: &[u8]) -> u32 {
        let offset = self.bin.len() as u32;
        let size = aligned_cell_size(payload.len());
        self.bin.extend_from_slice(&(-(size as i32)).to_le_bytes());
        self.bin.extend_from_slice(payload);
        self.bin.resize(offset as usize + size, 0);
        offset
    }

    /// Rewrites the payload of a cell allocated earlier with the same length.
    fn overwrite(&mut self, offset: u32, payload: &[u8]) {
        let start = offset as usize + 4;
        self.bin[start..start + payload.len()].copy_from_slice(payload);
    }

    fn alloc_offsets(&mut self, offsets: &[u32]) -> u32 {
        let bytes: Vec<u8> = offsets.iter().flat_map(|o| o.to_le_bytes()).collect();
        self.alloc(&bytes)
    }

    fn alloc_security(&mut self) -> u32 {
        let offset = self.bin.len() as u32;
        let mut sk = Vec::with_capacity(0x14 + DEFAULT_SECURITY_DESCRIPTOR.len());
        sk.extend_from_slice(b"sk");
        sk.extend_from_slice(&0u16.to_le_bytes());
        // Single descriptor: the list links back to itself.
        sk.extend_from_slice(&offset.to_le_bytes());
        sk.extend_from_slice(&offset.to_le_bytes());
        sk.extend_from_slice(&0u32.to_le_bytes());
        sk.extend_from_slice(&(DEFAULT_SECURITY_DESCRIPTOR.len() as u32).to_le_bytes());
        sk.extend_from_slice(&DEFAULT_SECURITY_DESCRIPTOR);
        self.alloc(&sk)
    }

    fn patch_security_refs(&mut self) {
        let at = self.security_offset as usize + 4 + SECURITY_REFCOUNT_OFFSET;
        self.bin[at..at + 4].copy_from_slice(&self.security_refs.to_le_bytes());
    }

    /// Pads the bin to the alignment with a free cell; returns the bin size.
    fn pad(&mut self) -> u32 {
        let used = self.bin.len();
        let total = (used + HBIN_ALIGNMENT - 1) / HBIN_ALIGNMENT * HBIN_ALIGNMENT;
        if total > used {
            let free = (total - used) as i32;
            self.bin.extend_from_slice(&free.to_le_bytes());
            self.bin.resize(total, 0);
        }
        total as u32
    }

    fn write_key(&mut self, key: &HiveKey, parent: u32, is_root: bool) -> Result<u32> {
        let flags = KeyNodeFlags::default()
            .with(KeyNodeFlags::HIVE_ENTRY | KeyNodeFlags::NO_DELETE, is_root)
            .with(KeyNodeFlags::SYM_LINK, key.is_link);
        let mut node = KeyNode::new(&key.name, flags, key.last_written);
        node.parent_offset = parent;
        node.security_offset = self.security_offset;
        self.security_refs += 1;

        let offset = self.alloc(&node.to_bytes());

        if !key.values.is_empty() {
            let value_offsets = key
                .values
                .iter()
                .map(|value| self.write_value(value))
                .collect::<Result<Vec<u32>>>()?;
            node.value_count = value_offsets.len() as u32;
            node.value_list_offset = self.alloc_offsets(&value_offsets);
            node.max_value_name_len = key
                .values
                .iter()
                .map(|v| v.name.encode_utf16().count() as u32 * 2)
                .max()
                .unwrap_or(0);
            node.max_value_data_len = key.max_value_data_len() as u32;
        }

        if !key.subkeys.is_empty() {
            let child_offsets = key
                .subkeys
                .iter()
                .map(|child| self.write_key(child, offset, false))
                .collect::<Result<Vec<u32>>>()?;
            node.subkey_count = child_offsets.len() as u32;
            node.subkey_list_offset = self.write_subkey_list(key, &child_offsets);
            node.max_subkey_name_len = key
                .subkeys
                .iter()
                .map(|k| k.name.encode_utf16().count() as u32 * 2)
                .max()
                .unwrap_or(0);
        }

        self.overwrite(offset, &node.to_bytes());
        Ok(offset)
    }

    fn write_subkey_list(&mut self, key: &HiveKey, child_offsets: &[u32]) -> u32 {
        let entries: Vec<(u32, &str)> = child_offsets
            .iter()
            .copied()
            .zip(key.subkeys.iter().map(|k| k.name.as_str()))
            .collect();

        if entries.len() <= MAX_LEAF_ENTRIES {
            return self.alloc(&SubkeyList::hash_leaf(entries));
        }

        let leaves: Vec<u32> = entries
            .chunks(SPLIT_LEAF_ENTRIES)
            .map(|chunk| self.alloc(&SubkeyList::hash_leaf(chunk.iter().copied())))
            .collect();
        self.alloc(&SubkeyList::index_root(&leaves))
    }

    fn write_value(&mut self, value: &ValueEntry) -> Result<u32> {
        let data = &value.data;
        let vk = if !data.is_empty() && data.len() <= MAX_INLINE_DATA {
            ValueKey::inline(&value.name, value.value_type, data)
                .ok_or_else(|| RegistryError::format_error(format!("Value '{}' cannot be inlined", value.name)))?
        } else if data.len() <= MAX_DIRECT_DATA {
            let data_offset = if data.is_empty() { NO_CELL } else { self.alloc(data) };
            ValueKey::external(&value.name, value.value_type, data.len() as u32, data_offset)
        } else {
            let db_offset = self.write_big_data(&value.name, data)?;
            ValueKey::external(&value.name, value.value_type, data.len() as u32, db_offset)
        };
        Ok(self.alloc(&vk.to_bytes()))
    }

    fn write_big_data(&mut self, name: &str, data: &[u8]) -> Result<u32> {
        let segment_offsets: Vec<u32> = segments(data).map(|segment| self.alloc(segment)).collect();
        let segment_count = u16::try_from(segment_offsets.len()).map_err(|_| {
            RegistryError::format_error(format!(
                "Value '{}' is too large to store ({} bytes)",
                name,
                data.len()
            ))
        })?;
        let segment_list_offset = self.alloc_offsets(&segment_offsets);
        let header = BigDataBlock {
            segment_count,
            segment_list_offset,
        };
        Ok(self.alloc(&header.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::header::BASE_BLOCK_SIZE;

    #[test]
    fn test_empty_hive_layout() {
        let image = HiveWriter::serialize(&HiveKey::new("ROOT"), "test.hiv").unwrap();
        assert_eq!(image.len() % HBIN_ALIGNMENT, 0);
        assert_eq!(&image[0..4], b"regf");
        assert_eq!(&image[BASE_BLOCK_SIZE..BASE_BLOCK_SIZE + 4], b"hbin");

        let base = BaseBlock::parse(&image).unwrap();
        assert_eq!(base.hive_length as usize, image.len() - BASE_BLOCK_SIZE);
        // The security cell comes first.
        assert_eq!(&image[BASE_BLOCK_SIZE + HBIN_HEADER_SIZE + 4..][..2], b"sk");
    }

    #[test]
    fn test_security_refcount_matches_keys() {
        let mut root = HiveKey::new("ROOT");
        root.insert_subkey(HiveKey::new("A"));
        root.insert_subkey(HiveKey::new("B"));
        let image = HiveWriter::serialize(&root, "").unwrap();

        let sk = BASE_BLOCK_SIZE + HBIN_HEADER_SIZE + 4;
        let refs = u32::from_le_bytes([
            image[sk + SECURITY_REFCOUNT_OFFSET],
            image[sk + SECURITY_REFCOUNT_OFFSET + 1],
            image[sk + SECURITY_REFCOUNT_OFFSET + 2],
            image[sk + SECURITY_REFCOUNT_OFFSET + 3],
        ]);
        assert_eq!(refs, 3);
    }
}
