//! Subkey list cells (li, lf, lh, ri).

use crate::error::{RegistryError, Result};
use crate::utils::read_u32_le;

/// Largest leaf the writer emits before splitting under an index root.
pub const MAX_LEAF_ENTRIES: usize = 1012;

/// Leaf size used when a key's subkeys are split under an index root.
pub const SPLIT_LEAF_ENTRIES: usize = 512;

/// Parsed subkey list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubkeyList {
    /// li/lf/lh: offsets of key nodes (hints dropped).
    Leaf(Vec<u32>),
    /// ri: offsets of further leaf lists.
    IndexRoot(Vec<u32>),
}

impl SubkeyList {
    /// Parses a subkey list from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (size field excluded).
    /// * `offset` - Offset of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < 4 {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: 4,
                actual: data.len(),
            });
        }

        let count = u16::from_le_bytes([data[2], data[3]]) as usize;
        let stride = match &data[0..2] {
            b"li" | b"ri" => 4,
            b"lf" | b"lh" => 8,
            other => {
                return Err(RegistryError::InvalidSubkeyList {
                    list_type: [other[0], other[1]],
                })
            }
        };

        let expected = 4 + count * stride;
        if data.len() < expected {
            return Err(RegistryError::TruncatedData {
                offset,
                expected,
                actual: data.len(),
            });
        }

        let offsets = (0..count)
            .map(|i| read_u32_le(data, 4 + i * stride))
            .collect::<Result<Vec<u32>>>()?;

        if &data[0..2] == b"ri" {
            Ok(SubkeyList::IndexRoot(offsets))
        } else {
            Ok(SubkeyList::Leaf(offsets))
        }
    }

    /// Serializes a hash leaf (lh) from `(key offset, key name)` pairs.
    ///
    /// Entries must already be in the hive's sort order.
    pub fn hash_leaf<'a, I>(entries: I) -> Vec<u8>
    where
        I: IntoIterator<Item = (u32, &'a str)>,
    {
        let entries: Vec<(u32, &str)> = entries.into_iter().collect();
        let mut out = Vec::with_capacity(4 + entries.len() * 8);
        out.extend_from_slice(b"lh");
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for (key_offset, name) in entries {
            out.extend_from_slice(&key_offset.to_le_bytes());
            out.extend_from_slice(&name_hash(name).to_le_bytes());
        }
        out
    }

    /// Serializes an index root (ri) over leaf list offsets.
    pub fn index_root(leaf_offsets: &[u32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + leaf_offsets.len() * 4);
        out.extend_from_slice(b"ri");
        out.extend_from_slice(&(leaf_offsets.len() as u16).to_le_bytes());
        for offset in leaf_offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out
    }
}

/// Name hash stored in lh entries: `hash * 37 + upcase(char)` over UTF-16.
pub fn name_hash(name: &str) -> u32 {
    name.to_uppercase()
        .encode_utf16()
        .fold(0u32, |hash, unit| hash.wrapping_mul(37).wrapping_add(u32::from(unit)))
}
