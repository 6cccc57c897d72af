//! Pure-Rust regf hive engine.
//!
//! [`RegfHiveApi`] loads a hive file into an editable [`HiveKey`] tree and
//! writes the tree back out as a fresh regf 1.5 image. It implements
//! [`HiveApi`], so it plugs straight into the offline backend.
//!
//! # Example
//!
//! ```rust
//! use unireg::hive::RegfHiveApi;
//! use unireg::offline::HiveApi;
//! use unireg::path::KeyPath;
//! use unireg::value::ValueEntry;
//!
//! let api = RegfHiveApi::new();
//! let hive = api.create_hive()?;
//! api.create_key(hive, &KeyPath::new(), "Software", false)?;
//! api.set_value(hive, &KeyPath::parse("Software"), &ValueEntry::dword("Level", 3))?;
//! assert_eq!(api.query_info(hive, &KeyPath::new())?.subkey_count, 1);
//! # Ok::<(), unireg::error::RegistryError>(())
//! ```

pub mod bigdata;
pub mod cell;
pub mod hbin;
pub mod header;
pub mod key;
pub mod reader;
pub mod subkey_list;
pub mod tree;
pub mod value_key;
pub mod writer;

pub use reader::HiveReader;
pub use tree::HiveKey;
pub use writer::HiveWriter;

use crate::error::{RegistryError, Result};
use crate::offline::{EnumeratedValue, HiveApi, OfflineHiveHandle};
use crate::path::{KeyInfo, KeyPath};
use crate::utils::filetime_to_datetime;
use crate::value::ValueEntry;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, instrument};

/// Name given to the root key of a hive created from scratch.
pub const CREATED_ROOT_NAME: &str = "ROOT";

struct OpenHive {
    path: Option<PathBuf>,
    root: HiveKey,
}

/// [`HiveApi`] backed by this crate's reader and writer.
pub struct RegfHiveApi {
    hives: Mutex<HashMap<OfflineHiveHandle, OpenHive>>,
    next_id: AtomicU64,
}

impl Default for RegfHiveApi {
    fn default() -> Self {
        Self::new()
    }
}

impl RegfHiveApi {
    /// Creates an API with no open hives.
    pub fn new() -> Self {
        Self {
            hives: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn hives(&self) -> MutexGuard<'_, HashMap<OfflineHiveHandle, OpenHive>> {
        self.hives.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, hive: OpenHive) -> OfflineHiveHandle {
        let handle = OfflineHiveHandle::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.hives().insert(handle, hive);
        handle
    }

    fn with_key<T>(&self, hive: OfflineHiveHandle, key: &KeyPath, f: impl FnOnce(&HiveKey) -> Result<T>) -> Result<T> {
        let hives = self.hives();
        let open = hives.get(&hive).ok_or(RegistryError::InvalidHandle(hive.id()))?;
        let node = open
            .root
            .descend(key)
            .ok_or_else(|| RegistryError::not_found("key", &key.to_string()))?;
        f(node)
    }

    fn with_key_mut<T>(
        &self,
        hive: OfflineHiveHandle,
        key: &KeyPath,
        f: impl FnOnce(&mut HiveKey) -> Result<T>,
    ) -> Result<T> {
        let mut hives = self.hives();
        let open = hives.get_mut(&hive).ok_or(RegistryError::InvalidHandle(hive.id()))?;
        let node = open
            .root
            .descend_mut(key)
            .ok_or_else(|| RegistryError::not_found("key", &key.to_string()))?;
        f(node)
    }
}

impl HiveApi for RegfHiveApi {
    fn name(&self) -> &str {
        "regf"
    }

    #[instrument(skip(self, path), fields(path = %path.display()))]
    fn open_hive(&self, path: &Path) -> Result<OfflineHiveHandle> {
        if self.hives().values().any(|h| h.path.as_deref() == Some(path)) {
            return Err(RegistryError::HiveInUse(path.display().to_string()));
        }

        let reader = HiveReader::open(path)?;
        let root = reader.load_tree()?;
        info!(version = %reader.base_block(), "Loaded hive");
        Ok(self.insert(OpenHive {
            path: Some(path.to_path_buf()),
            root,
        }))
    }

    fn create_hive(&self) -> Result<OfflineHiveHandle> {
        Ok(self.insert(OpenHive {
            path: None,
            root: HiveKey::new(CREATED_ROOT_NAME),
        }))
    }

    fn close_hive(&self, hive: OfflineHiveHandle) -> Result<()> {
        self.hives()
            .remove(&hive)
            .map(|_| ())
            .ok_or(RegistryError::InvalidHandle(hive.id()))
    }

    #[instrument(skip(self, path), fields(path = %path.display()))]
    fn save_hive(&self, hive: OfflineHiveHandle, path: &Path) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let image = self.with_key(hive, &KeyPath::new(), |root| HiveWriter::serialize(root, &file_name))?;

        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(&image)?;
        file.sync_all()?;
        info!(bytes = image.len(), "Wrote hive");
        Ok(())
    }

    fn query_info(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<KeyInfo> {
        self.with_key(hive, key, |node| {
            Ok(KeyInfo {
                subkey_count: node.subkeys.len() as u32,
                value_count: node.values.len() as u32,
                last_write: filetime_to_datetime(node.last_written),
                max_value_data_len: node.max_value_data_len() as u32,
            })
        })
    }

    fn enum_key(&self, hive: OfflineHiveHandle, key: &KeyPath, index: usize) -> Result<Option<String>> {
        self.with_key(hive, key, |node| Ok(node.subkeys.get(index).map(|k| k.name.clone())))
    }

    fn enum_value(
        &self,
        hive: OfflineHiveHandle,
        key: &KeyPath,
        index: usize,
        data: Option<&mut [u8]>,
    ) -> Result<Option<EnumeratedValue>> {
        self.with_key(hive, key, |node| {
            let value = match node.values.get(index) {
                Some(value) => value,
                None => return Ok(None),
            };
            if let Some(buffer) = data {
                if buffer.len() < value.data.len() {
                    return Err(RegistryError::MoreData {
                        required: value.data.len(),
                    });
                }
                buffer[..value.data.len()].copy_from_slice(&value.data);
            }
            Ok(Some(EnumeratedValue {
                name: value.name.clone(),
                value_type: value.value_type,
                data_len: value.data.len(),
            }))
        })
    }

    fn get_value(&self, hive: OfflineHiveHandle, key: &KeyPath, name: &str) -> Result<ValueEntry> {
        self.with_key(hive, key, |node| {
            node.value(name)
                .cloned()
                .ok_or_else(|| RegistryError::not_found("value", name))
        })
    }

    fn set_value(&self, hive: OfflineHiveHandle, key: &KeyPath, value: &ValueEntry) -> Result<()> {
        self.with_key_mut(hive, key, |node| {
            node.set_value(value.clone());
            Ok(())
        })
    }

    fn delete_value(&self, hive: OfflineHiveHandle, key: &KeyPath, name: &str) -> Result<()> {
        self.with_key_mut(hive, key, |node| {
            node.remove_value(name)
                .map(|_| ())
                .ok_or_else(|| RegistryError::not_found("value", name))
        })
    }

    fn create_key(&self, hive: OfflineHiveHandle, parent: &KeyPath, name: &str, link: bool) -> Result<bool> {
        if name.is_empty() || name.contains('\\') {
            return Err(RegistryError::InvalidPath(format!("invalid key name '{}'", name)));
        }
        self.with_key_mut(hive, parent, |node| {
            let mut key = HiveKey::new(name);
            key.is_link = link;
            Ok(node.insert_subkey(key))
        })
    }

    fn delete_key(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<()> {
        let (parent, name) = match (key.parent(), key.name()) {
            (Some(parent), Some(name)) => (parent, name),
            _ => return Err(RegistryError::InvalidPath("cannot delete a hive root".to_string())),
        };
        self.with_key_mut(hive, &parent, |node| {
            let child = node
                .subkey(name)
                .ok_or_else(|| RegistryError::not_found("key", &key.to_string()))?;
            if !child.subkeys.is_empty() {
                return Err(RegistryError::HasSubkeys(key.to_string()));
            }
            node.remove_subkey(name);
            Ok(())
        })
    }

    fn is_link(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<bool> {
        self.with_key(hive, key, |node| Ok(node.is_link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::subkey_list::MAX_LEAF_ENTRIES;
    use crate::value::ValueType;

    fn sample_tree(api: &RegfHiveApi) -> OfflineHiveHandle {
        let hive = api.create_hive().unwrap();
        let root = KeyPath::new();
        api.create_key(hive, &root, "Software", false).unwrap();
        api.create_key(hive, &KeyPath::parse("Software"), "Vendor", false).unwrap();
        api.create_key(hive, &root, "Link", true).unwrap();

        let vendor = KeyPath::parse("Software\\Vendor");
        api.set_value(hive, &vendor, &ValueEntry::string("", "default")).unwrap();
        api.set_value(hive, &vendor, &ValueEntry::dword("Inline", 0xDEADBEEF)).unwrap();
        api.set_value(hive, &vendor, &ValueEntry::binary("Empty", &[])).unwrap();
        api.set_value(hive, &vendor, &ValueEntry::string("Caf\u{e9}\u{4e2d}", "\u{4e2d}\u{6587}")).unwrap();
        api.set_value(hive, &vendor, &ValueEntry::binary("Big", &vec![0x5A; 40_000])).unwrap();
        api.set_value(hive, &KeyPath::parse("Link"), &ValueEntry::link("\\REGISTRY\\MACHINE\\SYSTEM"))
            .unwrap();
        hive
    }

    fn tree_of(api: &RegfHiveApi, hive: OfflineHiveHandle) -> HiveKey {
        api.with_key(hive, &KeyPath::new(), |root| Ok(root.clone())).unwrap()
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.hiv");

        let api = RegfHiveApi::new();
        let hive = sample_tree(&api);
        api.save_hive(hive, &path).unwrap();

        let reopened = api.open_hive(&path).unwrap();
        assert_eq!(tree_of(&api, reopened), tree_of(&api, hive));
        assert!(api.is_link(reopened, &KeyPath::parse("LINK")).unwrap());

        let big = api.get_value(reopened, &KeyPath::parse("Software\\Vendor"), "big").unwrap();
        assert_eq!(big.data.len(), 40_000);
        assert_eq!(big.value_type, ValueType::Binary);
    }

    #[test]
    fn test_save_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exists.hiv");
        std::fs::write(&path, b"x").unwrap();

        let api = RegfHiveApi::new();
        let hive = api.create_hive().unwrap();
        assert!(api.save_hive(hive, &path).is_err());
    }

    #[test]
    fn test_reopen_same_path_is_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.hiv");
        let api = RegfHiveApi::new();
        let hive = api.create_hive().unwrap();
        api.save_hive(hive, &path).unwrap();

        let first = api.open_hive(&path).unwrap();
        assert!(matches!(api.open_hive(&path), Err(RegistryError::HiveInUse(_))));
        api.close_hive(first).unwrap();
        assert!(api.open_hive(&path).is_ok());
    }

    #[test]
    fn test_many_subkeys_use_index_root() {
        let api = RegfHiveApi::new();
        let hive = api.create_hive().unwrap();
        let count = MAX_LEAF_ENTRIES + 100;
        for i in 0..count {
            api.create_key(hive, &KeyPath::new(), &format!("Key{:05}", i), false).unwrap();
        }

        let root = tree_of(&api, hive);
        let image = HiveWriter::serialize(&root, "many").unwrap();
        let loaded = HiveReader::from_vec(image).unwrap().load_tree().unwrap();
        assert_eq!(loaded.subkeys.len(), count);
        assert_eq!(loaded, root);
    }

    #[test]
    fn test_delete_key_requires_empty() {
        let api = RegfHiveApi::new();
        let hive = sample_tree(&api);
        assert!(matches!(
            api.delete_key(hive, &KeyPath::parse("Software")),
            Err(RegistryError::HasSubkeys(_))
        ));
        api.delete_key(hive, &KeyPath::parse("Software\\Vendor")).unwrap();
        api.delete_key(hive, &KeyPath::parse("Software")).unwrap();
        assert!(api.query_info(hive, &KeyPath::parse("Software")).is_err());
    }

    #[test]
    fn test_enum_value_reports_more_data() {
        let api = RegfHiveApi::new();
        let hive = sample_tree(&api);
        let vendor = KeyPath::parse("Software\\Vendor");
        let mut small = [0u8; 2];
        assert!(matches!(
            api.enum_value(hive, &vendor, 1, Some(&mut small)),
            Err(RegistryError::MoreData { required: 4 })
        ));
        let listed = api.enum_value(hive, &vendor, 1, None).unwrap().unwrap();
        assert_eq!(listed.name, "Inline");
        assert!(api.enum_value(hive, &vendor, 99, None).unwrap().is_none());
    }

    #[test]
    fn test_invalid_handle() {
        let api = RegfHiveApi::new();
        let bogus = OfflineHiveHandle::from_raw(42);
        assert!(matches!(
            api.query_info(bogus, &KeyPath::new()),
            Err(RegistryError::InvalidHandle(42))
        ));
    }
}
