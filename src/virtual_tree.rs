//! In-memory registry trees parsed from export files.
//!
//! A [`VirtualRegistryData`] owns an unnamed container key whose children are
//! the top-level keys named in the file (usually `HKEY_LOCAL_MACHINE` and
//! friends). Names are matched case-insensitively; both maps are keyed by the
//! folded name so iteration comes out in case-insensitive order with the
//! default value first.

use crate::dispatch::StreamOptions;
use crate::error::{RegistryError, Result};
use crate::path::{KeyInfo, KeyPath};
use crate::regfile;
use crate::utils::fold_case;
use crate::value::ValueEntry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, instrument};

/// One key of a virtual tree. Children are owned outright.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualRegistryKey {
    name: String,
    values: BTreeMap<String, ValueEntry>,
    children: BTreeMap<String, VirtualRegistryKey>,
}

impl VirtualRegistryKey {
    /// Creates an empty key.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Key name as first written.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Values, default first, then by name.
    pub fn values(&self) -> impl Iterator<Item = &ValueEntry> {
        self.values.values()
    }

    /// Children in case-insensitive name order.
    pub fn children(&self) -> impl Iterator<Item = &VirtualRegistryKey> {
        self.children.values()
    }

    /// Number of values.
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Number of direct children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Finds a value.
    pub fn value(&self, name: &str) -> Option<&ValueEntry> {
        self.values.get(&fold_case(name))
    }

    /// Creates or replaces a value. A replaced value keeps its original name.
    pub fn set_value(&mut self, value: ValueEntry) {
        match self.values.get_mut(&fold_case(&value.name)) {
            Some(existing) => {
                existing.value_type = value.value_type;
                existing.data = value.data;
            }
            None => {
                self.values.insert(fold_case(&value.name), value);
            }
        }
    }

    /// Removes a value.
    pub fn remove_value(&mut self, name: &str) -> Option<ValueEntry> {
        self.values.remove(&fold_case(name))
    }

    /// Finds a direct child.
    pub fn child(&self, name: &str) -> Option<&VirtualRegistryKey> {
        self.children.get(&fold_case(name))
    }

    /// Finds a direct child, mutably.
    pub fn child_mut(&mut self, name: &str) -> Option<&mut VirtualRegistryKey> {
        self.children.get_mut(&fold_case(name))
    }

    /// Returns the named child, creating it if missing.
    pub fn child_or_insert(&mut self, name: &str) -> &mut VirtualRegistryKey {
        self.children
            .entry(fold_case(name))
            .or_insert_with(|| VirtualRegistryKey::new(name))
    }

    /// Adds a child. Returns false if the name is taken.
    pub fn insert_child(&mut self, child: VirtualRegistryKey) -> bool {
        let folded = fold_case(&child.name);
        if self.children.contains_key(&folded) {
            return false;
        }
        self.children.insert(folded, child);
        true
    }

    /// Detaches a child with its subtree.
    pub fn remove_child(&mut self, name: &str) -> Option<VirtualRegistryKey> {
        self.children.remove(&fold_case(name))
    }

    /// Walks down a path.
    pub fn descend(&self, path: &KeyPath) -> Option<&VirtualRegistryKey> {
        path.segments().iter().try_fold(self, |key, segment| key.child(segment))
    }

    /// Walks down a path, mutably.
    pub fn descend_mut(&mut self, path: &KeyPath) -> Option<&mut VirtualRegistryKey> {
        let mut key = self;
        for segment in path.segments() {
            key = key.child_mut(segment)?;
        }
        Some(key)
    }

    /// Walks down a path, creating missing keys.
    pub fn create_path(&mut self, path: &KeyPath) -> &mut VirtualRegistryKey {
        let mut key = self;
        for segment in path.segments() {
            key = key.child_or_insert(segment);
        }
        key
    }

    fn renamed(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

/// A parsed export file mounted as a registry root.
#[derive(Debug)]
pub struct VirtualRegistryData {
    root_name: String,
    root: RwLock<VirtualRegistryKey>,
    source: Option<PathBuf>,
}

impl VirtualRegistryData {
    /// Wraps a tree under a display name.
    pub fn new(root_name: impl Into<String>, root: VirtualRegistryKey) -> Self {
        Self {
            root_name: root_name.into(),
            root: RwLock::new(root),
            source: None,
        }
    }

    /// Parses an export file; the root takes the file's name.
    ///
    /// Malformed lines are skipped and logged.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let parsed = regfile::parse_file(path)?;
        let root_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        debug!(diagnostics = parsed.diagnostics.len(), "Loaded export file");
        Ok(Self {
            root_name,
            root: RwLock::new(parsed.root),
            source: Some(path.to_path_buf()),
        })
    }

    /// Display name of the root.
    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    /// File the tree was parsed from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Read access to the tree.
    pub fn read(&self) -> RwLockReadGuard<'_, VirtualRegistryKey> {
        self.root.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access to the tree.
    pub fn write(&self) -> RwLockWriteGuard<'_, VirtualRegistryKey> {
        self.root.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_key<T>(&self, path: &KeyPath, f: impl FnOnce(&VirtualRegistryKey) -> Result<T>) -> Result<T> {
        let root = self.read();
        let key = root
            .descend(path)
            .ok_or_else(|| RegistryError::not_found("key", &path.to_string()))?;
        f(key)
    }

    fn with_key_mut<T>(&self, path: &KeyPath, f: impl FnOnce(&mut VirtualRegistryKey) -> Result<T>) -> Result<T> {
        let mut root = self.write();
        let key = root
            .descend_mut(path)
            .ok_or_else(|| RegistryError::not_found("key", &path.to_string()))?;
        f(key)
    }

    /// Direct subkey names in case-insensitive order.
    pub fn subkey_names(&self, path: &KeyPath) -> Result<Vec<String>> {
        self.with_key(path, |key| Ok(key.children().map(|c| c.name.clone()).collect()))
    }

    /// Values with the default first, then by name.
    pub fn values(&self, path: &KeyPath) -> Result<Vec<ValueEntry>> {
        self.with_key(path, |key| Ok(key.values().cloned().collect()))
    }

    /// Streams values and then subkey names from a snapshot.
    ///
    /// The lock is released before any callback runs, so callbacks may
    /// mutate this tree.
    pub fn stream(
        &self,
        path: &KeyPath,
        options: StreamOptions,
        on_value: &mut dyn FnMut(ValueEntry) -> bool,
        on_subkey: &mut dyn FnMut(&str) -> bool,
    ) -> Result<bool> {
        let (values, subkeys) = self.with_key(path, |key| {
            let values: Vec<ValueEntry> = if options.values {
                key.values()
                    .map(|v| if options.data { v.clone() } else { v.without_data() })
                    .collect()
            } else {
                Vec::new()
            };
            let subkeys: Vec<String> = if options.subkeys {
                key.children().map(|c| c.name.clone()).collect()
            } else {
                Vec::new()
            };
            Ok((values, subkeys))
        })?;

        for value in values {
            if !on_value(value) {
                return Ok(false);
            }
        }
        for name in &subkeys {
            if !on_subkey(name) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reads one value.
    pub fn value(&self, path: &KeyPath, name: &str) -> Result<ValueEntry> {
        self.with_key(path, |key| {
            key.value(name)
                .cloned()
                .ok_or_else(|| RegistryError::not_found("value", name))
        })
    }

    /// Counts for a key; virtual keys carry no timestamp.
    pub fn info(&self, path: &KeyPath) -> Result<KeyInfo> {
        self.with_key(path, |key| {
            Ok(KeyInfo {
                subkey_count: key.child_count() as u32,
                value_count: key.value_count() as u32,
                last_write: None,
                max_value_data_len: key.values().map(|v| v.data.len()).max().unwrap_or(0) as u32,
            })
        })
    }

    /// True if the key exists.
    pub fn exists(&self, path: &KeyPath) -> bool {
        self.read().descend(path).is_some()
    }

    /// Creates a key and any missing ancestors.
    pub fn create_key(&self, path: &KeyPath) -> Result<()> {
        self.write().create_path(path);
        Ok(())
    }

    /// Deletes a key with its subtree.
    pub fn delete_key(&self, path: &KeyPath) -> Result<()> {
        let (parent, name) = split_last(path)?;
        self.with_key_mut(&parent, |key| {
            key.remove_child(name)
                .map(|_| ())
                .ok_or_else(|| RegistryError::not_found("key", &path.to_string()))
        })
    }

    /// Renames a key in place, keeping its subtree.
    pub fn rename_key(&self, path: &KeyPath, new_name: &str) -> Result<()> {
        if new_name.is_empty() || new_name.contains('\\') {
            return Err(RegistryError::InvalidPath(format!("invalid key name '{}'", new_name)));
        }
        let (parent, name) = split_last(path)?;
        self.with_key_mut(&parent, |key| {
            if fold_case(name) != fold_case(new_name) && key.child(new_name).is_some() {
                return Err(RegistryError::AlreadyExists(path.with_name(new_name).to_string()));
            }
            let child = key
                .remove_child(name)
                .ok_or_else(|| RegistryError::not_found("key", &path.to_string()))?;
            key.insert_child(child.renamed(new_name));
            Ok(())
        })
    }

    /// Creates or replaces a value.
    pub fn set_value(&self, path: &KeyPath, value: &ValueEntry) -> Result<()> {
        self.with_key_mut(path, |key| {
            key.set_value(value.clone());
            Ok(())
        })
    }

    /// Deletes a value.
    pub fn delete_value(&self, path: &KeyPath, name: &str) -> Result<()> {
        self.with_key_mut(path, |key| {
            key.remove_value(name)
                .map(|_| ())
                .ok_or_else(|| RegistryError::not_found("value", name))
        })
    }

    /// Renames a value, keeping its type and data.
    pub fn rename_value(&self, path: &KeyPath, old: &str, new: &str) -> Result<()> {
        self.with_key_mut(path, |key| {
            if fold_case(old) != fold_case(new) && key.value(new).is_some() {
                return Err(RegistryError::AlreadyExists(format!("value '{}'", new)));
            }
            let mut value = key
                .remove_value(old)
                .ok_or_else(|| RegistryError::not_found("value", old))?;
            value.name = new.to_string();
            key.set_value(value);
            Ok(())
        })
    }
}

fn split_last(path: &KeyPath) -> Result<(KeyPath, &str)> {
    match (path.parent(), path.name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(RegistryError::InvalidPath("cannot modify the virtual root".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;

    fn data() -> VirtualRegistryData {
        let mut root = VirtualRegistryKey::new("");
        let key = root.create_path(&KeyPath::parse("HKEY_CURRENT_USER\\Software\\App"));
        key.set_value(ValueEntry::string("Zeta", "z"));
        key.set_value(ValueEntry::dword("alpha", 1));
        key.set_value(ValueEntry::string("", "default"));
        VirtualRegistryData::new("app.reg", root)
    }

    #[test]
    fn test_value_order_default_first() {
        let data = data();
        let names: Vec<String> = data
            .values(&KeyPath::parse("hkey_current_user\\software\\app"))
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["", "alpha", "Zeta"]);
    }

    #[test]
    fn test_case_insensitive_set_keeps_name() {
        let data = data();
        let app = KeyPath::parse("HKEY_CURRENT_USER\\Software\\App");
        data.set_value(&app, &ValueEntry::dword("ALPHA", 7)).unwrap();
        let value = data.value(&app, "Alpha").unwrap();
        assert_eq!(value.name, "alpha");
        assert_eq!(value.data, 7u32.to_le_bytes().to_vec());
        assert_eq!(value.value_type, ValueType::Dword);
    }

    #[test]
    fn test_delete_and_rename() {
        let data = data();
        let software = KeyPath::parse("HKEY_CURRENT_USER\\Software");
        data.create_key(&software.join("Other")).unwrap();

        assert!(matches!(
            data.rename_key(&software.join("App"), "other"),
            Err(RegistryError::AlreadyExists(_))
        ));
        data.rename_key(&software.join("App"), "APP").unwrap();
        assert_eq!(data.subkey_names(&software).unwrap(), vec!["APP", "Other"]);

        data.delete_key(&software).unwrap();
        assert!(!data.exists(&software.join("APP")));
        assert!(data.delete_key(&KeyPath::new()).is_err());
    }

    #[test]
    fn test_stream_without_data() {
        let data = data();
        let mut values = Vec::new();
        let options = StreamOptions {
            values: true,
            data: false,
            subkeys: false,
        };
        let finished = data
            .stream(
                &KeyPath::parse("HKEY_CURRENT_USER\\Software\\App"),
                options,
                &mut |v| {
                    values.push(v);
                    true
                },
                &mut |_| true,
            )
            .unwrap();
        assert!(finished);
        assert_eq!(values.len(), 3);
        assert!(values.iter().all(|v| v.data.is_empty()));
    }

    #[test]
    fn test_rename_value() {
        let data = data();
        let app = KeyPath::parse("HKEY_CURRENT_USER\\Software\\App");
        assert!(data.rename_value(&app, "alpha", "ZETA").is_err());
        data.rename_value(&app, "alpha", "Beta").unwrap();
        assert!(data.value(&app, "alpha").is_err());
        assert_eq!(data.value(&app, "beta").unwrap().name, "Beta");
    }
}
