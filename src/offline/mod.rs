//! Offline hive backend.
//!
//! Hive files are manipulated through the [`HiveApi`] trait. The crate ships a
//! pure-Rust implementation ([`crate::hive::RegfHiveApi`]); a context built
//! without one reports [`RegistryError::BackendUnavailable`] for every call.
//!
//! The trait mirrors the shape of an OS offline-registry library: one level
//! per call, index-based enumeration, caller-sized data buffers, and no
//! recursive delete. Everything recursive lives in [`OfflineBackend`].

use crate::dispatch::StreamOptions;
use crate::error::{RegistryError, Result};
use crate::path::{KeyInfo, KeyPath};
use crate::utils::{names_equal, utf16_lossy};
use crate::value::{ValueEntry, ValueType, SYMBOLIC_LINK_VALUE};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

/// First buffer size tried when streaming value data.
const INITIAL_DATA_BUFFER: usize = 256;

/// Opaque handle of an open offline hive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OfflineHiveHandle(u64);

impl OfflineHiveHandle {
    /// Wraps a raw handle value issued by a [`HiveApi`].
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Raw handle value.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OfflineHiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hive#{}", self.0)
    }
}

/// Name and size of a value returned by [`HiveApi::enum_value`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedValue {
    /// Value name.
    pub name: String,
    /// Value type.
    pub value_type: ValueType,
    /// Payload length in bytes.
    pub data_len: usize,
}

/// Hive manipulation capability.
///
/// Key arguments are paths relative to the hive root.
pub trait HiveApi: Send + Sync {
    /// Implementation name, for diagnostics.
    fn name(&self) -> &str;

    /// Opens a hive file.
    fn open_hive(&self, path: &Path) -> Result<OfflineHiveHandle>;

    /// Creates an empty hive that exists only in memory until saved.
    fn create_hive(&self) -> Result<OfflineHiveHandle>;

    /// Releases a hive. Unsaved changes are discarded.
    fn close_hive(&self, hive: OfflineHiveHandle) -> Result<()>;

    /// Writes a hive to a new file. Fails if `path` already exists.
    fn save_hive(&self, hive: OfflineHiveHandle, path: &Path) -> Result<()>;

    /// Counts and timestamps of one key.
    fn query_info(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<KeyInfo>;

    /// Name of the `index`th subkey, or `None` past the end.
    fn enum_key(&self, hive: OfflineHiveHandle, key: &KeyPath, index: usize) -> Result<Option<String>>;

    /// The `index`th value, or `None` past the end.
    ///
    /// With a buffer, the payload is copied into it; a buffer shorter than
    /// the payload yields [`RegistryError::MoreData`] with the size needed.
    fn enum_value(
        &self,
        hive: OfflineHiveHandle,
        key: &KeyPath,
        index: usize,
        data: Option<&mut [u8]>,
    ) -> Result<Option<EnumeratedValue>>;

    /// Reads one value.
    fn get_value(&self, hive: OfflineHiveHandle, key: &KeyPath, name: &str) -> Result<ValueEntry>;

    /// Creates or replaces one value.
    fn set_value(&self, hive: OfflineHiveHandle, key: &KeyPath, value: &ValueEntry) -> Result<()>;

    /// Removes one value.
    fn delete_value(&self, hive: OfflineHiveHandle, key: &KeyPath, name: &str) -> Result<()>;

    /// Creates `name` directly under `parent`.
    ///
    /// Returns false if it already existed.
    fn create_key(&self, hive: OfflineHiveHandle, parent: &KeyPath, name: &str, link: bool) -> Result<bool>;

    /// Removes a key that has no subkeys.
    fn delete_key(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<()>;

    /// Whether the key is flagged as a symbolic link.
    fn is_link(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<bool>;
}

/// Bookkeeping for one open hive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineRoot {
    /// File the hive was opened from or last saved to.
    pub path: Option<PathBuf>,
    /// Display name of the hive root.
    pub root_name: String,
    /// NT path the hive is treated as mounted under, e.g.
    /// `\REGISTRY\MACHINE\SOFTWARE`.
    pub mount_point: Option<String>,
}

/// Offline backend: the optional hive API plus the active offline roots.
pub struct OfflineBackend {
    api: Option<Arc<dyn HiveApi>>,
    roots: Mutex<HashMap<OfflineHiveHandle, OfflineRoot>>,
}

impl OfflineBackend {
    /// Creates the backend around an optional hive API.
    pub fn new(api: Option<Arc<dyn HiveApi>>) -> Self {
        Self {
            api,
            roots: Mutex::new(HashMap::new()),
        }
    }

    /// True when a hive API was resolved.
    pub fn is_available(&self) -> bool {
        self.api.is_some()
    }

    fn api(&self) -> Result<&dyn HiveApi> {
        self.api
            .as_deref()
            .ok_or_else(|| RegistryError::unavailable("offline hive API is not loaded"))
    }

    fn roots(&self) -> MutexGuard<'_, HashMap<OfflineHiveHandle, OfflineRoot>> {
        self.roots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if the handle is in the active set.
    pub fn is_active(&self, hive: OfflineHiveHandle) -> bool {
        self.roots().contains_key(&hive)
    }

    /// Bookkeeping for an active handle.
    pub fn root(&self, hive: OfflineHiveHandle) -> Option<OfflineRoot> {
        self.roots().get(&hive).cloned()
    }

    /// Every active handle, ordered by handle.
    pub fn active_roots(&self) -> Vec<(OfflineHiveHandle, OfflineRoot)> {
        let mut roots: Vec<_> = self.roots().iter().map(|(h, r)| (*h, r.clone())).collect();
        roots.sort_by_key(|(h, _)| *h);
        roots
    }

    fn holder_of(&self, path: &Path) -> Option<OfflineHiveHandle> {
        holder_in(&self.roots(), path)
    }

    /// Opens a hive file and adds it to the active set.
    ///
    /// # Errors
    ///
    /// `HiveInUse` if another active handle holds the same file.
    #[instrument(skip(self, path, mount_point), fields(path = %path.display()))]
    pub fn open(&self, path: &Path, root_name: &str, mount_point: Option<&str>) -> Result<OfflineHiveHandle> {
        let api = self.api()?;
        if let Some(holder) = self.holder_of(path) {
            return Err(RegistryError::HiveInUse(format!(
                "{} is held by {}",
                path.display(),
                holder
            )));
        }

        let hive = api.open_hive(path)?;
        let mut roots = self.roots();
        // Another thread may have opened the same file while this one parsed it.
        if let Some(holder) = holder_in(&roots, path) {
            drop(roots);
            if let Err(e) = api.close_hive(hive) {
                warn!(%hive, error = %e, "Failed to release duplicate hive handle");
            }
            return Err(RegistryError::HiveInUse(format!(
                "{} is held by {}",
                path.display(),
                holder
            )));
        }
        roots.insert(
            hive,
            OfflineRoot {
                path: Some(path.to_path_buf()),
                root_name: root_name.to_string(),
                mount_point: mount_point.map(str::to_string),
            },
        );
        drop(roots);
        info!(%hive, api = api.name(), "Opened offline hive");
        Ok(hive)
    }

    /// Creates an empty in-memory hive and adds it to the active set.
    pub fn create(&self, root_name: &str, mount_point: Option<&str>) -> Result<OfflineHiveHandle> {
        let hive = self.api()?.create_hive()?;
        self.roots().insert(
            hive,
            OfflineRoot {
                path: None,
                root_name: root_name.to_string(),
                mount_point: mount_point.map(str::to_string),
            },
        );
        debug!(%hive, "Created offline hive");
        Ok(hive)
    }

    /// Removes a handle from the active set and releases it.
    pub fn close(&self, hive: OfflineHiveHandle) -> Result<()> {
        let api = self.api()?;
        if self.roots().remove(&hive).is_none() {
            return Err(RegistryError::InvalidHandle(hive.id()));
        }
        api.close_hive(hive)?;
        info!(%hive, "Closed offline hive");
        Ok(())
    }

    /// Saves a hive to `path`, replacing any file not held by another handle.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn save(&self, hive: OfflineHiveHandle, path: &Path) -> Result<()> {
        let api = self.api()?;
        self.ensure_active(hive)?;
        if let Some(holder) = self.holder_of(path).filter(|h| *h != hive) {
            return Err(RegistryError::HiveInUse(format!(
                "{} is held by {}",
                path.display(),
                holder
            )));
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }
        api.save_hive(hive, path)?;

        if let Some(root) = self.roots().get_mut(&hive) {
            if root.path.is_none() {
                root.path = Some(path.to_path_buf());
            }
        }
        info!(%hive, "Saved offline hive");
        Ok(())
    }

    fn ensure_active(&self, hive: OfflineHiveHandle) -> Result<()> {
        if self.is_active(hive) {
            Ok(())
        } else {
            Err(RegistryError::InvalidHandle(hive.id()))
        }
    }

    /// Direct subkey names in hive order.
    pub fn subkey_names(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<Vec<String>> {
        let api = self.api()?;
        let mut names = Vec::new();
        while let Some(name) = api.enum_key(hive, key, names.len())? {
            names.push(name);
        }
        Ok(names)
    }

    /// Streams values and then subkey names; returns false if a callback stopped it.
    pub fn stream(
        &self,
        hive: OfflineHiveHandle,
        key: &KeyPath,
        options: StreamOptions,
        on_value: &mut dyn FnMut(ValueEntry) -> bool,
        on_subkey: &mut dyn FnMut(&str) -> bool,
    ) -> Result<bool> {
        let api = self.api()?;

        if options.values {
            let mut buffer = vec![0u8; INITIAL_DATA_BUFFER];
            let mut index = 0;
            loop {
                let data = if options.data { Some(buffer.as_mut_slice()) } else { None };
                let value = match api.enum_value(hive, key, index, data) {
                    Ok(Some(value)) => value,
                    Ok(None) => break,
                    Err(RegistryError::MoreData { required }) => {
                        debug!(index, required, "Growing value buffer");
                        buffer.resize(required, 0);
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let data = if options.data {
                    buffer[..value.data_len].to_vec()
                } else {
                    Vec::new()
                };
                if !on_value(ValueEntry::new(value.name, value.value_type, data)) {
                    return Ok(false);
                }
                index += 1;
            }
        }

        if options.subkeys {
            let mut index = 0;
            while let Some(name) = api.enum_key(hive, key, index)? {
                if !on_subkey(&name) {
                    return Ok(false);
                }
                index += 1;
            }
        }

        Ok(true)
    }

    /// All values of a key, with data.
    pub fn values(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<Vec<ValueEntry>> {
        let mut values = Vec::new();
        self.stream(
            hive,
            key,
            StreamOptions::values_only(),
            &mut |value| {
                values.push(value);
                true
            },
            &mut |_| true,
        )?;
        Ok(values)
    }

    /// Reads one value.
    pub fn value(&self, hive: OfflineHiveHandle, key: &KeyPath, name: &str) -> Result<ValueEntry> {
        self.api()?.get_value(hive, key, name)
    }

    /// Counts and timestamp of a key.
    pub fn info(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<KeyInfo> {
        self.api()?.query_info(hive, key)
    }

    /// Creates a key and any missing ancestors.
    pub fn create_key(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<()> {
        let api = self.api()?;
        for depth in 0..key.len() {
            api.create_key(hive, &key.prefix(depth), &key.segments()[depth], false)?;
        }
        Ok(())
    }

    /// Creates a link key pointing at an NT path.
    pub fn create_link(&self, hive: OfflineHiveHandle, key: &KeyPath, target: &str) -> Result<()> {
        let api = self.api()?;
        let (parent, name) = split_last(key)?;
        self.create_key(hive, &parent)?;
        if !api.create_key(hive, &parent, name, true)? {
            return Err(RegistryError::AlreadyExists(key.to_string()));
        }
        api.set_value(hive, key, &ValueEntry::link(target))
    }

    /// Deletes a key and its whole subtree.
    pub fn delete_key(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<()> {
        if key.is_empty() {
            return Err(RegistryError::InvalidPath("cannot delete a hive root".to_string()));
        }
        self.delete_tree(self.api()?, hive, key)
    }

    fn delete_tree(&self, api: &dyn HiveApi, hive: OfflineHiveHandle, key: &KeyPath) -> Result<()> {
        while let Some(child) = api.enum_key(hive, key, 0)? {
            self.delete_tree(api, hive, &key.join(&child))?;
        }
        api.delete_key(hive, key)
    }

    fn copy_tree(&self, api: &dyn HiveApi, hive: OfflineHiveHandle, from: &KeyPath, to: &KeyPath) -> Result<()> {
        let (parent, name) = split_last(to)?;
        api.create_key(hive, &parent, name, api.is_link(hive, from)?)?;
        for value in self.values(hive, from)? {
            api.set_value(hive, to, &value)?;
        }
        for child in self.subkey_names(hive, from)? {
            self.copy_tree(api, hive, &from.join(&child), &to.join(&child))?;
        }
        Ok(())
    }

    /// A sibling path of `key` that does not exist yet.
    fn unused_sibling(&self, api: &dyn HiveApi, hive: OfflineHiveHandle, key: &KeyPath, base: &str) -> Result<KeyPath> {
        for n in 0..u32::MAX {
            let candidate = key.with_name(&format!("{}~rename{}", base, n));
            match api.query_info(hive, &candidate) {
                Ok(_) => continue,
                Err(e) if e.is_not_found() => return Ok(candidate),
                Err(e) => return Err(e),
            }
        }
        Err(RegistryError::AlreadyExists(key.with_name(base).to_string()))
    }

    /// Renames a key by copying its subtree and deleting the original.
    pub fn rename_key(&self, hive: OfflineHiveHandle, key: &KeyPath, new_name: &str) -> Result<()> {
        let api = self.api()?;
        let old_name = key
            .name()
            .ok_or_else(|| RegistryError::InvalidPath("cannot rename a hive root".to_string()))?;
        if old_name == new_name {
            return Ok(());
        }

        let target = key.with_name(new_name);
        if names_equal(old_name, new_name) {
            // Case-only change: the copy would collide with the source.
            let staging = self.unused_sibling(api, hive, key, new_name)?;
            self.copy_tree(api, hive, key, &staging)?;
            self.delete_tree(api, hive, key)?;
            self.copy_tree(api, hive, &staging, &target)?;
            return self.delete_tree(api, hive, &staging);
        }

        if api.query_info(hive, &target).is_ok() {
            return Err(RegistryError::AlreadyExists(target.to_string()));
        }
        self.copy_tree(api, hive, key, &target)?;
        self.delete_tree(api, hive, key)
    }

    /// Creates or replaces a value.
    pub fn set_value(&self, hive: OfflineHiveHandle, key: &KeyPath, value: &ValueEntry) -> Result<()> {
        self.api()?.set_value(hive, key, value)
    }

    /// Deletes a value.
    pub fn delete_value(&self, hive: OfflineHiveHandle, key: &KeyPath, name: &str) -> Result<()> {
        self.api()?.delete_value(hive, key, name)
    }

    /// Renames a value, keeping its type and data.
    pub fn rename_value(&self, hive: OfflineHiveHandle, key: &KeyPath, old: &str, new: &str) -> Result<()> {
        let api = self.api()?;
        let mut value = api.get_value(hive, key, old)?;
        if !names_equal(old, new) && api.get_value(hive, key, new).is_ok() {
            return Err(RegistryError::AlreadyExists(format!("value '{}'", new)));
        }
        api.delete_value(hive, key, old)?;
        value.name = new.to_string();
        api.set_value(hive, key, &value)
    }

    /// Link target of a key, or `None` for ordinary keys.
    pub fn link_target(&self, hive: OfflineHiveHandle, key: &KeyPath) -> Result<Option<String>> {
        let api = self.api()?;
        if !api.is_link(hive, key)? {
            return Ok(None);
        }
        let value = api.get_value(hive, key, SYMBOLIC_LINK_VALUE)?;
        Ok(Some(utf16_lossy(&value.data).trim_end_matches('\0').to_string()))
    }
}

fn holder_in(roots: &HashMap<OfflineHiveHandle, OfflineRoot>, path: &Path) -> Option<OfflineHiveHandle> {
    let wanted = comparable_path(path);
    roots
        .iter()
        .find(|(_, root)| root.path.as_deref().map(comparable_path).as_ref() == Some(&wanted))
        .map(|(h, _)| *h)
}

fn split_last(key: &KeyPath) -> Result<(KeyPath, &str)> {
    match (key.parent(), key.name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(RegistryError::InvalidPath("empty key path".to_string())),
    }
}

/// Path form used to detect two handles on one file.
fn comparable_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
