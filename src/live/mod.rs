//! Live OS registry backend.
//!
//! On Windows every call goes straight to the registry API. Elsewhere the
//! backend exists but reports [`RegistryError::BackendUnavailable`], so code
//! built on the dispatcher runs unchanged against virtual and offline roots.

use crate::config::DriveMapping;
use crate::dispatch::StreamOptions;
use crate::error::{RegistryError, Result};
use crate::path::{KeyInfo, KeyPath, PredefinedKey};
use crate::utils::names_equal;
use crate::value::ValueEntry;
use tracing::debug;

#[cfg(windows)]
#[path = "windows.rs"]
mod sys;

#[cfg(not(windows))]
#[path = "unsupported.rs"]
mod sys;

/// Stateless handle on the live registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveBackend;

impl LiveBackend {
    /// Creates the backend.
    pub fn new() -> Self {
        Self
    }

    /// True when this build can reach the OS registry.
    pub fn is_available(&self) -> bool {
        cfg!(windows)
    }

    /// Direct subkey names in registry order.
    pub fn subkey_names(&self, root: PredefinedKey, path: &KeyPath) -> Result<Vec<String>> {
        sys::subkey_names(root, path)
    }

    /// Streams values and then subkey names; returns false if a callback stopped it.
    pub fn stream(
        &self,
        root: PredefinedKey,
        path: &KeyPath,
        options: StreamOptions,
        on_value: &mut dyn FnMut(ValueEntry) -> bool,
        on_subkey: &mut dyn FnMut(&str) -> bool,
    ) -> Result<bool> {
        sys::stream(root, path, options, on_value, on_subkey)
    }

    /// All values of a key.
    pub fn values(&self, root: PredefinedKey, path: &KeyPath) -> Result<Vec<ValueEntry>> {
        let mut values = Vec::new();
        self.stream(
            root,
            path,
            StreamOptions::values_only(),
            &mut |value| {
                values.push(value);
                true
            },
            &mut |_| true,
        )?;
        Ok(values)
    }

    /// One value.
    pub fn value(&self, root: PredefinedKey, path: &KeyPath, name: &str) -> Result<ValueEntry> {
        sys::value(root, path, name)
    }

    /// Counts and last write time.
    pub fn info(&self, root: PredefinedKey, path: &KeyPath) -> Result<KeyInfo> {
        sys::info(root, path)
    }

    /// Creates the key and any missing ancestors.
    pub fn create_key(&self, root: PredefinedKey, path: &KeyPath) -> Result<()> {
        sys::create_key(root, path)
    }

    /// Creates a link key whose `SymbolicLinkValue` holds `target`.
    pub fn create_link(&self, root: PredefinedKey, path: &KeyPath, target: &str) -> Result<()> {
        sys::create_link(root, path, target)
    }

    /// Deletes a key and its whole subtree.
    pub fn delete_key(&self, root: PredefinedKey, path: &KeyPath) -> Result<()> {
        sys::delete_key(root, path)
    }

    /// Renames the last segment of `path`.
    pub fn rename_key(&self, root: PredefinedKey, path: &KeyPath, new_name: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            let current = path.name().unwrap_or_default();
            if !names_equal(current, new_name) && sys::info(root, &parent.join(new_name)).is_ok() {
                return Err(RegistryError::AlreadyExists(new_name.to_string()));
            }
        }
        sys::rename_key(root, path, new_name)
    }

    /// Creates or replaces a value.
    pub fn set_value(&self, root: PredefinedKey, path: &KeyPath, value: &ValueEntry) -> Result<()> {
        sys::set_value(root, path, value)
    }

    /// Deletes a value.
    pub fn delete_value(&self, root: PredefinedKey, path: &KeyPath, name: &str) -> Result<()> {
        sys::delete_value(root, path, name)
    }

    /// Renames a value by rewriting it under the new name.
    pub fn rename_value(&self, root: PredefinedKey, path: &KeyPath, old: &str, new: &str) -> Result<()> {
        let value = sys::value(root, path, old)?;
        if names_equal(old, new) {
            if old == new {
                return Ok(());
            }
        } else if sys::value(root, path, new).is_ok() {
            return Err(RegistryError::AlreadyExists(new.to_string()));
        }

        sys::delete_value(root, path, old)?;
        let mut renamed = value;
        renamed.name = new.to_string();
        sys::set_value(root, path, &renamed)
    }

    /// NT target of a link key, `None` for an ordinary key.
    pub fn link_target(&self, root: PredefinedKey, path: &KeyPath) -> Result<Option<String>> {
        sys::link_target(root, path)
    }

    /// SID string of the user running this process.
    pub fn current_user_sid(&self) -> Option<String> {
        let sid = sys::current_user_sid();
        debug!(?sid, "Queried current user SID");
        sid
    }

    /// Drive letters with their NT device paths.
    pub fn logical_drives(&self) -> Vec<DriveMapping> {
        sys::logical_drives()
    }
}


#[cfg(all(test, windows))]
mod windows_tests {
    use super::*;

    #[test]
    fn test_delete_key_removes_subtree() {
        let live = LiveBackend::new();
        let base = KeyPath::parse(&format!("Software\\unireg-test-{}", std::process::id()));
        let leaf = base.join("Child").join("Leaf");
        live.create_key(PredefinedKey::CurrentUser, &leaf).unwrap();
        live.set_value(PredefinedKey::CurrentUser, &leaf, &ValueEntry::dword("V", 1))
            .unwrap();

        live.delete_key(PredefinedKey::CurrentUser, &base).unwrap();
        assert!(matches!(
            live.info(PredefinedKey::CurrentUser, &base),
            Err(RegistryError::NotFound(_))
        ));
        assert!(live.delete_key(PredefinedKey::CurrentUser, &base).is_err());
    }
}
