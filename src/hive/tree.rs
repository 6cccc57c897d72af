//! Editable in-memory image of a hive's key tree.

use crate::path::KeyPath;
use crate::utils::{filetime_now, names_equal};
use crate::value::ValueEntry;
use std::cmp::Ordering;

/// One key of a loaded hive.
///
/// Subkeys are kept in the hive's native order (uppercase name order);
/// values keep their stored order, with new values appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiveKey {
    /// Key name.
    pub name: String,
    /// Whether the key is a symbolic link.
    pub is_link: bool,
    /// Last written timestamp (FILETIME).
    pub last_written: u64,
    /// Values in stored order.
    pub values: Vec<ValueEntry>,
    /// Subkeys in native order.
    pub subkeys: Vec<HiveKey>,
}

/// Native subkey ordering: uppercase comparison.
pub fn native_order(a: &str, b: &str) -> Ordering {
    a.to_uppercase().cmp(&b.to_uppercase())
}

impl HiveKey {
    /// Creates an empty key stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_link: false,
            last_written: filetime_now(),
            values: Vec::new(),
            subkeys: Vec::new(),
        }
    }

    /// Finds a direct subkey by name.
    pub fn subkey(&self, name: &str) -> Option<&HiveKey> {
        self.subkeys.iter().find(|k| names_equal(&k.name, name))
    }

    /// Walks down a path.
    pub fn descend(&self, path: &KeyPath) -> Option<&HiveKey> {
        path.segments()
            .iter()
            .try_fold(self, |key, segment| key.subkey(segment))
    }

    /// Walks down a path, mutably.
    pub fn descend_mut(&mut self, path: &KeyPath) -> Option<&mut HiveKey> {
        let mut key = self;
        for segment in path.segments() {
            key = key.subkeys.iter_mut().find(|k| names_equal(&k.name, segment))?;
        }
        Some(key)
    }

    /// Inserts a subkey at its sorted position. Returns false if the name is taken.
    pub fn insert_subkey(&mut self, key: HiveKey) -> bool {
        if self.subkey(&key.name).is_some() {
            return false;
        }
        let pos = self
            .subkeys
            .iter()
            .position(|k| native_order(&k.name, &key.name) == Ordering::Greater)
            .unwrap_or(self.subkeys.len());
        self.subkeys.insert(pos, key);
        self.touch();
        true
    }

    /// Removes a direct subkey by name.
    pub fn remove_subkey(&mut self, name: &str) -> Option<HiveKey> {
        let pos = self.subkeys.iter().position(|k| names_equal(&k.name, name))?;
        self.touch();
        Some(self.subkeys.remove(pos))
    }

    /// Finds a value by name.
    pub fn value(&self, name: &str) -> Option<&ValueEntry> {
        self.values.iter().find(|v| v.has_name(name))
    }

    /// Replaces a value in place, or appends it.
    pub fn set_value(&mut self, value: ValueEntry) {
        match self.values.iter_mut().find(|v| v.has_name(&value.name)) {
            Some(existing) => {
                existing.value_type = value.value_type;
                existing.data = value.data;
            }
            None => self.values.push(value),
        }
        self.touch();
    }

    /// Removes a value by name.
    pub fn remove_value(&mut self, name: &str) -> Option<ValueEntry> {
        let pos = self.values.iter().position(|v| v.has_name(name))?;
        self.touch();
        Some(self.values.remove(pos))
    }

    /// Largest payload among this key's values.
    pub fn max_value_data_len(&self) -> usize {
        self.values.iter().map(|v| v.data.len()).max().unwrap_or(0)
    }

    /// Updates the last-written stamp.
    pub fn touch(&mut self) {
        self.last_written = filetime_now();
    }

    /// Number of keys in this subtree, itself included.
    pub fn key_count(&self) -> usize {
        1 + self.subkeys.iter().map(HiveKey::key_count).sum::<usize>()
    }
}
