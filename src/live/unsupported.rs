//! Stand-in used where there is no OS registry.

use crate::config::DriveMapping;
use crate::dispatch::StreamOptions;
use crate::error::{RegistryError, Result};
use crate::path::{KeyInfo, KeyPath, PredefinedKey};
use crate::value::ValueEntry;

fn unavailable<T>() -> Result<T> {
    Err(RegistryError::unavailable("live registry requires Windows"))
}

pub fn subkey_names(_root: PredefinedKey, _path: &KeyPath) -> Result<Vec<String>> {
    unavailable()
}

pub fn stream(
    _root: PredefinedKey,
    _path: &KeyPath,
    _options: StreamOptions,
    _on_value: &mut dyn FnMut(ValueEntry) -> bool,
    _on_subkey: &mut dyn FnMut(&str) -> bool,
) -> Result<bool> {
    unavailable()
}

pub fn value(_root: PredefinedKey, _path: &KeyPath, _name: &str) -> Result<ValueEntry> {
    unavailable()
}

pub fn info(_root: PredefinedKey, _path: &KeyPath) -> Result<KeyInfo> {
    unavailable()
}

pub fn create_key(_root: PredefinedKey, _path: &KeyPath) -> Result<()> {
    unavailable()
}

pub fn create_link(_root: PredefinedKey, _path: &KeyPath, _target: &str) -> Result<()> {
    unavailable()
}

pub fn delete_key(_root: PredefinedKey, _path: &KeyPath) -> Result<()> {
    unavailable()
}

pub fn rename_key(_root: PredefinedKey, _path: &KeyPath, _new_name: &str) -> Result<()> {
    unavailable()
}

pub fn set_value(_root: PredefinedKey, _path: &KeyPath, _value: &ValueEntry) -> Result<()> {
    unavailable()
}

pub fn delete_value(_root: PredefinedKey, _path: &KeyPath, _name: &str) -> Result<()> {
    unavailable()
}

pub fn link_target(_root: PredefinedKey, _path: &KeyPath) -> Result<Option<String>> {
    unavailable()
}

pub fn current_user_sid() -> Option<String> {
    None
}

pub fn logical_drives() -> Vec<DriveMapping> {
    Vec::new()
}
