//! One CRUD and enumeration surface over every backend.
//!
//! [`BackendDispatcher`] looks at the tagged root of a [`NodeAddress`] and
//! forwards the call to the live, offline or virtual backend. Each operation
//! comes in two shapes:
//!
//! - a plain form returning `bool`, `Option` or an empty collection, which
//!   logs failures at `debug` and swallows them (tree population code wants
//!   "nothing there" rather than an error);
//! - a `try_` form returning [`Result`] so the caller can show the OS text.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use unireg::{BackendDispatcher, ValueEntry, VirtualRegistryData, VirtualRegistryKey};
//!
//! let dispatcher = BackendDispatcher::default();
//! let data = Arc::new(VirtualRegistryData::new("scratch.reg", VirtualRegistryKey::default()));
//! let root = dispatcher.register_virtual_root(data);
//!
//! let key = root.child("Software").child("Example");
//! assert!(dispatcher.create_key(&key));
//! assert!(dispatcher.set_value(&key, &ValueEntry::dword("Count", 3)));
//! assert_eq!(dispatcher.query_value(&key, "COUNT").unwrap().data, 3u32.to_le_bytes());
//! assert_eq!(dispatcher.enumerate_subkey_names(&root, true), vec!["Software"]);
//! ```

use crate::config::RegistryConfig;
use crate::context::RegistryContext;
use crate::error::{RegistryError, Result};
use crate::normalize::PathNormalizer;
use crate::offline::OfflineHiveHandle;
use crate::path::{build_path, BackendRoot, KeyInfo, KeyPath, NodeAddress, PredefinedKey};
use crate::symlink::SymbolicLinkResolver;
use crate::utils::{fold_case, names_equal};
use crate::value::{ValueEntry, SYMBOLIC_LINK_VALUE};
use crate::virtual_tree::VirtualRegistryData;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Children of the synthetic `\REGISTRY` root.
const NATIVE_CHILDREN: [&str; 2] = ["MACHINE", "USER"];

/// What [`BackendDispatcher::stream_enumerate`] delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Deliver values.
    pub values: bool,
    /// Include value payloads; entries carry empty data when false.
    pub data: bool,
    /// Deliver subkey names.
    pub subkeys: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            values: true,
            data: true,
            subkeys: true,
        }
    }
}

impl StreamOptions {
    /// Values with data, no subkeys.
    pub fn values_only() -> Self {
        Self {
            values: true,
            data: true,
            subkeys: false,
        }
    }

    /// Subkey names only.
    pub fn subkeys_only() -> Self {
        Self {
            values: false,
            data: false,
            subkeys: true,
        }
    }
}

/// Backend a node resolved to.
enum Backend<'n> {
    /// The synthetic `\REGISTRY` root itself.
    NativeRoot,
    Live(PredefinedKey, KeyPath),
    Offline(OfflineHiveHandle, &'n KeyPath),
    Virtual(&'n VirtualRegistryData, &'n KeyPath),
}

impl Backend<'_> {
    fn is_root(&self) -> bool {
        match self {
            Backend::NativeRoot => true,
            Backend::Live(_, path) => path.is_empty(),
            Backend::Offline(_, path) | Backend::Virtual(_, path) => path.is_empty(),
        }
    }
}

/// Routes operations on [`NodeAddress`]es to the backend named by their root.
#[derive(Debug, Clone)]
pub struct BackendDispatcher {
    ctx: Arc<RegistryContext>,
}

impl Default for BackendDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(RegistryContext::default()))
    }
}

impl BackendDispatcher {
    /// Dispatcher over a shared context.
    pub fn new(ctx: Arc<RegistryContext>) -> Self {
        Self { ctx }
    }

    /// Dispatcher over a fresh context built from `config`.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self::new(Arc::new(RegistryContext::new(config)))
    }

    /// Shared context.
    pub fn context(&self) -> &RegistryContext {
        &self.ctx
    }

    /// Path normalizer bound to this dispatcher's context.
    pub fn normalizer(&self) -> PathNormalizer<'_> {
        PathNormalizer::new(&self.ctx)
    }

    fn backend<'n>(&self, node: &'n NodeAddress) -> Result<Backend<'n>> {
        match &node.root {
            BackendRoot::Live(Some(key)) => Ok(Backend::Live(*key, node.path.clone())),
            BackendRoot::Live(None) => {
                let Some(first) = node.path.segments().first() else {
                    return Ok(Backend::NativeRoot);
                };
                let key = if first.eq_ignore_ascii_case(NATIVE_CHILDREN[0]) {
                    PredefinedKey::LocalMachine
                } else if first.eq_ignore_ascii_case(NATIVE_CHILDREN[1]) {
                    PredefinedKey::Users
                } else {
                    return Err(RegistryError::not_found("key", &build_path(node)));
                };
                Ok(Backend::Live(key, node.path.suffix(1)))
            }
            BackendRoot::Offline(hive) => {
                if self.ctx.offline().is_active(*hive) {
                    Ok(Backend::Offline(*hive, &node.path))
                } else {
                    Err(RegistryError::InvalidHandle(hive.id()))
                }
            }
            BackendRoot::Virtual(data) => {
                if self.ctx.is_virtual_root_registered(data) {
                    Ok(Backend::Virtual(data, &node.path))
                } else {
                    Err(RegistryError::NotFound(format!(
                        "virtual root '{}' is not registered",
                        data.root_name()
                    )))
                }
            }
        }
    }

    /// Backend for a mutation; simulated nodes and the native root refuse.
    fn writable<'n>(&self, node: &'n NodeAddress) -> Result<Backend<'n>> {
        if node.simulated {
            return Err(RegistryError::InvalidPath(format!(
                "{} is a placeholder, not a key",
                build_path(node)
            )));
        }
        match self.backend(node)? {
            Backend::NativeRoot => Err(RegistryError::PermissionDenied(
                "the \\REGISTRY namespace is read-only".to_string(),
            )),
            backend => Ok(backend),
        }
    }

    fn swallow<T>(&self, operation: &str, node: &NodeAddress, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(operation, node = %node, error = %e, "Registry operation failed");
                None
            }
        }
    }

    /// Names of direct subkeys, optionally sorted case-insensitively.
    pub fn try_enumerate_subkey_names(&self, node: &NodeAddress, sorted: bool) -> Result<Vec<String>> {
        let mut names = match self.backend(node)? {
            Backend::NativeRoot => NATIVE_CHILDREN.iter().map(|s| s.to_string()).collect(),
            Backend::Live(key, path) => self.ctx.live().subkey_names(key, &path)?,
            Backend::Offline(hive, path) => self.ctx.offline().subkey_names(hive, path)?,
            Backend::Virtual(data, path) => data.subkey_names(path)?,
        };
        if sorted {
            names.sort_by_key(|name| fold_case(name));
        }
        Ok(names)
    }

    /// Names of direct subkeys; empty for an unreadable node.
    pub fn enumerate_subkey_names(&self, node: &NodeAddress, sorted: bool) -> Vec<String> {
        self.swallow(
            "enumerate_subkey_names",
            node,
            self.try_enumerate_subkey_names(node, sorted),
        )
        .unwrap_or_default()
    }

    /// All values of a key.
    pub fn try_enumerate_values(&self, node: &NodeAddress) -> Result<Vec<ValueEntry>> {
        match self.backend(node)? {
            Backend::NativeRoot => Ok(Vec::new()),
            Backend::Live(key, path) => self.ctx.live().values(key, &path),
            Backend::Offline(hive, path) => self.ctx.offline().values(hive, path),
            Backend::Virtual(data, path) => data.values(path),
        }
    }

    /// All values of a key; empty for an unreadable node.
    pub fn enumerate_values(&self, node: &NodeAddress) -> Vec<ValueEntry> {
        self.swallow("enumerate_values", node, self.try_enumerate_values(node))
            .unwrap_or_default()
    }

    /// Streams values and then subkey names.
    ///
    /// Returns `Ok(false)` as soon as a callback returns false.
    pub fn try_stream_enumerate<V, S>(
        &self,
        node: &NodeAddress,
        options: StreamOptions,
        mut on_value: V,
        mut on_subkey: S,
    ) -> Result<bool>
    where
        V: FnMut(ValueEntry) -> bool,
        S: FnMut(&str) -> bool,
    {
        match self.backend(node)? {
            Backend::NativeRoot => {
                if options.subkeys {
                    for name in NATIVE_CHILDREN {
                        if !on_subkey(name) {
                            return Ok(false);
                        }
                    }
                }
                Ok(true)
            }
            Backend::Live(key, path) => self.ctx.live().stream(key, &path, options, &mut on_value, &mut on_subkey),
            Backend::Offline(hive, path) => {
                self.ctx
                    .offline()
                    .stream(hive, path, options, &mut on_value, &mut on_subkey)
            }
            Backend::Virtual(data, path) => data.stream(path, options, &mut on_value, &mut on_subkey),
        }
    }

    /// Streams values and then subkey names; false if cancelled or unreadable.
    pub fn stream_enumerate<V, S>(&self, node: &NodeAddress, options: StreamOptions, on_value: V, on_subkey: S) -> bool
    where
        V: FnMut(ValueEntry) -> bool,
        S: FnMut(&str) -> bool,
    {
        let result = self.try_stream_enumerate(node, options, on_value, on_subkey);
        self.swallow("stream_enumerate", node, result).unwrap_or(false)
    }

    /// One value by case-insensitive name; `""` is the default value.
    pub fn try_query_value(&self, node: &NodeAddress, name: &str) -> Result<ValueEntry> {
        match self.backend(node)? {
            Backend::NativeRoot => Err(RegistryError::not_found("value", name)),
            Backend::Live(key, path) => self.ctx.live().value(key, &path, name),
            Backend::Offline(hive, path) => self.ctx.offline().value(hive, path, name),
            Backend::Virtual(data, path) => data.value(path, name),
        }
    }

    /// One value, or `None` if it or its key is missing.
    pub fn query_value(&self, node: &NodeAddress, name: &str) -> Option<ValueEntry> {
        self.swallow("query_value", node, self.try_query_value(node, name))
    }

    /// Counts and timestamp of a key.
    pub fn try_query_key_info(&self, node: &NodeAddress) -> Result<KeyInfo> {
        match self.backend(node)? {
            Backend::NativeRoot => Ok(KeyInfo {
                subkey_count: NATIVE_CHILDREN.len() as u32,
                ..KeyInfo::default()
            }),
            Backend::Live(key, path) => self.ctx.live().info(key, &path),
            Backend::Offline(hive, path) => self.ctx.offline().info(hive, path),
            Backend::Virtual(data, path) => data.info(path),
        }
    }

    /// Counts and timestamp, or `None` for an unreadable node.
    pub fn query_key_info(&self, node: &NodeAddress) -> Option<KeyInfo> {
        self.swallow("query_key_info", node, self.try_query_key_info(node))
    }

    /// True if the key can be read.
    pub fn key_exists(&self, node: &NodeAddress) -> bool {
        match self.backend(node) {
            Ok(Backend::Virtual(data, path)) => data.exists(path),
            Ok(_) => self.try_query_key_info(node).is_ok(),
            Err(_) => false,
        }
    }

    /// Creates a key and any missing ancestors; an existing key is success.
    pub fn try_create_key(&self, node: &NodeAddress) -> Result<()> {
        let result = match self.writable(node)? {
            Backend::NativeRoot => native_read_only(),
            Backend::Live(key, path) => self.ctx.live().create_key(key, &path),
            Backend::Offline(hive, path) => self.ctx.offline().create_key(hive, path),
            Backend::Virtual(data, path) => data.create_key(path),
        };
        self.ctx.clear_link_cache();
        result
    }

    /// Creates a key; false on failure.
    pub fn create_key(&self, node: &NodeAddress) -> bool {
        self.swallow("create_key", node, self.try_create_key(node)).is_some()
    }

    /// Deletes a key and its whole subtree. Backend roots cannot be deleted.
    pub fn try_delete_key(&self, node: &NodeAddress) -> Result<()> {
        let backend = self.writable(node)?;
        if backend.is_root() {
            return Err(RegistryError::InvalidPath(format!(
                "cannot delete backend root {}",
                build_path(node)
            )));
        }
        let result = match backend {
            Backend::NativeRoot => native_read_only(),
            Backend::Live(key, path) => self.ctx.live().delete_key(key, &path),
            Backend::Offline(hive, path) => self.ctx.offline().delete_key(hive, path),
            Backend::Virtual(data, path) => data.delete_key(path),
        };
        self.ctx.clear_link_cache();
        result
    }

    /// Deletes a key recursively; false on failure.
    pub fn delete_key(&self, node: &NodeAddress) -> bool {
        self.swallow("delete_key", node, self.try_delete_key(node)).is_some()
    }

    /// Renames a key. A name taken by a sibling fails unless it differs only in case.
    pub fn try_rename_key(&self, node: &NodeAddress, new_name: &str) -> Result<()> {
        if new_name.is_empty() || new_name.contains('\\') {
            return Err(RegistryError::InvalidPath(format!("invalid key name '{}'", new_name)));
        }
        let backend = self.writable(node)?;
        if backend.is_root() {
            return Err(RegistryError::InvalidPath(format!(
                "cannot rename backend root {}",
                build_path(node)
            )));
        }
        let result = match backend {
            Backend::NativeRoot => native_read_only(),
            Backend::Live(key, path) => self.ctx.live().rename_key(key, &path, new_name),
            Backend::Offline(hive, path) => self.ctx.offline().rename_key(hive, path, new_name),
            Backend::Virtual(data, path) => data.rename_key(path, new_name),
        };
        self.ctx.clear_link_cache();
        result
    }

    /// Renames a key; false on failure.
    pub fn rename_key(&self, node: &NodeAddress, new_name: &str) -> bool {
        self.swallow("rename_key", node, self.try_rename_key(node, new_name))
            .is_some()
    }

    /// Creates or replaces a value.
    pub fn try_set_value(&self, node: &NodeAddress, value: &ValueEntry) -> Result<()> {
        let result = match self.writable(node)? {
            Backend::NativeRoot => native_read_only(),
            Backend::Live(key, path) => self.ctx.live().set_value(key, &path, value),
            Backend::Offline(hive, path) => self.ctx.offline().set_value(hive, path, value),
            Backend::Virtual(data, path) => data.set_value(path, value),
        };
        self.clear_links_for(&[&value.name]);
        result
    }

    /// Creates or replaces a value; false on failure.
    pub fn set_value(&self, node: &NodeAddress, value: &ValueEntry) -> bool {
        self.swallow("set_value", node, self.try_set_value(node, value))
            .is_some()
    }

    /// Deletes a value.
    pub fn try_delete_value(&self, node: &NodeAddress, name: &str) -> Result<()> {
        let result = match self.writable(node)? {
            Backend::NativeRoot => native_read_only(),
            Backend::Live(key, path) => self.ctx.live().delete_value(key, &path, name),
            Backend::Offline(hive, path) => self.ctx.offline().delete_value(hive, path, name),
            Backend::Virtual(data, path) => data.delete_value(path, name),
        };
        self.clear_links_for(&[name]);
        result
    }

    /// Deletes a value; false on failure.
    pub fn delete_value(&self, node: &NodeAddress, name: &str) -> bool {
        self.swallow("delete_value", node, self.try_delete_value(node, name))
            .is_some()
    }

    /// Renames a value, keeping type and data.
    pub fn try_rename_value(&self, node: &NodeAddress, old: &str, new: &str) -> Result<()> {
        let result = match self.writable(node)? {
            Backend::NativeRoot => native_read_only(),
            Backend::Live(key, path) => self.ctx.live().rename_value(key, &path, old, new),
            Backend::Offline(hive, path) => self.ctx.offline().rename_value(hive, path, old, new),
            Backend::Virtual(data, path) => data.rename_value(path, old, new),
        };
        self.clear_links_for(&[old, new]);
        result
    }

    /// Drops cached link lookups when `SymbolicLinkValue` is among `names`.
    fn clear_links_for(&self, names: &[&str]) {
        if names.iter().any(|name| names_equal(name, SYMBOLIC_LINK_VALUE)) {
            self.ctx.clear_link_cache();
        }
    }

    /// Renames a value; false on failure.
    pub fn rename_value(&self, node: &NodeAddress, old: &str, new: &str) -> bool {
        self.swallow("rename_value", node, self.try_rename_value(node, old, new))
            .is_some()
    }

    /// Creates a symbolic link key pointing at an NT path.
    pub fn try_create_link(&self, node: &NodeAddress, target: &str) -> Result<()> {
        let result = match self.writable(node)? {
            Backend::NativeRoot => native_read_only(),
            Backend::Live(key, path) => self.ctx.live().create_link(key, &path, target),
            Backend::Offline(hive, path) => self.ctx.offline().create_link(hive, path, target),
            Backend::Virtual(..) => Err(RegistryError::unavailable(
                "virtual registries cannot hold symbolic links",
            )),
        };
        self.ctx.clear_link_cache();
        result
    }

    /// Creates a symbolic link key; false on failure.
    pub fn create_link(&self, node: &NodeAddress, target: &str) -> bool {
        self.swallow("create_link", node, self.try_create_link(node, target))
            .is_some()
    }

    /// NT target of a link key; `None` for ordinary keys and virtual nodes.
    pub fn try_query_symbolic_link_target(&self, node: &NodeAddress) -> Result<Option<String>> {
        match self.backend(node)? {
            Backend::NativeRoot | Backend::Virtual(..) => Ok(None),
            Backend::Live(_, ref path) if path.is_empty() => Ok(None),
            Backend::Live(key, path) => self.ctx.live().link_target(key, &path),
            Backend::Offline(hive, path) => self.ctx.offline().link_target(hive, path),
        }
    }

    /// NT target of a link key, or `None`.
    pub fn query_symbolic_link_target(&self, node: &NodeAddress) -> Option<String> {
        self.swallow(
            "query_symbolic_link_target",
            node,
            self.try_query_symbolic_link_target(node),
        )
        .flatten()
    }

    /// Follows symbolic links in `node`'s path to the key they lead to.
    pub fn try_resolve_links(&self, node: &NodeAddress) -> Result<NodeAddress> {
        SymbolicLinkResolver::new(self).resolve(node)
    }

    /// Follows symbolic links; `None` on a cycle or unreadable target.
    pub fn resolve_links(&self, node: &NodeAddress) -> Option<NodeAddress> {
        self.swallow("resolve_links", node, self.try_resolve_links(node))
    }

    /// Address of a child key.
    pub fn child(&self, node: &NodeAddress, name: &str) -> NodeAddress {
        node.child(name)
    }

    /// Address of the parent key, `None` at a root.
    pub fn parent(&self, node: &NodeAddress) -> Option<NodeAddress> {
        node.parent()
    }

    /// Human-readable path of a node.
    pub fn build_path(&self, node: &NodeAddress) -> String {
        build_path(node)
    }

    /// NT native path of a node, when it has one.
    pub fn build_nt_path(&self, node: &NodeAddress) -> Option<String> {
        self.normalizer().nt_path(node)
    }

    /// Registers a virtual tree and returns its root address.
    pub fn register_virtual_root(&self, data: Arc<VirtualRegistryData>) -> NodeAddress {
        self.ctx.register_virtual_root(data.clone());
        NodeAddress::new(BackendRoot::Virtual(data), KeyPath::new())
    }

    /// Parses an export file and registers it as a virtual root.
    pub fn load_virtual_root(&self, path: impl AsRef<Path>) -> Result<NodeAddress> {
        let data = VirtualRegistryData::from_file(path)?;
        Ok(self.register_virtual_root(Arc::new(data)))
    }

    /// Unregisters a virtual tree; its addresses read as empty afterwards.
    pub fn unregister_virtual_root(&self, data: &Arc<VirtualRegistryData>) -> bool {
        self.ctx.unregister_virtual_root(data)
    }

    /// Root addresses of every registered virtual tree.
    pub fn virtual_roots(&self) -> Vec<NodeAddress> {
        self.ctx
            .virtual_roots()
            .into_iter()
            .map(|data| NodeAddress::new(BackendRoot::Virtual(data), KeyPath::new()))
            .collect()
    }

    fn offline_root_address(&self, hive: OfflineHiveHandle, root_name: &str) -> NodeAddress {
        NodeAddress::new(BackendRoot::Offline(hive), KeyPath::new()).named(root_name)
    }

    /// Opens a hive file. `mount_point` is the path it is treated as living
    /// under when resolving link targets.
    pub fn open_offline_hive(
        &self,
        path: impl AsRef<Path>,
        root_name: &str,
        mount_point: Option<&str>,
    ) -> Result<NodeAddress> {
        let hive = self.ctx.offline().open(path.as_ref(), root_name, mount_point)?;
        Ok(self.offline_root_address(hive, root_name))
    }

    /// Creates an empty in-memory hive.
    pub fn create_offline_hive(&self, root_name: &str, mount_point: Option<&str>) -> Result<NodeAddress> {
        let hive = self.ctx.offline().create(root_name, mount_point)?;
        Ok(self.offline_root_address(hive, root_name))
    }

    /// Closes a hive; its addresses read as empty afterwards.
    pub fn close_offline_hive(&self, hive: OfflineHiveHandle) -> Result<()> {
        self.ctx.clear_link_cache();
        self.ctx.offline().close(hive)
    }

    /// Writes a hive to `path`.
    pub fn save_offline_hive(&self, hive: OfflineHiveHandle, path: impl AsRef<Path>) -> Result<()> {
        self.ctx.offline().save(hive, path.as_ref())
    }

    /// Root addresses of every open offline hive.
    pub fn offline_roots(&self) -> Vec<NodeAddress> {
        self.ctx
            .offline()
            .active_roots()
            .into_iter()
            .map(|(hive, root)| self.offline_root_address(hive, &root.root_name))
            .collect()
    }
}

fn native_read_only() -> Result<()> {
    Err(RegistryError::PermissionDenied(
        "the \\REGISTRY namespace is read-only".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_tree::VirtualRegistryKey;

    fn virtual_root(dispatcher: &BackendDispatcher) -> (Arc<VirtualRegistryData>, NodeAddress) {
        let data = Arc::new(VirtualRegistryData::new("test.reg", VirtualRegistryKey::default()));
        let root = dispatcher.register_virtual_root(data.clone());
        (data, root)
    }

    #[test]
    fn test_virtual_crud() {
        let dispatcher = BackendDispatcher::default();
        let (_, root) = virtual_root(&dispatcher);
        let key = root.child("A").child("B");

        assert!(dispatcher.create_key(&key));
        assert!(dispatcher.create_key(&key));
        assert!(dispatcher.key_exists(&root.child("a")));
        assert!(dispatcher.set_value(&key, &ValueEntry::string("Name", "value")));
        assert!(dispatcher.set_value(&key, &ValueEntry::string("", "default")));

        let names: Vec<String> = dispatcher
            .enumerate_values(&key)
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["", "Name"]);

        let info = dispatcher.query_key_info(&key).unwrap();
        assert_eq!(info.value_count, 2);
        assert_eq!(info.last_write, None);

        assert!(dispatcher.rename_value(&key, "name", "Renamed"));
        assert!(dispatcher.query_value(&key, "Name").is_none());
        assert!(dispatcher.delete_value(&key, "RENAMED"));
        assert!(!dispatcher.delete_value(&key, "Renamed"));
    }

    #[test]
    fn test_rename_key_collisions() {
        let dispatcher = BackendDispatcher::default();
        let (_, root) = virtual_root(&dispatcher);
        assert!(dispatcher.create_key(&root.child("One")));
        assert!(dispatcher.create_key(&root.child("Two")));

        let err = dispatcher.try_rename_key(&root.child("One"), "TWO").unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(_)));
        assert!(dispatcher.rename_key(&root.child("One"), "ONE"));
        assert_eq!(dispatcher.enumerate_subkey_names(&root, true), vec!["ONE", "Two"]);
        assert!(!dispatcher.rename_key(&root.child("Two"), "a\\b"));
    }

    #[test]
    fn test_root_and_simulated_refuse_mutation() {
        let dispatcher = BackendDispatcher::default();
        let (_, root) = virtual_root(&dispatcher);
        assert!(!dispatcher.delete_key(&root));
        assert!(!dispatcher.rename_key(&root, "Other"));

        let placeholder = root.child("Loading").simulated();
        assert!(!dispatcher.create_key(&placeholder));
        assert!(!dispatcher.set_value(&placeholder, &ValueEntry::dword("x", 1)));
    }

    #[test]
    fn test_unregistered_root_reads_empty() {
        let dispatcher = BackendDispatcher::default();
        let (data, root) = virtual_root(&dispatcher);
        assert!(dispatcher.create_key(&root.child("Key")));
        assert!(dispatcher.unregister_virtual_root(&data));

        assert!(dispatcher.enumerate_subkey_names(&root, false).is_empty());
        assert!(!dispatcher.key_exists(&root.child("Key")));
        assert!(!dispatcher.stream_enumerate(&root, StreamOptions::default(), |_| true, |_| true));
        assert!(dispatcher.virtual_roots().is_empty());
    }

    #[test]
    fn test_stream_cancel() {
        let dispatcher = BackendDispatcher::default();
        let (_, root) = virtual_root(&dispatcher);
        for name in ["a", "b", "c"] {
            assert!(dispatcher.create_key(&root.child(name)));
        }

        let mut seen = Vec::new();
        let finished = dispatcher.stream_enumerate(&root, StreamOptions::default(), |_| true, |name| {
            seen.push(name.to_string());
            seen.len() < 2
        });
        assert!(!finished);
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_stream_without_data() {
        let dispatcher = BackendDispatcher::default();
        let (_, root) = virtual_root(&dispatcher);
        assert!(dispatcher.set_value(&root, &ValueEntry::binary("blob", &[1, 2, 3])));

        let mut values = Vec::new();
        let options = StreamOptions {
            data: false,
            ..StreamOptions::default()
        };
        assert!(dispatcher.stream_enumerate(
            &root,
            options,
            |v| {
                values.push(v);
                true
            },
            |_| true
        ));
        assert_eq!(values.len(), 1);
        assert!(values[0].data.is_empty());
    }

    #[test]
    fn test_native_root() {
        let dispatcher = BackendDispatcher::default();
        let root = NodeAddress::native("");
        assert_eq!(dispatcher.enumerate_subkey_names(&root, true), vec!["MACHINE", "USER"]);
        assert_eq!(dispatcher.query_key_info(&root).unwrap().subkey_count, 2);
        assert!(!dispatcher.create_key(&root));
        assert!(dispatcher.query_symbolic_link_target(&root).is_none());
        assert_eq!(dispatcher.build_nt_path(&root).as_deref(), Some("\\REGISTRY"));
    }

    #[test]
    fn test_offline_dispatch() {
        let dispatcher = BackendDispatcher::default();
        let root = dispatcher.create_offline_hive("Scratch", None).unwrap();
        let key = root.child("A").child("B");
        assert!(dispatcher.create_key(&key));
        assert!(dispatcher.set_value(&key, &ValueEntry::qword("Big", u64::MAX)));
        assert_eq!(dispatcher.offline_roots(), vec![root.clone()]);

        assert!(dispatcher.delete_key(&root.child("A")));
        assert!(!dispatcher.key_exists(&key));
        assert!(dispatcher.query_value(&key, "Big").is_none());

        let BackendRoot::Offline(hive) = &root.root else {
            panic!("expected an offline root");
        };
        dispatcher.close_offline_hive(*hive).unwrap();
        assert!(dispatcher.enumerate_subkey_names(&root, false).is_empty());
        assert!(!dispatcher.create_key(&root.child("Again")));
    }

    #[test]
    fn test_link_cache_cleared_by_mutation() {
        let dispatcher = BackendDispatcher::default();
        let (_, root) = virtual_root(&dispatcher);
        dispatcher.context().cache_link("x".to_string(), None);
        assert!(dispatcher.create_key(&root.child("K")));
        assert_eq!(dispatcher.context().link_cache_len(), 0);
    }

    #[test]
    fn test_link_value_edit_refreshes_resolution() {
        let dispatcher = BackendDispatcher::default();
        let root = dispatcher
            .create_offline_hive("SOFTWARE", Some("HKLM\\SOFTWARE"))
            .unwrap();
        assert!(dispatcher.create_key(&root.child("First")));
        assert!(dispatcher.create_key(&root.child("Second")));
        let alias = root.child("Alias");
        assert!(dispatcher.create_link(&alias, "\\REGISTRY\\MACHINE\\SOFTWARE\\First"));
        assert_eq!(dispatcher.resolve_links(&alias).unwrap().path.to_string(), "First");

        assert!(dispatcher.set_value(&alias, &ValueEntry::dword("Other", 1)));
        assert!(dispatcher.context().link_cache_len() > 0);

        assert!(dispatcher.set_value(&alias, &ValueEntry::link("\\REGISTRY\\MACHINE\\SOFTWARE\\Second")));
        assert_eq!(dispatcher.context().link_cache_len(), 0);
        assert_eq!(dispatcher.resolve_links(&alias).unwrap().path.to_string(), "Second");

        assert!(dispatcher.delete_value(&alias, SYMBOLIC_LINK_VALUE));
        assert_eq!(dispatcher.context().link_cache_len(), 0);
    }

    #[test]
    fn test_virtual_has_no_links() {
        let dispatcher = BackendDispatcher::default();
        let (_, root) = virtual_root(&dispatcher);
        assert!(!dispatcher.create_link(&root.child("L"), "\\REGISTRY\\MACHINE"));
        assert!(dispatcher.query_symbolic_link_target(&root.child("L")).is_none());
    }

    #[cfg(not(windows))]
    #[test]
    fn test_live_unavailable_off_windows() {
        let dispatcher = BackendDispatcher::default();
        let node = NodeAddress::live_path(PredefinedKey::LocalMachine, "SOFTWARE");
        assert!(dispatcher.enumerate_subkey_names(&node, true).is_empty());
        assert!(!dispatcher.key_exists(&node));
        assert!(matches!(
            dispatcher.try_query_key_info(&node),
            Err(RegistryError::BackendUnavailable(_))
        ));
    }
}
