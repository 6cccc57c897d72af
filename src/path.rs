//! Node identities and path formatting.
//!
//! A [`NodeAddress`] names one key in one backend. It is plain data: cloning it
//! never opens or pins anything, and it can be created and dropped freely while
//! a tree view is populated.

use crate::offline::OfflineHiveHandle;
use crate::utils::{fold_case, names_equal};
use crate::virtual_tree::VirtualRegistryData;
use chrono::{DateTime, Utc};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Root of the native NT registry namespace.
pub const NT_REGISTRY_ROOT: &str = "\\REGISTRY";

/// NT path of `HKEY_LOCAL_MACHINE`.
pub const NT_MACHINE: &str = "\\REGISTRY\\MACHINE";

/// NT path of `HKEY_USERS`.
pub const NT_USER: &str = "\\REGISTRY\\USER";

/// NT path backing `HKEY_CLASSES_ROOT`.
pub const NT_CLASSES: &str = "\\REGISTRY\\MACHINE\\SOFTWARE\\Classes";

/// NT path backing `HKEY_CURRENT_CONFIG`.
pub const NT_CURRENT_CONFIG: &str =
    "\\REGISTRY\\MACHINE\\SYSTEM\\CurrentControlSet\\Hardware Profiles\\Current";

/// The predefined top-level keys of the live registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PredefinedKey {
    /// `HKEY_CLASSES_ROOT`
    ClassesRoot,
    /// `HKEY_CURRENT_USER`
    CurrentUser,
    /// `HKEY_LOCAL_MACHINE`
    LocalMachine,
    /// `HKEY_USERS`
    Users,
    /// `HKEY_CURRENT_CONFIG`
    CurrentConfig,
}

impl PredefinedKey {
    /// All predefined keys in the order regedit lists them.
    pub const ALL: [PredefinedKey; 5] = [
        PredefinedKey::ClassesRoot,
        PredefinedKey::CurrentUser,
        PredefinedKey::LocalMachine,
        PredefinedKey::Users,
        PredefinedKey::CurrentConfig,
    ];

    /// Full root name, e.g. `HKEY_LOCAL_MACHINE`.
    pub fn full_name(&self) -> &'static str {
        match self {
            PredefinedKey::ClassesRoot => "HKEY_CLASSES_ROOT",
            PredefinedKey::CurrentUser => "HKEY_CURRENT_USER",
            PredefinedKey::LocalMachine => "HKEY_LOCAL_MACHINE",
            PredefinedKey::Users => "HKEY_USERS",
            PredefinedKey::CurrentConfig => "HKEY_CURRENT_CONFIG",
        }
    }

    /// Short alias, e.g. `HKLM`.
    pub fn short_name(&self) -> &'static str {
        match self {
            PredefinedKey::ClassesRoot => "HKCR",
            PredefinedKey::CurrentUser => "HKCU",
            PredefinedKey::LocalMachine => "HKLM",
            PredefinedKey::Users => "HKU",
            PredefinedKey::CurrentConfig => "HKCC",
        }
    }

    /// Parses either the full name or the short alias, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| {
            name.eq_ignore_ascii_case(key.full_name()) || name.eq_ignore_ascii_case(key.short_name())
        })
    }

    /// NT path this root maps to. `HKEY_CURRENT_USER` needs the user's SID.
    pub fn nt_prefix(&self, current_user_sid: Option<&str>) -> Option<String> {
        match self {
            PredefinedKey::ClassesRoot => Some(NT_CLASSES.to_string()),
            PredefinedKey::CurrentUser => {
                current_user_sid.map(|sid| format!("{}\\{}", NT_USER, sid))
            }
            PredefinedKey::LocalMachine => Some(NT_MACHINE.to_string()),
            PredefinedKey::Users => Some(NT_USER.to_string()),
            PredefinedKey::CurrentConfig => Some(NT_CURRENT_CONFIG.to_string()),
        }
    }
}

impl fmt::Display for PredefinedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.full_name())
    }
}

/// Ordered subkey path; comparisons ignore case.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    /// Empty path (the backend root itself).
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits a backslash-joined path, dropping empty segments.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('\\')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Builds a path from segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True for the backend root.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment (the key's own name).
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Path with `name` appended.
    pub fn join(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(name.split('\\').filter(|s| !s.is_empty()).map(str::to_string));
        Self { segments }
    }

    /// Path with `other`'s segments appended.
    pub fn join_path(&self, other: &KeyPath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// First `len` segments.
    pub fn prefix(&self, len: usize) -> Self {
        Self {
            segments: self.segments[..len.min(self.segments.len())].to_vec(),
        }
    }

    /// Segments after the first `len`.
    pub fn suffix(&self, len: usize) -> Self {
        Self {
            segments: self.segments[len.min(self.segments.len())..].to_vec(),
        }
    }

    /// Case-insensitive prefix test.
    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        prefix.len() <= self.len()
            && prefix
                .segments
                .iter()
                .zip(&self.segments)
                .all(|(a, b)| names_equal(a, b))
    }

    /// Same path with the last segment replaced.
    pub fn with_name(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        match segments.last_mut() {
            Some(last) => *last = name.to_string(),
            None => segments.push(name.to_string()),
        }
        Self { segments }
    }

    /// Lowercased joined form, for use as a map key.
    pub fn folded(&self) -> String {
        fold_case(&self.to_string())
    }
}

impl PartialEq for KeyPath {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.starts_with(other)
    }
}

impl Eq for KeyPath {}

impl Hash for KeyPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for segment in &self.segments {
            fold_case(segment).hash(state);
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("\\"))
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

/// Which backend a node lives in, carried directly in the address.
#[derive(Clone)]
pub enum BackendRoot {
    /// Live OS registry. `None` is the synthetic `\REGISTRY` namespace whose
    /// children are `MACHINE` and `USER`.
    Live(Option<PredefinedKey>),
    /// An offline hive opened through the hive API.
    Offline(OfflineHiveHandle),
    /// A parsed export file mounted as a root.
    Virtual(Arc<VirtualRegistryData>),
}

impl BackendRoot {
    /// Display name used when the caller does not supply one.
    pub fn default_name(&self) -> String {
        match self {
            BackendRoot::Live(Some(key)) => key.full_name().to_string(),
            BackendRoot::Live(None) => NT_REGISTRY_ROOT.to_string(),
            BackendRoot::Offline(handle) => format!("Offline hive {}", handle.id()),
            BackendRoot::Virtual(data) => data.root_name().to_string(),
        }
    }

    /// Short tag distinguishing backend instances, used in cache keys.
    pub fn tag(&self) -> String {
        match self {
            BackendRoot::Live(_) => "live".to_string(),
            BackendRoot::Offline(handle) => format!("offline#{}", handle.id()),
            BackendRoot::Virtual(data) => format!("virtual@{:p}", Arc::as_ptr(data)),
        }
    }
}

impl PartialEq for BackendRoot {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BackendRoot::Live(a), BackendRoot::Live(b)) => a == b,
            (BackendRoot::Offline(a), BackendRoot::Offline(b)) => a == b,
            (BackendRoot::Virtual(a), BackendRoot::Virtual(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for BackendRoot {}

impl fmt::Debug for BackendRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendRoot::Live(key) => f.debug_tuple("Live").field(key).finish(),
            BackendRoot::Offline(handle) => f.debug_tuple("Offline").field(handle).finish(),
            BackendRoot::Virtual(data) => f.debug_tuple("Virtual").field(&data.root_name()).finish(),
        }
    }
}

/// Address of one key in one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    /// Backend root identity.
    pub root: BackendRoot,
    /// Display name of the root.
    pub root_name: String,
    /// Subkey path below the root.
    pub path: KeyPath,
    /// Synthetic placeholder node not backed by a real key.
    pub simulated: bool,
}

impl NodeAddress {
    /// Creates an address with the root's default display name.
    pub fn new(root: BackendRoot, path: KeyPath) -> Self {
        let root_name = root.default_name();
        Self {
            root,
            root_name,
            path,
            simulated: false,
        }
    }

    /// Address of a predefined live key.
    pub fn live(key: PredefinedKey) -> Self {
        Self::new(BackendRoot::Live(Some(key)), KeyPath::new())
    }

    /// Address of a path under a predefined live key.
    pub fn live_path(key: PredefinedKey, path: &str) -> Self {
        Self::new(BackendRoot::Live(Some(key)), KeyPath::parse(path))
    }

    /// Address inside the synthetic `\REGISTRY` namespace.
    pub fn native(path: &str) -> Self {
        Self::new(BackendRoot::Live(None), KeyPath::parse(path))
    }

    /// Marks the address as a synthetic placeholder.
    pub fn simulated(mut self) -> Self {
        self.simulated = true;
        self
    }

    /// Replaces the root display name.
    pub fn named(mut self, root_name: impl Into<String>) -> Self {
        self.root_name = root_name.into();
        self
    }

    /// Address of a child key.
    pub fn child(&self, name: &str) -> Self {
        Self {
            root: self.root.clone(),
            root_name: self.root_name.clone(),
            path: self.path.join(name),
            simulated: false,
        }
    }

    /// Address of the parent key, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        self.path.parent().map(|path| Self {
            root: self.root.clone(),
            root_name: self.root_name.clone(),
            path,
            simulated: false,
        })
    }

    /// Same root, different path.
    pub fn with_path(&self, path: KeyPath) -> Self {
        Self {
            root: self.root.clone(),
            root_name: self.root_name.clone(),
            path,
            simulated: false,
        }
    }

    /// Key's own name; the root name at the root.
    pub fn name(&self) -> &str {
        self.path.name().unwrap_or(&self.root_name)
    }

    /// True when the address names the backend root itself.
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&build_path(self))
    }
}

/// Summary of one key, as reported by `query_info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyInfo {
    /// Number of direct subkeys.
    pub subkey_count: u32,
    /// Number of values.
    pub value_count: u32,
    /// Last write time, when the backend records one.
    pub last_write: Option<DateTime<Utc>>,
    /// Largest value payload in bytes.
    pub max_value_data_len: u32,
}

/// Human-readable path: root display name followed by the subkey path.
pub fn build_path(node: &NodeAddress) -> String {
    if node.path.is_empty() {
        node.root_name.clone()
    } else {
        format!("{}\\{}", node.root_name, node.path)
    }
}

/// Display name of a node's root.
pub fn root_name(node: &NodeAddress) -> &str {
    &node.root_name
}

/// NT native path of a live node.
///
/// Returns `None` for non-live nodes and for `HKEY_CURRENT_USER` when the
/// user's SID is unknown. Offline nodes are handled by the dispatcher, which
/// knows their mount points.
pub fn build_live_nt_path(node: &NodeAddress, current_user_sid: Option<&str>) -> Option<String> {
    let prefix = match &node.root {
        BackendRoot::Live(Some(key)) => key.nt_prefix(current_user_sid)?,
        BackendRoot::Live(None) => NT_REGISTRY_ROOT.to_string(),
        _ => return None,
    };
    if node.path.is_empty() {
        Some(prefix)
    } else {
        Some(format!("{}\\{}", prefix, node.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_predefined_names() {
        assert_eq!(PredefinedKey::from_name("hklm"), Some(PredefinedKey::LocalMachine));
        assert_eq!(
            PredefinedKey::from_name("HKEY_CURRENT_CONFIG"),
            Some(PredefinedKey::CurrentConfig)
        );
        assert_eq!(PredefinedKey::from_name("HKEY_NOPE"), None);
    }

    #[test]
    fn test_key_path_case_insensitive() {
        let a = KeyPath::parse("Software\\Microsoft");
        let b = KeyPath::parse("SOFTWARE\\microsoft\\");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_key_path_ops() {
        let p = KeyPath::parse("A\\B\\C");
        assert_eq!(p.name(), Some("C"));
        assert_eq!(p.parent().unwrap().to_string(), "A\\B");
        assert!(p.starts_with(&KeyPath::parse("a\\b")));
        assert_eq!(p.suffix(1).to_string(), "B\\C");
        assert_eq!(p.with_name("D").to_string(), "A\\B\\D");
        assert_eq!(KeyPath::new().parent(), None);
    }

    #[test]
    fn test_build_paths() {
        let node = NodeAddress::live_path(PredefinedKey::LocalMachine, "SOFTWARE\\Foo");
        assert_eq!(build_path(&node), "HKEY_LOCAL_MACHINE\\SOFTWARE\\Foo");
        assert_eq!(
            build_live_nt_path(&node, None).unwrap(),
            "\\REGISTRY\\MACHINE\\SOFTWARE\\Foo"
        );

        let hkcu = NodeAddress::live_path(PredefinedKey::CurrentUser, "Console");
        assert!(build_live_nt_path(&hkcu, None).is_none());
        assert_eq!(
            build_live_nt_path(&hkcu, Some("S-1-5-21-1")).unwrap(),
            "\\REGISTRY\\USER\\S-1-5-21-1\\Console"
        );
    }

    #[test]
    fn test_native_namespace_root() {
        let node = NodeAddress::native("MACHINE\\SYSTEM");
        assert_eq!(build_path(&node), "\\REGISTRY\\MACHINE\\SYSTEM");
        assert_eq!(node.root, BackendRoot::Live(None));
    }
}
