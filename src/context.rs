//! Shared state behind a [`BackendDispatcher`](crate::dispatch::BackendDispatcher).
//!
//! Everything that would otherwise be process-wide lives here: the registered
//! virtual roots, the offline backend with its active hives, the link cache,
//! and the host facts (user SID, control set, drive map) resolved lazily once.

use crate::config::{DriveMapping, RegistryConfig};
use crate::hive::RegfHiveApi;
use crate::live::LiveBackend;
use crate::offline::{HiveApi, OfflineBackend};
use crate::path::{KeyPath, PredefinedKey};
use crate::value::ValueData;
use crate::virtual_tree::VirtualRegistryData;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of every table shared between backends.
pub struct RegistryContext {
    config: RegistryConfig,
    live: LiveBackend,
    offline: OfflineBackend,
    virtual_roots: Mutex<Vec<Arc<VirtualRegistryData>>>,
    link_cache: Mutex<HashMap<String, Option<String>>>,
    current_user_sid: OnceLock<Option<String>>,
    control_set: OnceLock<Option<u32>>,
    drive_map: OnceLock<Vec<DriveMapping>>,
}

impl RegistryContext {
    /// Builds a context; the built-in hive API is loaded when the config asks for it.
    pub fn new(config: RegistryConfig) -> Self {
        let api: Option<Arc<dyn HiveApi>> = if config.enable_hive_api {
            Some(Arc::new(RegfHiveApi::new()))
        } else {
            None
        };
        Self::with_hive_api(config, api)
    }

    /// Builds a context around an explicitly supplied hive API (or none).
    pub fn with_hive_api(config: RegistryConfig, api: Option<Arc<dyn HiveApi>>) -> Self {
        debug!(hive_api = ?api.as_ref().map(|a| a.name()), "Creating registry context");
        Self {
            config,
            live: LiveBackend::new(),
            offline: OfflineBackend::new(api),
            virtual_roots: Mutex::new(Vec::new()),
            link_cache: Mutex::new(HashMap::new()),
            current_user_sid: OnceLock::new(),
            control_set: OnceLock::new(),
            drive_map: OnceLock::new(),
        }
    }

    /// Settings this context was built with.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Live backend.
    pub fn live(&self) -> &LiveBackend {
        &self.live
    }

    /// Offline backend and its active roots.
    pub fn offline(&self) -> &OfflineBackend {
        &self.offline
    }

    /// Adds a virtual root; registering the same `Arc` twice is a no-op.
    pub fn register_virtual_root(&self, data: Arc<VirtualRegistryData>) {
        let mut roots = lock(&self.virtual_roots);
        if !roots.iter().any(|r| Arc::ptr_eq(r, &data)) {
            roots.push(data);
        }
    }

    /// Removes a virtual root; false if it was not registered.
    pub fn unregister_virtual_root(&self, data: &Arc<VirtualRegistryData>) -> bool {
        let mut roots = lock(&self.virtual_roots);
        let before = roots.len();
        roots.retain(|r| !Arc::ptr_eq(r, data));
        roots.len() != before
    }

    /// True if this exact `Arc` is registered.
    pub fn is_virtual_root_registered(&self, data: &Arc<VirtualRegistryData>) -> bool {
        lock(&self.virtual_roots).iter().any(|r| Arc::ptr_eq(r, data))
    }

    /// Registered virtual roots in registration order.
    pub fn virtual_roots(&self) -> Vec<Arc<VirtualRegistryData>> {
        lock(&self.virtual_roots).clone()
    }

    /// Cached link lookup: `Some(None)` is a cached miss.
    pub fn cached_link(&self, key: &str) -> Option<Option<String>> {
        let hit = lock(&self.link_cache).get(key).cloned();
        debug!(key, hit = hit.is_some(), "Link cache lookup");
        hit
    }

    /// Records a link lookup result, hit or miss.
    pub fn cache_link(&self, key: String, target: Option<String>) {
        lock(&self.link_cache).insert(key, target);
    }

    /// Drops every cached link lookup.
    pub fn clear_link_cache(&self) {
        lock(&self.link_cache).clear();
    }

    /// Number of cached link lookups.
    pub fn link_cache_len(&self) -> usize {
        lock(&self.link_cache).len()
    }

    /// SID of the current user, from config or the host.
    pub fn current_user_sid(&self) -> Option<String> {
        self.current_user_sid
            .get_or_init(|| {
                self.config
                    .current_user_sid
                    .clone()
                    .or_else(|| self.live.current_user_sid())
            })
            .clone()
    }

    /// Active control set number, from config or `HKLM\SYSTEM\Select\Current`.
    pub fn active_control_set(&self) -> Option<u32> {
        *self.control_set.get_or_init(|| {
            if let Some(number) = self.config.active_control_set {
                return Some(number);
            }
            let number = self
                .live
                .value(PredefinedKey::LocalMachine, &KeyPath::parse("SYSTEM\\Select"), "Current")
                .ok()
                .and_then(|value| match value.decoded() {
                    ValueData::Dword(n) => Some(n),
                    _ => None,
                });
            debug!(?number, "Resolved active control set");
            number
        })
    }

    /// Drive letter to device table, from config or the host.
    pub fn drive_map(&self) -> &[DriveMapping] {
        self.drive_map.get_or_init(|| {
            self.config
                .drive_map
                .clone()
                .unwrap_or_else(|| self.live.logical_drives())
        })
    }
}

impl Default for RegistryContext {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl fmt::Debug for RegistryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryContext")
            .field("config", &self.config)
            .field("hive_api", &self.offline.is_available())
            .field("virtual_roots", &lock(&self.virtual_roots).len())
            .field("link_cache", &self.link_cache_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_tree::VirtualRegistryKey;

    #[test]
    fn test_virtual_root_identity() {
        let ctx = RegistryContext::default();
        let a = Arc::new(VirtualRegistryData::new("a.reg", VirtualRegistryKey::default()));
        let twin = Arc::new(VirtualRegistryData::new("a.reg", VirtualRegistryKey::default()));

        ctx.register_virtual_root(a.clone());
        ctx.register_virtual_root(a.clone());
        assert_eq!(ctx.virtual_roots().len(), 1);
        assert!(ctx.is_virtual_root_registered(&a));
        assert!(!ctx.is_virtual_root_registered(&twin));

        assert!(!ctx.unregister_virtual_root(&twin));
        assert!(ctx.unregister_virtual_root(&a));
        assert!(ctx.virtual_roots().is_empty());
    }

    #[test]
    fn test_link_cache() {
        let ctx = RegistryContext::default();
        assert_eq!(ctx.cached_link("live:a"), None);
        ctx.cache_link("live:a".to_string(), None);
        ctx.cache_link("live:b".to_string(), Some("\\REGISTRY\\MACHINE".to_string()));
        assert_eq!(ctx.cached_link("live:a"), Some(None));
        assert_eq!(ctx.link_cache_len(), 2);
        ctx.clear_link_cache();
        assert_eq!(ctx.link_cache_len(), 0);
    }

    #[test]
    fn test_config_overrides() {
        let config = RegistryConfig::default()
            .with_current_user_sid("S-1-5-21-7")
            .with_active_control_set(2)
            .with_drive_map(vec![DriveMapping::new("C:", "\\Device\\HarddiskVolume3")]);
        let ctx = RegistryContext::new(config);
        assert_eq!(ctx.current_user_sid().as_deref(), Some("S-1-5-21-7"));
        assert_eq!(ctx.active_control_set(), Some(2));
        assert_eq!(ctx.drive_map().len(), 1);
    }

    #[test]
    fn test_hive_api_toggle() {
        let ctx = RegistryContext::new(RegistryConfig::default().with_hive_api(false));
        assert!(!ctx.offline().is_available());
        assert!(RegistryContext::default().offline().is_available());
    }
}
