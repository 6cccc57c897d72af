//! Configuration for a [`RegistryContext`](crate::context::RegistryContext).

/// Default bound on symbolic link redirections.
pub const DEFAULT_MAX_LINK_DEPTH: usize = 8;

/// Default number of undo entries kept.
pub const DEFAULT_UNDO_LIMIT: usize = 1000;

/// Maps a DOS drive to its NT device name, e.g. `C:` to `\Device\HarddiskVolume3`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriveMapping {
    /// Drive letter with colon, e.g. `C:`.
    pub drive: String,
    /// NT device path, e.g. `\Device\HarddiskVolume3`.
    pub device: String,
}

impl DriveMapping {
    /// Creates a drive mapping.
    pub fn new(drive: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            drive: drive.into(),
            device: device.into(),
        }
    }
}

/// Settings resolved once when a context is built.
///
/// Values left at `None` are discovered from the host on first use (Windows
/// only); overrides make behavior deterministic elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegistryConfig {
    /// SID string of the current user; maps `\REGISTRY\USER\<sid>` to HKCU.
    pub current_user_sid: Option<String>,
    /// Active control set number (the `NNN` in `ControlSetNNN`).
    pub active_control_set: Option<u32>,
    /// Drive letter to device name table.
    pub drive_map: Option<Vec<DriveMapping>>,
    /// Maximum symbolic link redirections before giving up.
    pub max_link_depth: usize,
    /// Whether to load the built-in hive API for offline hives.
    pub enable_hive_api: bool,
    /// Maximum number of undo entries kept.
    pub undo_limit: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            current_user_sid: None,
            active_control_set: None,
            drive_map: None,
            max_link_depth: DEFAULT_MAX_LINK_DEPTH,
            enable_hive_api: true,
            undo_limit: DEFAULT_UNDO_LIMIT,
        }
    }
}

impl RegistryConfig {
    /// Sets the current user SID.
    pub fn with_current_user_sid(mut self, sid: impl Into<String>) -> Self {
        self.current_user_sid = Some(sid.into());
        self
    }

    /// Sets the active control set number.
    pub fn with_active_control_set(mut self, number: u32) -> Self {
        self.active_control_set = Some(number);
        self
    }

    /// Sets the drive map.
    pub fn with_drive_map(mut self, map: Vec<DriveMapping>) -> Self {
        self.drive_map = Some(map);
        self
    }

    /// Sets the maximum link depth (at least 1).
    pub fn with_max_link_depth(mut self, depth: usize) -> Self {
        self.max_link_depth = depth.max(1);
        self
    }

    /// Enables or disables the built-in hive API.
    pub fn with_hive_api(mut self, enabled: bool) -> Self {
        self.enable_hive_api = enabled;
        self
    }

    /// Sets the undo history limit (at least 1).
    pub fn with_undo_limit(mut self, limit: usize) -> Self {
        self.undo_limit = limit.max(1);
        self
    }
}
