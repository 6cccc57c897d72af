//! Path canonicalization.
//!
//! The same key can be spelled many ways: `HKLM` or `HKEY_LOCAL_MACHINE`,
//! `\REGISTRY\MACHINE\...`, `ControlSet001` or `CurrentControlSet`, or as a
//! bracketed export-file header. [`PathNormalizer`] maps all of them onto one
//! logical form so paths can be compared and turned into [`NodeAddress`]es.
//!
//! Canonical form:
//!
//! - full predefined root names (`HKEY_CLASSES_ROOT`, never `HKCR`)
//! - logical roots in place of NT paths wherever a mapping exists
//! - `CurrentControlSet` in place of the active `ControlSetNNN`
//! - single backslash separators, no trailing separator

use crate::context::RegistryContext;
use crate::offline::OfflineHiveHandle;
use crate::path::{build_live_nt_path, BackendRoot, KeyPath, NodeAddress, PredefinedKey};
use crate::utils::{fold_case, names_equal};

const REGISTRY: &str = "REGISTRY";
const CURRENT_CONTROL_SET: &str = "CurrentControlSet";
const CONTROL_SET_PREFIX: &str = "ControlSet";
const CLASSES_SUFFIX: &str = "_Classes";

/// Canonicalizes registry paths against the host facts in a context.
#[derive(Debug, Clone, Copy)]
pub struct PathNormalizer<'a> {
    ctx: &'a RegistryContext,
}

/// Leading-backslash flag plus segments.
fn split(path: &str) -> (bool, Vec<String>) {
    let nt = path.starts_with('\\');
    let segments = path
        .split('\\')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (nt, segments)
}

fn rejoin(nt: bool, segments: &[String]) -> String {
    let joined = segments.join("\\");
    if nt {
        format!("\\{}", joined)
    } else {
        joined
    }
}

fn join_under(prefix: &str, rest: &[String]) -> String {
    if rest.is_empty() {
        prefix.to_string()
    } else {
        format!("{}\\{}", prefix, rest.join("\\"))
    }
}

fn starts_with(segments: &[String], prefix: &[&str]) -> bool {
    segments.len() >= prefix.len() && prefix.iter().zip(segments).all(|(p, s)| names_equal(p, s))
}

/// Number in a `ControlSetNNN` segment.
fn control_set_number(segment: &str) -> Option<u32> {
    let head = segment.get(..CONTROL_SET_PREFIX.len())?;
    let digits = &segment[CONTROL_SET_PREFIX.len()..];
    if !head.eq_ignore_ascii_case(CONTROL_SET_PREFIX)
        || digits.is_empty()
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    digits.parse().ok()
}

fn strip_prefix_ignore_case<'s>(s: &'s str, prefix: &str) -> Option<&'s str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

impl<'a> PathNormalizer<'a> {
    /// Creates a normalizer over a context.
    pub fn new(ctx: &'a RegistryContext) -> Self {
        Self { ctx }
    }

    /// Strips export-header decoration and redundant separators.
    ///
    /// ```rust
    /// # use unireg::normalize::PathNormalizer;
    /// assert_eq!(PathNormalizer::clean("[-HKLM\\\\Software\\]"), "HKLM\\Software");
    /// assert_eq!(PathNormalizer::clean("\"\\REGISTRY\\MACHINE\""), "\\REGISTRY\\MACHINE");
    /// ```
    pub fn clean(path: &str) -> String {
        let mut s = path.trim();
        if let Some(inner) = s.strip_prefix('[') {
            s = inner.strip_suffix(']').unwrap_or(inner).trim();
            s = s.strip_prefix('-').unwrap_or(s).trim_start();
        }
        if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
            s = &s[1..s.len() - 1];
        }
        let (nt, segments) = split(s);
        rejoin(nt, &segments)
    }

    /// Replaces a short root alias with the full name and drops a leading
    /// `Computer` segment.
    pub fn expand_root_alias(&self, path: &str) -> String {
        let (nt, mut segments) = split(&Self::clean(path));
        if nt {
            return rejoin(nt, &segments);
        }
        if segments.len() > 1
            && segments[0].eq_ignore_ascii_case("Computer")
            && PredefinedKey::from_name(&segments[1]).is_some()
        {
            segments.remove(0);
        }
        if let Some(root) = segments.first().and_then(|s| PredefinedKey::from_name(s)) {
            segments[0] = root.full_name().to_string();
        }
        rejoin(nt, &segments)
    }

    fn fold_segments(&self, segments: &mut [String]) {
        let Some(active) = self.ctx.active_control_set() else {
            return;
        };
        for i in 1..segments.len() {
            if names_equal(&segments[i - 1], "SYSTEM") && control_set_number(&segments[i]) == Some(active) {
                segments[i] = CURRENT_CONTROL_SET.to_string();
            }
        }
    }

    /// Replaces the active `ControlSetNNN` segment with `CurrentControlSet`.
    pub fn fold_control_set(&self, path: &str) -> String {
        let (nt, mut segments) = split(path);
        self.fold_segments(&mut segments);
        rejoin(nt, &segments)
    }

    /// Replaces `CurrentControlSet` with the active numbered set, for hives
    /// where the alias does not exist.
    pub fn expand_control_set(&self, path: &str) -> String {
        let (nt, mut segments) = split(path);
        if let Some(active) = self.ctx.active_control_set() {
            for i in 1..segments.len() {
                if names_equal(&segments[i - 1], "SYSTEM") && names_equal(&segments[i], CURRENT_CONTROL_SET) {
                    segments[i] = format!("{}{:03}", CONTROL_SET_PREFIX, active);
                }
            }
        }
        rejoin(nt, &segments)
    }

    /// Maps an NT path (`\REGISTRY\...`) to its logical form.
    ///
    /// Returns `None` for paths outside `\REGISTRY` and for native paths with
    /// no logical counterpart (e.g. `\REGISTRY` itself).
    pub fn to_logical(&self, nt_path: &str) -> Option<String> {
        let (nt, segments) = split(&Self::clean(nt_path));
        if !nt || !segments.first().is_some_and(|s| names_equal(s, REGISTRY)) {
            return None;
        }
        let mut rest = segments[1..].to_vec();
        self.fold_segments(&mut rest);

        if starts_with(&rest, &["MACHINE", "SOFTWARE", "Classes"]) {
            return Some(join_under(PredefinedKey::ClassesRoot.full_name(), &rest[3..]));
        }
        if starts_with(
            &rest,
            &["MACHINE", "SYSTEM", CURRENT_CONTROL_SET, "Hardware Profiles", "Current"],
        ) {
            return Some(join_under(PredefinedKey::CurrentConfig.full_name(), &rest[5..]));
        }
        if starts_with(&rest, &["MACHINE"]) {
            return Some(join_under(PredefinedKey::LocalMachine.full_name(), &rest[1..]));
        }
        if starts_with(&rest, &["USER"]) {
            if let (Some(sid), Some(hive)) = (self.ctx.current_user_sid(), rest.get(1)) {
                if names_equal(hive, &sid) {
                    return Some(join_under(PredefinedKey::CurrentUser.full_name(), &rest[2..]));
                }
                if names_equal(hive, &format!("{}{}", sid, CLASSES_SUFFIX)) {
                    let classes = format!("{}\\Software\\Classes", PredefinedKey::CurrentUser.full_name());
                    return Some(join_under(&classes, &rest[2..]));
                }
            }
            return Some(join_under(PredefinedKey::Users.full_name(), &rest[1..]));
        }
        None
    }

    /// Maps a logical path to its NT form. NT paths pass through cleaned.
    ///
    /// Returns `None` for unknown roots and for `HKEY_CURRENT_USER` when the
    /// user's SID is unknown.
    pub fn to_nt(&self, path: &str) -> Option<String> {
        let cleaned = self.expand_root_alias(path);
        let (nt, segments) = split(&cleaned);
        if nt {
            return segments
                .first()
                .is_some_and(|s| names_equal(s, REGISTRY))
                .then_some(cleaned);
        }
        let root = PredefinedKey::from_name(segments.first()?)?;
        let prefix = root.nt_prefix(self.ctx.current_user_sid().as_deref())?;
        Some(join_under(&prefix, &segments[1..]))
    }

    /// Rewrites a `\Device\...` or `\??\` path with its drive letter.
    pub fn resolve_device_path(&self, path: &str) -> String {
        let cleaned = Self::clean(path);
        if let Some(rest) = strip_prefix_ignore_case(&cleaned, "\\??\\") {
            return rest.to_string();
        }

        let best = self
            .ctx
            .drive_map()
            .iter()
            .map(|m| (m, m.device.trim_end_matches('\\')))
            .filter(|(_, device)| {
                strip_prefix_ignore_case(&cleaned, device)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('\\'))
            })
            .max_by_key(|(_, device)| device.len());

        match best {
            Some((mapping, device)) => format!("{}{}", mapping.drive, &cleaned[device.len()..]),
            None => cleaned,
        }
    }

    /// Canonical spelling of a path; see the module docs.
    pub fn canonical(&self, path: &str) -> String {
        let cleaned = self.expand_root_alias(path);
        let (nt, segments) = split(&cleaned);
        if nt {
            if segments.first().is_some_and(|s| names_equal(s, REGISTRY)) {
                return self
                    .to_logical(&cleaned)
                    .unwrap_or_else(|| self.fold_control_set(&cleaned));
            }
            return self.resolve_device_path(&cleaned);
        }

        if segments.first().and_then(|s| PredefinedKey::from_name(s)).is_none() {
            return cleaned;
        }
        self.to_nt(&cleaned)
            .and_then(|nt| self.to_logical(&nt))
            .unwrap_or_else(|| self.fold_control_set(&cleaned))
    }

    /// Lowercased canonical form, for equality and map keys.
    pub fn canonical_key(&self, path: &str) -> String {
        fold_case(&self.canonical(path))
    }

    /// True if both spellings name the same key.
    pub fn paths_equal(&self, a: &str, b: &str) -> bool {
        self.canonical_key(a) == self.canonical_key(b)
    }

    /// Live address for a path string.
    ///
    /// Native paths with no logical counterpart land in the synthetic
    /// `\REGISTRY` namespace.
    pub fn address_from_path(&self, path: &str) -> Option<NodeAddress> {
        let canonical = self.canonical(path);
        let (nt, segments) = split(&canonical);
        if nt {
            return segments
                .first()
                .is_some_and(|s| names_equal(s, REGISTRY))
                .then(|| NodeAddress::native(&segments[1..].join("\\")));
        }
        let root = PredefinedKey::from_name(segments.first()?)?;
        Some(NodeAddress::new(
            BackendRoot::Live(Some(root)),
            KeyPath::from_segments(segments[1..].iter().cloned()),
        ))
    }

    /// Address inside an offline hive for a path under its mount point.
    pub fn address_in_hive(&self, path: &str, hive: OfflineHiveHandle) -> Option<NodeAddress> {
        let root = self.ctx.offline().root(hive)?;
        let mount = self.to_nt(root.mount_point.as_deref()?)?;
        let (_, mount_segments) = split(&mount);
        let (_, target) = split(&self.to_nt(path)?);

        let prefix: Vec<&str> = mount_segments.iter().map(String::as_str).collect();
        if !starts_with(&target, &prefix) {
            return None;
        }
        let rest = KeyPath::from_segments(target[prefix.len()..].iter().cloned());
        Some(NodeAddress::new(BackendRoot::Offline(hive), rest).named(root.root_name))
    }

    /// NT path of a node; offline nodes need a mount point, virtual nodes have none.
    pub fn nt_path(&self, node: &NodeAddress) -> Option<String> {
        match &node.root {
            BackendRoot::Live(_) => build_live_nt_path(node, self.ctx.current_user_sid().as_deref()),
            BackendRoot::Offline(hive) => {
                let mount = self.ctx.offline().root(*hive)?.mount_point?;
                let base = self.to_nt(&mount)?;
                Some(join_under(&base, node.path.segments()))
            }
            BackendRoot::Virtual(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriveMapping, RegistryConfig};

    const SID: &str = "S-1-5-21-1000";

    fn context() -> RegistryContext {
        RegistryContext::new(
            RegistryConfig::default()
                .with_current_user_sid(SID)
                .with_active_control_set(1)
                .with_drive_map(vec![
                    DriveMapping::new("C:", "\\Device\\HarddiskVolume3"),
                    DriveMapping::new("D:", "\\Device\\HarddiskVolume30"),
                ]),
        )
    }

    #[test]
    fn test_clean() {
        assert_eq!(PathNormalizer::clean("  HKLM\\\\SOFTWARE\\\\ "), "HKLM\\SOFTWARE");
        assert_eq!(PathNormalizer::clean("[HKEY_USERS\\.DEFAULT]"), "HKEY_USERS\\.DEFAULT");
        assert_eq!(PathNormalizer::clean("\\REGISTRY\\\\USER\\"), "\\REGISTRY\\USER");
    }

    #[test]
    fn test_aliases() {
        let ctx = context();
        let n = PathNormalizer::new(&ctx);
        assert_eq!(n.expand_root_alias("hkcu\\Console"), "HKEY_CURRENT_USER\\Console");
        assert_eq!(
            n.expand_root_alias("Computer\\HKLM\\SYSTEM"),
            "HKEY_LOCAL_MACHINE\\SYSTEM"
        );
        assert_eq!(n.expand_root_alias("Software\\Foo"), "Software\\Foo");
    }

    #[test]
    fn test_nt_to_logical() {
        let ctx = context();
        let n = PathNormalizer::new(&ctx);
        assert_eq!(
            n.to_logical("\\REGISTRY\\MACHINE\\SOFTWARE\\Classes\\.txt").as_deref(),
            Some("HKEY_CLASSES_ROOT\\.txt")
        );
        assert_eq!(
            n.to_logical("\\REGISTRY\\USER\\S-1-5-21-1000\\Console").as_deref(),
            Some("HKEY_CURRENT_USER\\Console")
        );
        assert_eq!(
            n.to_logical("\\REGISTRY\\USER\\S-1-5-21-1000_Classes\\CLSID").as_deref(),
            Some("HKEY_CURRENT_USER\\Software\\Classes\\CLSID")
        );
        assert_eq!(
            n.to_logical("\\REGISTRY\\USER\\.DEFAULT").as_deref(),
            Some("HKEY_USERS\\.DEFAULT")
        );
        assert_eq!(
            n.to_logical("\\REGISTRY\\MACHINE\\SYSTEM\\ControlSet001\\Hardware Profiles\\Current\\Software")
                .as_deref(),
            Some("HKEY_CURRENT_CONFIG\\Software")
        );
        assert_eq!(n.to_logical("\\REGISTRY"), None);
        assert_eq!(n.to_logical("HKLM\\SOFTWARE"), None);
    }

    #[test]
    fn test_logical_to_nt() {
        let ctx = context();
        let n = PathNormalizer::new(&ctx);
        assert_eq!(
            n.to_nt("HKCU\\Console").as_deref(),
            Some("\\REGISTRY\\USER\\S-1-5-21-1000\\Console")
        );
        assert_eq!(n.to_nt("HKLM").as_deref(), Some("\\REGISTRY\\MACHINE"));
        assert_eq!(n.to_nt("Nope\\Key"), None);

        let anonymous = RegistryContext::new(RegistryConfig::default().with_hive_api(false));
        let n = PathNormalizer::new(&anonymous);
        if anonymous.current_user_sid().is_none() {
            assert_eq!(n.to_nt("HKCU\\Console"), None);
        }
    }

    #[test]
    fn test_control_set_folding() {
        let ctx = context();
        let n = PathNormalizer::new(&ctx);
        assert!(n.paths_equal(
            "HKLM\\SYSTEM\\CurrentControlSet\\Services",
            "HKEY_LOCAL_MACHINE\\SYSTEM\\ControlSet001\\Services"
        ));
        assert!(!n.paths_equal(
            "HKLM\\SYSTEM\\CurrentControlSet\\Services",
            "HKLM\\SYSTEM\\ControlSet002\\Services"
        ));
        assert_eq!(
            n.expand_control_set("HKEY_LOCAL_MACHINE\\SYSTEM\\CurrentControlSet\\Control"),
            "HKEY_LOCAL_MACHINE\\SYSTEM\\ControlSet001\\Control"
        );
    }

    #[test]
    fn test_canonical_forms_agree() {
        let ctx = context();
        let n = PathNormalizer::new(&ctx);
        assert!(n.paths_equal("HKU\\S-1-5-21-1000\\Environment", "hkcu\\environment"));
        assert!(n.paths_equal("HKLM\\SOFTWARE\\Classes\\.reg", "HKCR\\.reg"));
        assert!(n.paths_equal("[-HKEY_CLASSES_ROOT\\.reg]", "\\REGISTRY\\MACHINE\\SOFTWARE\\Classes\\.reg"));
        assert_eq!(n.canonical("Relative\\Path\\"), "Relative\\Path");
    }

    #[test]
    fn test_device_paths() {
        let ctx = context();
        let n = PathNormalizer::new(&ctx);
        assert_eq!(
            n.resolve_device_path("\\Device\\HarddiskVolume3\\Windows\\System32\\config\\SYSTEM"),
            "C:\\Windows\\System32\\config\\SYSTEM"
        );
        assert_eq!(
            n.resolve_device_path("\\Device\\HarddiskVolume30\\data.hiv"),
            "D:\\data.hiv"
        );
        assert_eq!(n.resolve_device_path("\\??\\C:\\hive"), "C:\\hive");
        assert_eq!(n.resolve_device_path("\\Device\\Floppy0\\x"), "\\Device\\Floppy0\\x");
    }

    #[test]
    fn test_address_from_path() {
        let ctx = context();
        let n = PathNormalizer::new(&ctx);
        let node = n.address_from_path("\\REGISTRY\\MACHINE\\SOFTWARE\\Microsoft").unwrap();
        assert_eq!(node, NodeAddress::live_path(PredefinedKey::LocalMachine, "SOFTWARE\\Microsoft"));

        let native = n.address_from_path("\\REGISTRY\\A\\B").unwrap();
        assert_eq!(native, NodeAddress::native("A\\B"));
        assert!(n.address_from_path("NotARoot\\x").is_none());
    }

    #[test]
    fn test_offline_mount_mapping() {
        let ctx = context();
        let hive = ctx
            .offline()
            .create("SOFTWARE", Some("HKLM\\SOFTWARE"))
            .unwrap();
        let n = PathNormalizer::new(&ctx);

        let node = n
            .address_in_hive("\\REGISTRY\\MACHINE\\SOFTWARE\\Vendor\\App", hive)
            .unwrap();
        assert_eq!(node.root, BackendRoot::Offline(hive));
        assert_eq!(node.path.to_string(), "Vendor\\App");
        assert_eq!(node.root_name, "SOFTWARE");
        assert!(n.address_in_hive("\\REGISTRY\\MACHINE\\SYSTEM", hive).is_none());

        assert_eq!(
            n.nt_path(&node).as_deref(),
            Some("\\REGISTRY\\MACHINE\\SOFTWARE\\Vendor\\App")
        );
    }
}
