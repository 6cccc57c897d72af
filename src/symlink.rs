//! Symbolic link resolution across hives.
//!
//! A registry link is a key created with the link option whose reserved
//! `SymbolicLinkValue` holds an NT path. Resolving an address walks its path
//! from the root, and at the shortest prefix that is a link substitutes the
//! link target and starts over. Targets under an offline hive's mount point
//! stay inside that hive.

use crate::dispatch::BackendDispatcher;
use crate::error::{RegistryError, Result};
use crate::path::{build_path, BackendRoot, NodeAddress};
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

/// Follows link chains through a dispatcher, caching per-key lookups in its context.
#[derive(Debug, Clone, Copy)]
pub struct SymbolicLinkResolver<'a> {
    dispatcher: &'a BackendDispatcher,
}

impl<'a> SymbolicLinkResolver<'a> {
    /// Creates a resolver.
    pub fn new(dispatcher: &'a BackendDispatcher) -> Self {
        Self { dispatcher }
    }

    fn cache_key(node: &NodeAddress) -> String {
        format!("{}:{}", node.root.tag(), node.path.folded())
    }

    /// Identity used for cycle detection: the canonical NT path when there is one.
    fn visit_key(&self, node: &NodeAddress) -> String {
        let normalizer = self.dispatcher.normalizer();
        let path = normalizer
            .nt_path(node)
            .map(|nt| normalizer.canonical_key(&nt))
            .unwrap_or_else(|| node.path.folded());
        format!("{}:{}", node.root.tag(), path)
    }

    /// Target of exactly this key, without looking at its ancestors.
    ///
    /// Hits and misses are both cached; any key mutation through the
    /// dispatcher clears the cache.
    pub fn link_target(&self, node: &NodeAddress) -> Result<Option<String>> {
        if matches!(node.root, BackendRoot::Virtual(_)) || node.is_root() {
            return Ok(None);
        }

        let ctx = self.dispatcher.context();
        let key = Self::cache_key(node);
        if let Some(hit) = ctx.cached_link(&key) {
            return Ok(hit);
        }

        let target = match self.dispatcher.try_query_symbolic_link_target(node) {
            Ok(target) => target,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        ctx.cache_link(key, target.clone());
        Ok(target)
    }

    fn map_target(&self, origin: &NodeAddress, target: &str) -> Result<NodeAddress> {
        let normalizer = self.dispatcher.normalizer();
        if let BackendRoot::Offline(hive) = origin.root {
            if let Some(node) = normalizer.address_in_hive(target, hive) {
                return Ok(node);
            }
        }
        normalizer
            .address_from_path(target)
            .ok_or_else(|| RegistryError::InvalidPath(format!("link target '{}' has no address", target)))
    }

    /// Shortest link prefix of `node`'s path and the address it redirects to.
    fn redirect(&self, node: &NodeAddress) -> Result<Option<NodeAddress>> {
        for len in 1..=node.path.len() {
            let prefix = node.with_path(node.path.prefix(len));
            if let Some(target) = self.link_target(&prefix)? {
                let dest = self.map_target(node, &target)?;
                let rest = node.path.suffix(len);
                debug!(from = %prefix, to = %target, "Following symbolic link");
                return Ok(Some(dest.with_path(dest.path.join_path(&rest))));
            }
        }
        Ok(None)
    }

    /// Address `node` ends up at once every link in its path is followed.
    ///
    /// # Errors
    ///
    /// `LinkCycle` when a chain revisits a key or exceeds the configured depth.
    #[instrument(skip(self), fields(node = %node))]
    pub fn resolve(&self, node: &NodeAddress) -> Result<NodeAddress> {
        let max_depth = self.dispatcher.context().config().max_link_depth;
        let mut current = node.clone();
        let mut visited = HashSet::new();
        visited.insert(self.visit_key(&current));

        let mut depth = 0;
        while let Some(next) = self.redirect(&current)? {
            depth += 1;
            if depth > max_depth || !visited.insert(self.visit_key(&next)) {
                let path = build_path(&next);
                warn!(%path, depth, "Symbolic link cycle");
                return Err(RegistryError::LinkCycle { path, depth });
            }
            current = next;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::value::ValueEntry;

    fn dispatcher(depth: usize) -> BackendDispatcher {
        BackendDispatcher::with_config(
            RegistryConfig::default()
                .with_current_user_sid("S-1-5-21-9")
                .with_max_link_depth(depth),
        )
    }

    #[test]
    fn test_follows_link_inside_mounted_hive() {
        let dispatcher = dispatcher(8);
        let root = dispatcher
            .create_offline_hive("SOFTWARE", Some("\\REGISTRY\\MACHINE\\SOFTWARE"))
            .unwrap();
        let real = root.child("Real").child("Sub");
        assert!(dispatcher.create_key(&real));
        assert!(dispatcher.set_value(&real, &ValueEntry::dword("x", 7)));
        assert!(dispatcher.create_link(&root.child("Alias"), "\\REGISTRY\\MACHINE\\SOFTWARE\\Real"));

        let resolved = dispatcher
            .try_resolve_links(&root.child("Alias").child("Sub"))
            .unwrap();
        assert_eq!(resolved.root, root.root);
        assert_eq!(resolved.path.to_string(), "Real\\Sub");
        assert!(dispatcher.query_value(&resolved, "x").is_some());
    }

    #[test]
    fn test_self_link_terminates() {
        let dispatcher = dispatcher(8);
        let root = dispatcher
            .create_offline_hive("SOFTWARE", Some("HKLM\\SOFTWARE"))
            .unwrap();
        assert!(dispatcher.create_link(&root.child("Loop"), "\\REGISTRY\\MACHINE\\SOFTWARE\\Loop"));

        let err = dispatcher
            .try_resolve_links(&root.child("Loop").child("Deeper"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::LinkCycle { depth: 1, .. }));
        assert!(dispatcher.resolve_links(&root.child("Loop")).is_none());
    }

    #[test]
    fn test_depth_bound() {
        let dispatcher = dispatcher(2);
        let root = dispatcher
            .create_offline_hive("SOFTWARE", Some("HKLM\\SOFTWARE"))
            .unwrap();
        assert!(dispatcher.create_key(&root.child("End")));
        for (from, to) in [("A", "B"), ("B", "C"), ("C", "End")] {
            let target = format!("\\REGISTRY\\MACHINE\\SOFTWARE\\{}", to);
            assert!(dispatcher.create_link(&root.child(from), &target));
        }

        assert!(matches!(
            dispatcher.try_resolve_links(&root.child("A")),
            Err(RegistryError::LinkCycle { .. })
        ));
        assert_eq!(
            dispatcher.try_resolve_links(&root.child("B")).unwrap().path.to_string(),
            "End"
        );
    }

    #[test]
    fn test_lookups_are_cached() {
        let dispatcher = dispatcher(8);
        let root = dispatcher.create_offline_hive("Plain", None).unwrap();
        let key = root.child("A").child("B");
        assert!(dispatcher.create_key(&key));

        let resolved = dispatcher.try_resolve_links(&key).unwrap();
        assert_eq!(resolved, key);
        assert_eq!(dispatcher.context().link_cache_len(), 2);

        assert!(dispatcher.delete_key(&key));
        assert_eq!(dispatcher.context().link_cache_len(), 0);
    }

    #[test]
    fn test_virtual_nodes_never_redirect() {
        let dispatcher = dispatcher(8);
        let data = std::sync::Arc::new(crate::virtual_tree::VirtualRegistryData::new(
            "v.reg",
            crate::virtual_tree::VirtualRegistryKey::default(),
        ));
        let root = dispatcher.register_virtual_root(data);
        assert!(dispatcher.create_key(&root.child("K")));
        assert_eq!(dispatcher.try_resolve_links(&root.child("K")).unwrap(), root.child("K"));
    }
}
