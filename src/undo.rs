//! Undo and redo for mutations made through a dispatcher.
//!
//! Every logged mutation records enough to perform its opposite: key deletes
//! keep a full snapshot of the removed subtree, value edits keep the value as
//! it was before and after. Undoing a key creation snapshots the key at that
//! moment so redo brings back exactly what was removed.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use unireg::{BackendDispatcher, UndoableOperationLog, ValueEntry, VirtualRegistryData, VirtualRegistryKey};
//!
//! let dispatcher = BackendDispatcher::default();
//! let root = dispatcher.register_virtual_root(Arc::new(VirtualRegistryData::new(
//!     "edit.reg",
//!     VirtualRegistryKey::default(),
//! )));
//! let mut log = UndoableOperationLog::for_dispatcher(&dispatcher);
//!
//! log.set_value(&dispatcher, &root, &ValueEntry::dword("Count", 1)).unwrap();
//! log.set_value(&dispatcher, &root, &ValueEntry::dword("Count", 2)).unwrap();
//! assert!(log.undo(&dispatcher).unwrap());
//! assert_eq!(dispatcher.query_value(&root, "Count").unwrap().data, 1u32.to_le_bytes());
//! ```

use crate::dispatch::BackendDispatcher;
use crate::error::{RegistryError, Result};
use crate::path::NodeAddress;
use crate::utils::fold_case;
use crate::value::{ValueEntry, SYMBOLIC_LINK_VALUE};
use std::collections::VecDeque;
use tracing::debug;

/// Recursive copy of a key: values, children and link target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySnapshot {
    /// Key name.
    pub name: String,
    /// NT target when the key is a symbolic link.
    pub link_target: Option<String>,
    /// Values ordered by case-folded name.
    pub values: Vec<ValueEntry>,
    /// Children ordered by case-folded name.
    pub children: Vec<KeySnapshot>,
}

impl KeySnapshot {
    /// Reads the subtree at `node`.
    pub fn capture(dispatcher: &BackendDispatcher, node: &NodeAddress) -> Result<Self> {
        let link_target = dispatcher.try_query_symbolic_link_target(node)?;

        let mut values = dispatcher.try_enumerate_values(node)?;
        if link_target.is_some() {
            values.retain(|v| !v.has_name(SYMBOLIC_LINK_VALUE));
        }
        values.sort_by_key(|v| fold_case(&v.name));

        let mut children = Vec::new();
        if link_target.is_none() {
            for name in dispatcher.try_enumerate_subkey_names(node, true)? {
                children.push(Self::capture(dispatcher, &node.child(&name))?);
            }
        }

        Ok(Self {
            name: node.name().to_string(),
            link_target,
            values,
            children,
        })
    }

    /// Recreates the subtree at `node`.
    pub fn restore(&self, dispatcher: &BackendDispatcher, node: &NodeAddress) -> Result<()> {
        match &self.link_target {
            Some(target) => dispatcher.try_create_link(node, target)?,
            None => dispatcher.try_create_key(node)?,
        }
        for value in &self.values {
            dispatcher.try_set_value(node, value)?;
        }
        for child in &self.children {
            child.restore(dispatcher, &node.child(&child.name))?;
        }
        Ok(())
    }

    /// Number of keys in the snapshot, itself included.
    pub fn key_count(&self) -> usize {
        1 + self.children.iter().map(KeySnapshot::key_count).sum::<usize>()
    }
}

/// One reversible mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOperation {
    /// A key (and whatever was below it by undo time) was created.
    CreateKey {
        /// Topmost key the creation added.
        node: NodeAddress,
        /// Subtree as it was when last undone.
        snapshot: Option<KeySnapshot>,
    },
    /// A key was deleted with its subtree.
    DeleteKey {
        /// Deleted key.
        node: NodeAddress,
        /// Subtree as it was before deletion.
        snapshot: KeySnapshot,
    },
    /// A key was renamed; `node` carries the old name.
    RenameKey {
        /// Address under the old name.
        node: NodeAddress,
        /// Name before.
        old_name: String,
        /// Name after.
        new_name: String,
    },
    /// A value was renamed.
    RenameValue {
        /// Owning key.
        node: NodeAddress,
        /// Name before.
        old_name: String,
        /// Name after.
        new_name: String,
    },
    /// A value was created (`before` empty), deleted (`after` empty) or modified.
    ValueChange {
        /// Owning key.
        node: NodeAddress,
        /// Value before the change.
        before: Option<ValueEntry>,
        /// Value after the change.
        after: Option<ValueEntry>,
    },
}

/// Puts a value back to `target`, or removes it when `target` is empty.
fn apply_value(
    log: &mut UndoableOperationLog,
    dispatcher: &BackendDispatcher,
    node: &NodeAddress,
    target: &Option<ValueEntry>,
    other: &Option<ValueEntry>,
) -> Result<()> {
    match (target, other) {
        (Some(value), _) => log.set_value(dispatcher, node, value),
        (None, Some(current)) => log.delete_value(dispatcher, node, &current.name),
        (None, None) => Ok(()),
    }
}

impl UndoOperation {
    fn undo(&mut self, log: &mut UndoableOperationLog, dispatcher: &BackendDispatcher) -> Result<()> {
        match self {
            UndoOperation::CreateKey { node, snapshot } => {
                *snapshot = Some(log.capture_and_delete(dispatcher, node)?);
                Ok(())
            }
            UndoOperation::DeleteKey { node, snapshot } => snapshot.restore(dispatcher, node),
            UndoOperation::RenameKey {
                node,
                old_name,
                new_name,
            } => {
                let renamed = node.with_path(node.path.with_name(new_name));
                log.rename_key(dispatcher, &renamed, old_name)
            }
            UndoOperation::RenameValue {
                node,
                old_name,
                new_name,
            } => log.rename_value(dispatcher, node, new_name, old_name),
            UndoOperation::ValueChange { node, before, after } => apply_value(log, dispatcher, node, before, after),
        }
    }

    fn redo(&mut self, log: &mut UndoableOperationLog, dispatcher: &BackendDispatcher) -> Result<()> {
        match self {
            UndoOperation::CreateKey { node, snapshot } => match snapshot {
                Some(snapshot) => snapshot.restore(dispatcher, node),
                None => log.create_key(dispatcher, node),
            },
            UndoOperation::DeleteKey { node, snapshot } => {
                *snapshot = log.capture_and_delete(dispatcher, node)?;
                Ok(())
            }
            UndoOperation::RenameKey { node, new_name, .. } => log.rename_key(dispatcher, node, new_name),
            UndoOperation::RenameValue {
                node,
                old_name,
                new_name,
            } => log.rename_value(dispatcher, node, old_name, new_name),
            UndoOperation::ValueChange { node, before, after } => apply_value(log, dispatcher, node, after, before),
        }
    }
}

/// Bounded undo and redo stacks.
#[derive(Debug, Clone)]
pub struct UndoableOperationLog {
    undo: VecDeque<UndoOperation>,
    redo: Vec<UndoOperation>,
    limit: usize,
    replaying: bool,
}

impl UndoableOperationLog {
    /// Empty log keeping at most `limit` entries.
    pub fn new(limit: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            limit: limit.max(1),
            replaying: false,
        }
    }

    /// Empty log sized by the dispatcher's configured history limit.
    pub fn for_dispatcher(dispatcher: &BackendDispatcher) -> Self {
        Self::new(dispatcher.context().config().undo_limit)
    }

    /// Records an operation and clears the redo stack.
    ///
    /// Ignored while an undo or redo is being applied.
    pub fn push(&mut self, operation: UndoOperation) {
        if self.replaying {
            debug!("Not logging an operation made during replay");
            return;
        }
        self.undo.push_back(operation);
        while self.undo.len() > self.limit {
            self.undo.pop_front();
        }
        self.redo.clear();
    }

    /// True while undo or redo is running.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// True if there is something to undo.
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    /// True if there is something to redo.
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Entries available to undo.
    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    /// Entries available to redo.
    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// Next operation `undo` would reverse.
    pub fn peek_undo(&self) -> Option<&UndoOperation> {
        self.undo.back()
    }

    /// Forgets both stacks.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    /// Reverses the latest operation; `Ok(false)` when there is none.
    ///
    /// A failed undo leaves the entry on the undo stack.
    pub fn undo(&mut self, dispatcher: &BackendDispatcher) -> Result<bool> {
        let Some(mut operation) = self.undo.pop_back() else {
            return Ok(false);
        };
        self.replaying = true;
        let result = operation.undo(self, dispatcher);
        self.replaying = false;

        match result {
            Ok(()) => {
                self.redo.push(operation);
                Ok(true)
            }
            Err(e) => {
                self.undo.push_back(operation);
                Err(e)
            }
        }
    }

    /// Re-applies the latest undone operation; `Ok(false)` when there is none.
    pub fn redo(&mut self, dispatcher: &BackendDispatcher) -> Result<bool> {
        let Some(mut operation) = self.redo.pop() else {
            return Ok(false);
        };
        self.replaying = true;
        let result = operation.redo(self, dispatcher);
        self.replaying = false;

        match result {
            Ok(()) => {
                self.undo.push_back(operation);
                Ok(true)
            }
            Err(e) => {
                self.redo.push(operation);
                Err(e)
            }
        }
    }

    /// Creates a key and logs the topmost key that did not exist before.
    pub fn create_key(&mut self, dispatcher: &BackendDispatcher, node: &NodeAddress) -> Result<()> {
        let mut topmost = None;
        let mut cursor = Some(node.clone());
        while let Some(current) = cursor {
            if dispatcher.key_exists(&current) {
                break;
            }
            cursor = current.parent();
            topmost = Some(current);
        }

        dispatcher.try_create_key(node)?;
        if let Some(created) = topmost {
            self.push(UndoOperation::CreateKey {
                node: created,
                snapshot: None,
            });
        }
        Ok(())
    }

    /// Deletes a key after snapshotting its subtree.
    pub fn delete_key(&mut self, dispatcher: &BackendDispatcher, node: &NodeAddress) -> Result<()> {
        self.capture_and_delete(dispatcher, node).map(|_| ())
    }

    fn capture_and_delete(&mut self, dispatcher: &BackendDispatcher, node: &NodeAddress) -> Result<KeySnapshot> {
        let snapshot = KeySnapshot::capture(dispatcher, node)?;
        dispatcher.try_delete_key(node)?;
        self.push(UndoOperation::DeleteKey {
            node: node.clone(),
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Renames a key.
    pub fn rename_key(&mut self, dispatcher: &BackendDispatcher, node: &NodeAddress, new_name: &str) -> Result<()> {
        let old_name = node
            .path
            .name()
            .ok_or_else(|| RegistryError::InvalidPath("cannot rename a backend root".to_string()))?
            .to_string();
        dispatcher.try_rename_key(node, new_name)?;
        self.push(UndoOperation::RenameKey {
            node: node.clone(),
            old_name,
            new_name: new_name.to_string(),
        });
        Ok(())
    }

    fn current_value(dispatcher: &BackendDispatcher, node: &NodeAddress, name: &str) -> Result<Option<ValueEntry>> {
        match dispatcher.try_query_value(node, name) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Creates or replaces a value.
    pub fn set_value(&mut self, dispatcher: &BackendDispatcher, node: &NodeAddress, value: &ValueEntry) -> Result<()> {
        let before = Self::current_value(dispatcher, node, &value.name)?;
        dispatcher.try_set_value(node, value)?;
        self.push(UndoOperation::ValueChange {
            node: node.clone(),
            before,
            after: Some(value.clone()),
        });
        Ok(())
    }

    /// Deletes a value.
    pub fn delete_value(&mut self, dispatcher: &BackendDispatcher, node: &NodeAddress, name: &str) -> Result<()> {
        let before = dispatcher.try_query_value(node, name)?;
        dispatcher.try_delete_value(node, name)?;
        self.push(UndoOperation::ValueChange {
            node: node.clone(),
            before: Some(before),
            after: None,
        });
        Ok(())
    }

    /// Renames a value.
    pub fn rename_value(&mut self, dispatcher: &BackendDispatcher, node: &NodeAddress, old: &str, new: &str) -> Result<()> {
        dispatcher.try_rename_value(node, old, new)?;
        self.push(UndoOperation::RenameValue {
            node: node.clone(),
            old_name: old.to_string(),
            new_name: new.to_string(),
        });
        Ok(())
    }
}

impl Default for UndoableOperationLog {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_UNDO_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_tree::{VirtualRegistryData, VirtualRegistryKey};
    use std::sync::Arc;

    fn setup() -> (BackendDispatcher, NodeAddress) {
        let dispatcher = BackendDispatcher::default();
        let data = Arc::new(VirtualRegistryData::new("u.reg", VirtualRegistryKey::default()));
        let root = dispatcher.register_virtual_root(data);
        (dispatcher, root)
    }

    #[test]
    fn test_create_key_undo_redo() {
        let (dispatcher, root) = setup();
        let mut log = UndoableOperationLog::default();
        let deep = root.child("A").child("B").child("C");

        log.create_key(&dispatcher, &deep).unwrap();
        assert!(matches!(log.peek_undo(), Some(UndoOperation::CreateKey { node, .. }) if node.path.to_string() == "A"));
        assert!(dispatcher.set_value(&deep, &ValueEntry::string("Note", "added later")));
        let before = KeySnapshot::capture(&dispatcher, &root.child("A")).unwrap();

        assert!(log.undo(&dispatcher).unwrap());
        assert!(!dispatcher.key_exists(&root.child("A")));

        assert!(log.redo(&dispatcher).unwrap());
        let after = KeySnapshot::capture(&dispatcher, &root.child("A")).unwrap();
        assert_eq!(before, after);
        assert_eq!(after.key_count(), 3);
    }

    #[test]
    fn test_delete_key_restores_subtree() {
        let (dispatcher, root) = setup();
        let key = root.child("Tree");
        assert!(dispatcher.create_key(&key.child("Leaf")));
        assert!(dispatcher.set_value(&key.child("Leaf"), &ValueEntry::binary("b", &[9, 8, 7])));
        let before = KeySnapshot::capture(&dispatcher, &key).unwrap();

        let mut log = UndoableOperationLog::default();
        log.delete_key(&dispatcher, &key).unwrap();
        assert!(!dispatcher.key_exists(&key));
        assert!(log.undo(&dispatcher).unwrap());
        assert_eq!(KeySnapshot::capture(&dispatcher, &key).unwrap(), before);
        assert!(log.redo(&dispatcher).unwrap());
        assert!(!dispatcher.key_exists(&key));
    }

    #[test]
    fn test_value_changes() {
        let (dispatcher, root) = setup();
        let mut log = UndoableOperationLog::default();

        log.set_value(&dispatcher, &root, &ValueEntry::string("v", "one")).unwrap();
        log.set_value(&dispatcher, &root, &ValueEntry::string("v", "two")).unwrap();
        log.rename_value(&dispatcher, &root, "v", "w").unwrap();
        log.delete_value(&dispatcher, &root, "w").unwrap();
        assert!(dispatcher.enumerate_values(&root).is_empty());

        assert!(log.undo(&dispatcher).unwrap());
        assert_eq!(dispatcher.query_value(&root, "w").unwrap(), ValueEntry::string("w", "two"));
        assert!(log.undo(&dispatcher).unwrap());
        assert!(dispatcher.query_value(&root, "v").is_some());
        assert!(log.undo(&dispatcher).unwrap());
        assert_eq!(dispatcher.query_value(&root, "v").unwrap(), ValueEntry::string("v", "one"));
        assert!(log.undo(&dispatcher).unwrap());
        assert!(dispatcher.query_value(&root, "v").is_none());
        assert!(!log.undo(&dispatcher).unwrap());
        assert_eq!(log.redo_len(), 4);
    }

    #[test]
    fn test_rename_key_round_trip() {
        let (dispatcher, root) = setup();
        assert!(dispatcher.create_key(&root.child("Old")));
        let mut log = UndoableOperationLog::default();

        log.rename_key(&dispatcher, &root.child("Old"), "New").unwrap();
        assert!(dispatcher.key_exists(&root.child("New")));
        log.undo(&dispatcher).unwrap();
        assert_eq!(dispatcher.enumerate_subkey_names(&root, true), vec!["Old"]);
        log.redo(&dispatcher).unwrap();
        assert_eq!(dispatcher.enumerate_subkey_names(&root, true), vec!["New"]);
    }

    #[test]
    fn test_push_clears_redo_and_honors_limit() {
        let (dispatcher, root) = setup();
        let mut log = UndoableOperationLog::new(2);
        for i in 0..3u32 {
            log.set_value(&dispatcher, &root, &ValueEntry::dword("n", i)).unwrap();
        }
        assert_eq!(log.undo_len(), 2);

        log.undo(&dispatcher).unwrap();
        assert!(log.can_redo());
        log.set_value(&dispatcher, &root, &ValueEntry::dword("m", 1)).unwrap();
        assert!(!log.can_redo());
    }

    #[test]
    fn test_replay_is_not_logged() {
        let (dispatcher, root) = setup();
        let mut log = UndoableOperationLog::default();
        log.create_key(&dispatcher, &root.child("K")).unwrap();
        log.rename_key(&dispatcher, &root.child("K"), "L").unwrap();
        log.set_value(&dispatcher, &root.child("L"), &ValueEntry::dword("x", 1)).unwrap();

        assert!(log.undo(&dispatcher).unwrap());
        assert_eq!((log.undo_len(), log.redo_len()), (2, 1));
        assert!(log.undo(&dispatcher).unwrap());
        assert_eq!((log.undo_len(), log.redo_len()), (1, 2));
        assert!(log.redo(&dispatcher).unwrap());
        assert_eq!((log.undo_len(), log.redo_len()), (2, 1));
        assert!(matches!(log.peek_undo(), Some(UndoOperation::RenameKey { new_name, .. }) if new_name == "L"));
        assert!(!log.is_replaying());
    }

    #[test]
    fn test_broken_link_is_not_snapshotted_as_plain_key() {
        let dispatcher = BackendDispatcher::default();
        let root = dispatcher.create_offline_hive("SOFTWARE", Some("HKLM\\SOFTWARE")).unwrap();
        let link = root.child("Link");
        assert!(dispatcher.create_link(&link, "\\REGISTRY\\MACHINE\\SOFTWARE\\Target"));
        assert!(dispatcher.delete_value(&link, SYMBOLIC_LINK_VALUE));

        assert!(KeySnapshot::capture(&dispatcher, &link).is_err());
        let mut log = UndoableOperationLog::default();
        assert!(log.delete_key(&dispatcher, &link).is_err());
        assert!(dispatcher.key_exists(&link));
        assert!(!log.can_undo());
    }

    #[test]
    fn test_failed_undo_keeps_entry() {
        let (dispatcher, root) = setup();
        let mut log = UndoableOperationLog::default();
        log.create_key(&dispatcher, &root.child("Gone")).unwrap();
        assert!(dispatcher.delete_key(&root.child("Gone")));

        assert!(log.undo(&dispatcher).is_err());
        assert_eq!(log.undo_len(), 1);
        assert!(!log.is_replaying());
    }
}
