//! Integration tests for the undo log against offline and virtual backends.

use std::sync::Arc;
use unireg::{
    BackendDispatcher, KeySnapshot, NodeAddress, UndoOperation, UndoableOperationLog, ValueEntry,
    VirtualRegistryData, VirtualRegistryKey,
};

fn offline_root(dispatcher: &BackendDispatcher) -> NodeAddress {
    dispatcher
        .create_offline_hive("SOFTWARE", Some("HKLM\\SOFTWARE"))
        .unwrap()
}

fn virtual_root(dispatcher: &BackendDispatcher) -> NodeAddress {
    dispatcher.register_virtual_root(Arc::new(VirtualRegistryData::new(
        "undo.reg",
        VirtualRegistryKey::default(),
    )))
}

#[test]
fn test_undo_create_then_redo_restores_identical_key() {
    let dispatcher = BackendDispatcher::default();
    let root = offline_root(&dispatcher);
    let mut log = UndoableOperationLog::for_dispatcher(&dispatcher);

    let app = root.child("Vendor").child("App");
    log.create_key(&dispatcher, &app).unwrap();
    assert!(matches!(
        log.peek_undo(),
        Some(UndoOperation::CreateKey { node, .. }) if node.path.to_string() == "Vendor"
    ));

    // Edits made outside the log still come back with the key on redo.
    assert!(dispatcher.create_key(&app.child("Plugins")));
    assert!(dispatcher.set_value(&app, &ValueEntry::string("Name", "app")));
    assert!(dispatcher.set_value(&app, &ValueEntry::multi_string("Paths", &["a", "b"])));
    let before = KeySnapshot::capture(&dispatcher, &root.child("Vendor")).unwrap();
    assert_eq!(before.key_count(), 3);

    assert!(log.undo(&dispatcher).unwrap());
    assert!(!dispatcher.key_exists(&root.child("Vendor")));
    assert!(log.can_redo());

    assert!(log.redo(&dispatcher).unwrap());
    let after = KeySnapshot::capture(&dispatcher, &root.child("Vendor")).unwrap();
    assert_eq!(before, after);
    assert!(!log.can_redo());
}

#[test]
fn test_undo_delete_restores_subtree_and_links() {
    let dispatcher = BackendDispatcher::default();
    let root = offline_root(&dispatcher);
    let mut log = UndoableOperationLog::default();

    let vendor = root.child("Vendor");
    assert!(dispatcher.create_key(&vendor.child("Real")));
    assert!(dispatcher.set_value(&vendor.child("Real"), &ValueEntry::dword("Level", 3)));
    assert!(dispatcher.create_link(&vendor.child("Alias"), "\\REGISTRY\\MACHINE\\SOFTWARE\\Vendor\\Real"));
    let before = KeySnapshot::capture(&dispatcher, &vendor).unwrap();
    assert!(before.children.iter().any(|c| c.link_target.is_some()));

    log.delete_key(&dispatcher, &vendor).unwrap();
    assert!(!dispatcher.key_exists(&vendor));

    assert!(log.undo(&dispatcher).unwrap());
    assert_eq!(KeySnapshot::capture(&dispatcher, &vendor).unwrap(), before);
    let resolved = dispatcher.resolve_links(&vendor.child("Alias")).unwrap();
    assert_eq!(resolved.path.to_string(), "Vendor\\Real");
}

#[test]
fn test_rename_and_value_history() {
    let dispatcher = BackendDispatcher::default();
    let root = virtual_root(&dispatcher);
    let mut log = UndoableOperationLog::new(16);

    let key = root.child("Settings");
    log.create_key(&dispatcher, &key).unwrap();
    log.set_value(&dispatcher, &key, &ValueEntry::dword("Mode", 1)).unwrap();
    log.set_value(&dispatcher, &key, &ValueEntry::dword("Mode", 2)).unwrap();
    log.rename_value(&dispatcher, &key, "Mode", "Level").unwrap();
    log.rename_key(&dispatcher, &key, "Options").unwrap();
    assert_eq!(log.undo_len(), 5);

    let renamed = root.child("Options");
    assert_eq!(dispatcher.query_value(&renamed, "Level").unwrap().data, 2u32.to_le_bytes());

    assert!(log.undo(&dispatcher).unwrap());
    assert!(dispatcher.key_exists(&key));
    assert!(!dispatcher.key_exists(&renamed));

    assert!(log.undo(&dispatcher).unwrap());
    assert!(dispatcher.query_value(&key, "Level").is_none());

    assert!(log.undo(&dispatcher).unwrap());
    assert_eq!(dispatcher.query_value(&key, "Mode").unwrap().data, 1u32.to_le_bytes());

    assert!(log.undo(&dispatcher).unwrap());
    assert!(dispatcher.query_value(&key, "Mode").is_none());

    assert!(log.undo(&dispatcher).unwrap());
    assert!(!dispatcher.key_exists(&key));
    assert!(!log.undo(&dispatcher).unwrap());

    while log.redo(&dispatcher).unwrap() {}
    assert_eq!(dispatcher.query_value(&renamed, "Level").unwrap().data, 2u32.to_le_bytes());
    assert_eq!(log.undo_len(), 5);
}

#[test]
fn test_new_operation_clears_redo() {
    let dispatcher = BackendDispatcher::default();
    let root = virtual_root(&dispatcher);
    let mut log = UndoableOperationLog::new(2);

    for n in 0..3u32 {
        log.set_value(&dispatcher, &root, &ValueEntry::dword("N", n)).unwrap();
    }
    assert_eq!(log.undo_len(), 2);

    assert!(log.undo(&dispatcher).unwrap());
    assert_eq!(log.redo_len(), 1);
    log.delete_value(&dispatcher, &root, "N").unwrap();
    assert!(!log.can_redo());

    assert!(log.undo(&dispatcher).unwrap());
    assert_eq!(dispatcher.query_value(&root, "N").unwrap().data, 1u32.to_le_bytes());
}
