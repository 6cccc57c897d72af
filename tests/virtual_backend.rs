//! Integration tests for `.reg` parsing, export and the virtual backend.

use proptest::prelude::*;
use std::sync::Arc;
use unireg::{
    regfile, BackendDispatcher, NodeAddress, ValueData, ValueEntry, ValueType, VirtualRegistryData,
    VirtualRegistryKey,
};

const SAMPLE: &str = "Windows Registry Editor Version 5.00\r\n\
\r\n\
[HKEY_LOCAL_MACHINE\\SOFTWARE\\Contoso]\r\n\
@=\"Contoso \\\"Suite\\\"\"\r\n\
\"Flags\"=dword:000000ff\r\n\
\"Path\"=hex(2):41,00,00,00\r\n\
\"Blob\"=hex:00,01,02,03,04,05,06,07,08,09,0a,0b,0c,0d,0e,0f,10,11,12,13,14,15,16,\\\r\n\
  17,18,19,1a,1b,1c,1d,1e,1f\r\n\
\"Big\"=hex(b):00,00,00,00,01,00,00,00\r\n\
\"List\"=hex(7):61,00,00,00,62,00,00,00,00,00\r\n\
\r\n\
[HKEY_LOCAL_MACHINE\\SOFTWARE\\Contoso\\Empty]\r\n\
\r\n\
[HKEY_LOCAL_MACHINE\\SOFTWARE\\Contoso\\Plugins\\Alpha]\r\n\
\"Enabled\"=dword:00000001\r\n";

fn mount(dispatcher: &BackendDispatcher, text: &str) -> NodeAddress {
    let parsed = regfile::parse(text);
    assert!(parsed.diagnostics.is_empty(), "unexpected diagnostics: {:?}", parsed.diagnostics);
    dispatcher.register_virtual_root(Arc::new(VirtualRegistryData::new("sample.reg", parsed.root)))
}

fn contoso(root: &NodeAddress) -> NodeAddress {
    root.child("HKEY_LOCAL_MACHINE").child("SOFTWARE").child("Contoso")
}

#[test]
fn test_round_trip_preserves_everything() {
    let first = regfile::parse(SAMPLE);
    let exported = regfile::export(&first.root);
    let second = regfile::parse(&exported);

    assert!(second.diagnostics.is_empty());
    assert_eq!(first.root, second.root);
    assert_eq!(regfile::export(&second.root), exported);
}

#[test]
fn test_dword_parse_and_export() {
    let dispatcher = BackendDispatcher::default();
    let root = mount(&dispatcher, SAMPLE);
    let flags = dispatcher.query_value(&contoso(&root), "flags").unwrap();

    assert_eq!(flags.value_type, ValueType::Dword);
    assert_eq!(flags.decoded(), ValueData::Dword(255));
    assert_eq!(regfile::format_value(&flags), "\"Flags\"=dword:000000ff");
}

#[test]
fn test_expand_string_stays_hex() {
    let dispatcher = BackendDispatcher::default();
    let root = mount(&dispatcher, SAMPLE);
    let path = dispatcher.query_value(&contoso(&root), "Path").unwrap();

    assert_eq!(path.value_type, ValueType::ExpandString);
    assert_eq!(path.data, vec![0x41, 0x00, 0x00, 0x00]);
    assert_eq!(path.decoded(), ValueData::ExpandString("A".to_string()));
    assert_eq!(regfile::format_value(&path), "\"Path\"=hex(2):41,00,00,00");
}

#[test]
fn test_continuation_lines_join() {
    let dispatcher = BackendDispatcher::default();
    let root = mount(&dispatcher, SAMPLE);
    let blob = dispatcher.query_value(&contoso(&root), "Blob").unwrap();
    assert_eq!(blob.data, (0u8..0x20).collect::<Vec<_>>());

    let list = dispatcher.query_value(&contoso(&root), "List").unwrap();
    assert_eq!(
        list.decoded(),
        ValueData::MultiString(vec!["a".to_string(), "b".to_string()])
    );
}

#[test]
fn test_recursive_delete() {
    let dispatcher = BackendDispatcher::default();
    let data = Arc::new(VirtualRegistryData::new("scratch.reg", VirtualRegistryKey::default()));
    let root = dispatcher.register_virtual_root(data);

    let a = root.child("A");
    let b = a.child("B");
    assert!(dispatcher.create_key(&b));
    assert!(dispatcher.set_value(&b, &ValueEntry::string("V", "payload")));

    assert!(dispatcher.delete_key(&a));
    assert!(!dispatcher.key_exists(&b));
    assert!(dispatcher.query_value(&b, "V").is_none());
    assert!(dispatcher.query_key_info(&b).is_none());
}

#[test]
fn test_export_node_walks_any_subtree() {
    let dispatcher = BackendDispatcher::default();
    let root = mount(&dispatcher, SAMPLE);

    let text = regfile::export_node(&dispatcher, &contoso(&root).child("Plugins")).unwrap();
    assert!(text.starts_with("Windows Registry Editor Version 5.00"));
    assert!(text.contains("[HKEY_LOCAL_MACHINE\\SOFTWARE\\Contoso\\Plugins\\Alpha]"));
    assert!(text.contains("\"Enabled\"=dword:00000001"));
    assert!(!text.contains("Flags"));

    let whole = regfile::export_node(&dispatcher, &root).unwrap();
    let reparsed = regfile::parse(&whole);
    assert!(reparsed.diagnostics.is_empty());
    assert_eq!(reparsed.root, regfile::parse(SAMPLE).root);
}

#[test]
fn test_export_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contoso.reg");
    regfile::export_to_file(&regfile::parse(SAMPLE).root, &path).unwrap();

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[..2], &[0xFF, 0xFE]);

    let dispatcher = BackendDispatcher::default();
    let root = dispatcher.load_virtual_root(&path).unwrap();
    assert_eq!(root.root_name, "contoso.reg");
    assert!(dispatcher.key_exists(&contoso(&root).child("Empty")));
}

#[test]
fn test_malformed_lines_are_skipped() {
    let text = "REGEDIT4\r\n\"Orphan\"=dword:1\r\n[HKEY_CURRENT_USER\\X]\r\n\"Bad\"=dword:zz\r\n\"Good\"=\"yes\"\r\n";
    let parsed = regfile::parse(text);
    assert_eq!(parsed.diagnostics.len(), 2);

    let x = parsed.root.child("HKEY_CURRENT_USER").and_then(|k| k.child("X")).unwrap();
    assert_eq!(x.value_count(), 1);
    assert!(x.value("good").is_some());
}

proptest! {
    #[test]
    fn prop_value_lookup_ignores_case(name in "[A-Za-z][A-Za-z0-9 _.-]{0,24}", data in any::<u32>()) {
        let dispatcher = BackendDispatcher::default();
        let root = dispatcher.register_virtual_root(Arc::new(VirtualRegistryData::new(
            "prop.reg",
            VirtualRegistryKey::default(),
        )));

        prop_assert!(dispatcher.set_value(&root, &ValueEntry::dword(name.as_str(), data)));
        let upper = dispatcher.query_value(&root, &name.to_uppercase()).unwrap();
        let lower = dispatcher.query_value(&root, &name.to_lowercase()).unwrap();
        prop_assert_eq!(&upper.data, &data.to_le_bytes().to_vec());
        prop_assert_eq!(upper, lower);
    }

    #[test]
    fn prop_key_lookup_ignores_case(name in "[A-Za-z][A-Za-z0-9]{0,16}") {
        let dispatcher = BackendDispatcher::default();
        let root = dispatcher.register_virtual_root(Arc::new(VirtualRegistryData::new(
            "prop.reg",
            VirtualRegistryKey::default(),
        )));

        prop_assert!(dispatcher.create_key(&root.child(&name)));
        prop_assert!(dispatcher.key_exists(&root.child(&name.to_uppercase())));
        prop_assert!(dispatcher.create_key(&root.child(&name.to_lowercase())));
        prop_assert_eq!(dispatcher.enumerate_subkey_names(&root, false).len(), 1);
    }
}
