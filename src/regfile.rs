//! Registry export text format (`.reg` files).
//!
//! ```text
//! Windows Registry Editor Version 5.00
//!
//! [HKEY_CURRENT_USER\Software\Example]
//! @="default"
//! "Count"=dword:000000ff
//! "Path"=hex(2):25,00,54,00,45,00,4d,00,50,00,25,00,00,00
//! ```
//!
//! Parsing is lenient: a malformed line becomes a [`RegistryError::Parse`]
//! diagnostic and is skipped. Deletion entries (`[-Key]`, `"Name"=-`) are
//! accepted and ignored.

use crate::dispatch::{BackendDispatcher, StreamOptions};
use crate::error::{RegistryError, Result};
use crate::path::{build_path, BackendRoot, KeyPath, NodeAddress};
use crate::utils::{fold_case, utf16_bytes};
use crate::value::{ValueEntry, ValueType};
use crate::virtual_tree::VirtualRegistryKey;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::{debug, instrument, warn};

/// Header written at the top of exports.
pub const REGEDIT5_HEADER: &str = "Windows Registry Editor Version 5.00";

/// Header of the older ANSI export format.
pub const REGEDIT4_HEADER: &str = "REGEDIT4";

/// Hex data lines are wrapped before they pass this column.
const HEX_LINE_WIDTH: usize = 76;

const LINE_END: &str = "\r\n";

/// Result of parsing export text.
#[derive(Debug, Default)]
pub struct ParsedRegFile {
    /// Unnamed container whose children are the top-level keys in the file.
    pub root: VirtualRegistryKey,
    /// One `Parse` error per skipped line.
    pub diagnostics: Vec<RegistryError>,
}

/// Parses export text.
pub fn parse(text: &str) -> ParsedRegFile {
    let mut parsed = ParsedRegFile::default();
    let mut current: Option<KeyPath> = None;

    for (line_no, line) in logical_lines(text) {
        if let Err(message) = parse_line(&line, &mut current, &mut parsed.root) {
            warn!(line = line_no, %message, "Skipping malformed export line");
            parsed.diagnostics.push(RegistryError::parse(line_no, message));
        }
    }

    debug!(
        keys = parsed.root.child_count(),
        diagnostics = parsed.diagnostics.len(),
        "Parsed export text"
    );
    parsed
}

/// Reads and parses an export file, sniffing its encoding from the BOM.
#[instrument(skip(path), fields(path = %path.as_ref().display()))]
pub fn parse_file(path: impl AsRef<Path>) -> Result<ParsedRegFile> {
    let bytes = fs::read(path.as_ref())?;
    Ok(parse(&decode_text(&bytes)))
}

/// Decodes file bytes: UTF-16LE/BE or UTF-8 by BOM, else UTF-8 with a
/// Windows-1252 fallback for old ANSI exports.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return text.into_owned();
    }
    let (text, had_errors) = UTF_8.decode_without_bom_handling(bytes);
    if had_errors {
        let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
        return text.into_owned();
    }
    text.into_owned()
}

/// Joins backslash-continued physical lines.
///
/// Yields `(first physical line number, logical line)`.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim_end();
        let (start, mut joined) = match pending.take() {
            Some((start, mut acc)) => {
                acc.push_str(line.trim_start());
                (start, acc)
            }
            None => (index + 1, line.to_string()),
        };

        if joined.ends_with('\\') {
            joined.pop();
            pending = Some((start, joined));
        } else {
            lines.push((start, joined));
        }
    }

    if let Some(last) = pending {
        lines.push(last);
    }
    lines
}

fn parse_line(line: &str, current: &mut Option<KeyPath>, root: &mut VirtualRegistryKey) -> std::result::Result<(), String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(';') || line == REGEDIT5_HEADER || line == REGEDIT4_HEADER {
        return Ok(());
    }

    if let Some(rest) = line.strip_prefix('[') {
        let inner = rest
            .strip_suffix(']')
            .ok_or_else(|| "key header is missing ']'".to_string())?;
        if inner.starts_with('-') {
            *current = None;
            return Ok(());
        }
        let path = KeyPath::parse(inner.trim());
        if path.is_empty() {
            *current = None;
            return Err("empty key header".to_string());
        }
        root.create_path(&path);
        *current = Some(path);
        return Ok(());
    }

    if line.starts_with('"') || line.starts_with('@') {
        let path = current
            .as_ref()
            .ok_or_else(|| "value appears before any key header".to_string())?;
        return match parse_value_line(line)? {
            Some(value) => {
                root.create_path(path).set_value(value);
                Ok(())
            }
            None => Ok(()),
        };
    }

    Err(format!("unrecognized line '{}'", truncate(line, 40)))
}

/// Parses `name=data`. `Ok(None)` for a deletion entry.
fn parse_value_line(line: &str) -> std::result::Result<Option<ValueEntry>, String> {
    let (name, rest) = match line.strip_prefix('@') {
        Some(rest) => (String::new(), rest),
        None => parse_quoted(line)?,
    };

    let data = rest
        .trim_start()
        .strip_prefix('=')
        .ok_or_else(|| format!("expected '=' after value name '{}'", name))?
        .trim();

    if data == "-" {
        return Ok(None);
    }

    if data.starts_with('"') {
        let (text, trailing) = parse_quoted(data)?;
        if !trailing.trim().is_empty() {
            return Err(format!("unexpected text after string value '{}'", name));
        }
        return Ok(Some(ValueEntry::string(name, &text)));
    }

    let lower = data.to_ascii_lowercase();
    if let Some(digits) = lower.strip_prefix("dword:") {
        let digits = digits.trim();
        if digits.is_empty() || digits.len() > 8 {
            return Err(format!("dword for '{}' needs 1 to 8 hex digits", name));
        }
        let number = u32::from_str_radix(digits, 16)
            .map_err(|_| format!("invalid dword '{}' for '{}'", digits, name))?;
        return Ok(Some(ValueEntry::dword(name, number)));
    }

    if let Some(bytes) = lower.strip_prefix("hex:") {
        return Ok(Some(ValueEntry::new(name, ValueType::Binary, parse_hex_bytes(bytes)?)));
    }

    if let Some(rest) = lower.strip_prefix("hex(") {
        let (code, bytes) = rest
            .split_once("):")
            .ok_or_else(|| format!("malformed hex type for '{}'", name))?;
        let code = u32::from_str_radix(code.trim(), 16)
            .map_err(|_| format!("invalid hex type code '{}' for '{}'", code, name))?;
        let value_type = ValueType::from_export_code(code);
        return Ok(Some(ValueEntry::new(name, value_type, parse_hex_bytes(bytes)?)));
    }

    Err(format!("unrecognized data for '{}'", name))
}

/// Parses a quoted string starting at `input[0]`; returns it and the rest.
fn parse_quoted(input: &str) -> std::result::Result<(String, &str), String> {
    let body = input
        .strip_prefix('"')
        .ok_or_else(|| "expected '\"'".to_string())?;

    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, &body[i + 1..])),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, 't')) => out.push('\t'),
                Some((_, '0')) => out.push('\0'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            other => out.push(other),
        }
    }
    Err("unterminated string".to_string())
}

fn parse_hex_bytes(text: &str) -> std::result::Result<Vec<u8>, String> {
    let mut bytes = Vec::new();
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let padded = if part.len() == 1 { format!("0{}", part) } else { part.to_string() };
        let decoded = hex::decode(&padded).map_err(|_| format!("invalid hex byte '{}'", part))?;
        if decoded.len() != 1 {
            return Err(format!("invalid hex byte '{}'", part));
        }
        bytes.extend(decoded);
    }
    Ok(bytes)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Serializes a tree (as returned by [`parse`]) to export text.
pub fn export(root: &VirtualRegistryKey) -> String {
    let mut out = header();
    for child in sorted_children(root) {
        export_key(child, child.name(), &mut out);
    }
    out
}

fn export_key(key: &VirtualRegistryKey, path: &str, out: &mut String) {
    let values: Vec<ValueEntry> = key.values().cloned().collect();
    write_section(out, path, &values, key.child_count() == 0);
    for child in sorted_children(key) {
        export_key(child, &format!("{}\\{}", path, child.name()), out);
    }
}

fn sorted_children(key: &VirtualRegistryKey) -> Vec<&VirtualRegistryKey> {
    // The child map is keyed by folded name, so it is already ordered.
    key.children().collect()
}

fn header() -> String {
    format!("{}{}{}", REGEDIT5_HEADER, LINE_END, LINE_END)
}

/// Emits a section for keys that own values, and for empty leaves so they
/// survive a round trip.
fn write_section(out: &mut String, path: &str, values: &[ValueEntry], is_leaf: bool) {
    if values.is_empty() && !is_leaf {
        return;
    }
    let _ = write!(out, "[{}]{}", path, LINE_END);
    let mut values: Vec<&ValueEntry> = values.iter().collect();
    values.sort_by(|a, b| (!a.is_default(), fold_case(&a.name)).cmp(&(!b.is_default(), fold_case(&b.name))));
    for value in values {
        out.push_str(&format_value(value));
        out.push_str(LINE_END);
    }
    out.push_str(LINE_END);
}

/// Renders one `name=data` line (possibly wrapped) in its narrowest form.
pub fn format_value(value: &ValueEntry) -> String {
    let name = if value.is_default() {
        "@".to_string()
    } else {
        format!("\"{}\"", escape(&value.name))
    };

    match value.value_type {
        ValueType::String => {
            if let Some(text) = well_formed_string(&value.data) {
                return format!("{}=\"{}\"", name, escape(&text));
            }
        }
        ValueType::Dword if value.data.len() == 4 => {
            let number = u32::from_le_bytes([value.data[0], value.data[1], value.data[2], value.data[3]]);
            return format!("{}=dword:{:08x}", name, number);
        }
        _ => {}
    }

    let prefix = match value.value_type {
        ValueType::Binary => format!("{}=hex:", name),
        other => format!("{}=hex({:x}):", name, other.as_u32()),
    };
    wrap_hex(prefix, &value.data)
}

/// A string payload that round-trips through quotes: exactly one trailing
/// NUL and none inside.
fn well_formed_string(data: &[u8]) -> Option<String> {
    if data.len() < 2 || data.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let (last, body) = units.split_last()?;
    if *last != 0 || body.contains(&0) {
        return None;
    }
    String::from_utf16(body).ok()
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out
}

fn wrap_hex(prefix: String, data: &[u8]) -> String {
    let mut out = String::new();
    let mut line = prefix;
    for (i, byte) in data.iter().enumerate() {
        let mut piece = hex::encode([*byte]);
        if i + 1 < data.len() {
            piece.push(',');
        }
        if i > 0 && line.len() + piece.len() > HEX_LINE_WIDTH {
            out.push_str(&line);
            out.push('\\');
            out.push_str(LINE_END);
            line = "  ".to_string();
        }
        line.push_str(&piece);
    }
    out.push_str(&line);
    out
}

/// Writes export text as UTF-16LE with a byte order mark.
pub fn write_file(text: &str, path: impl AsRef<Path>) -> Result<()> {
    let mut bytes = vec![0xFF, 0xFE];
    bytes.extend(utf16_bytes(text, false));
    fs::write(path, bytes)?;
    Ok(())
}

/// Exports a tree straight to a file.
#[instrument(skip(root, path), fields(path = %path.as_ref().display()))]
pub fn export_to_file(root: &VirtualRegistryKey, path: impl AsRef<Path>) -> Result<()> {
    write_file(&export(root), path)
}

/// Exports the subtree at `node` from any backend.
pub fn export_node(dispatcher: &BackendDispatcher, node: &NodeAddress) -> Result<String> {
    export_node_with_progress(dispatcher, node, |_| true)
}

/// Exports the subtree at `node`, calling `progress` before each key.
///
/// # Errors
///
/// [`RegistryError::Cancelled`] when `progress` returns false.
pub fn export_node_with_progress<F>(dispatcher: &BackendDispatcher, node: &NodeAddress, mut progress: F) -> Result<String>
where
    F: FnMut(&NodeAddress) -> bool,
{
    let mut out = header();
    export_backend_key(dispatcher, node, &mut out, &mut progress)?;
    Ok(out)
}

fn export_backend_key(
    dispatcher: &BackendDispatcher,
    node: &NodeAddress,
    out: &mut String,
    progress: &mut dyn FnMut(&NodeAddress) -> bool,
) -> Result<()> {
    if !progress(node) {
        return Err(RegistryError::Cancelled);
    }

    let mut values = Vec::new();
    let mut subkeys = Vec::new();
    dispatcher.try_stream_enumerate(
        node,
        StreamOptions::default(),
        |value| {
            values.push(value);
            true
        },
        |name| {
            subkeys.push(name.to_string());
            true
        },
    )?;
    subkeys.sort_by_key(|name| fold_case(name));

    if let Some(path) = section_path(node) {
        write_section(out, &path, &values, subkeys.is_empty());
    }
    for name in subkeys {
        export_backend_key(dispatcher, &node.child(&name), out, progress)?;
    }
    Ok(())
}

/// Section header path for a node. Virtual nodes drop the file name, and
/// the virtual container itself has no section.
fn section_path(node: &NodeAddress) -> Option<String> {
    match node.root {
        BackendRoot::Virtual(_) if node.path.is_empty() => None,
        BackendRoot::Virtual(_) => Some(node.path.to_string()),
        _ => Some(build_path(node)),
    }
}
