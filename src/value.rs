//! Registry value model shared by every backend.
//!
//! A [`ValueEntry`] always carries the raw payload exactly as the backend
//! stores it. [`ValueData`] is a decoded, display-oriented view of it.

use crate::utils::{names_equal, utf16_bytes, utf16_lossy};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

/// Name of the reserved value holding a symbolic link's target.
pub const SYMBOLIC_LINK_VALUE: &str = "SymbolicLinkValue";

/// Registry value data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueType {
    /// No value type.
    None,
    /// String (null-terminated).
    String,
    /// String with environment variables.
    ExpandString,
    /// Binary data.
    Binary,
    /// 32-bit little-endian integer.
    Dword,
    /// 32-bit big-endian integer.
    DwordBigEndian,
    /// Symbolic link target (UTF-16, not terminated).
    Link,
    /// Multiple strings.
    MultiString,
    /// Resource list.
    ResourceList,
    /// Full resource descriptor.
    FullResourceDescriptor,
    /// Resource requirements list.
    ResourceRequirementsList,
    /// 64-bit little-endian integer.
    Qword,
    /// Non-standard type tag, kept verbatim.
    Unknown(u32),
}

impl ValueType {
    /// Maps an OS numeric type tag to a value type.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => ValueType::None,
            1 => ValueType::String,
            2 => ValueType::ExpandString,
            3 => ValueType::Binary,
            4 => ValueType::Dword,
            5 => ValueType::DwordBigEndian,
            6 => ValueType::Link,
            7 => ValueType::MultiString,
            8 => ValueType::ResourceList,
            9 => ValueType::FullResourceDescriptor,
            10 => ValueType::ResourceRequirementsList,
            11 => ValueType::Qword,
            other => ValueType::Unknown(other),
        }
    }

    /// Maps a `hex(<code>):` type code from export text.
    ///
    /// Only the codes the export format defines are honored; anything else,
    /// including the link tag, reads back as [`ValueType::Binary`].
    pub fn from_export_code(code: u32) -> Self {
        match code {
            0x0 | 0x1 | 0x2 | 0x3 | 0x4 | 0x5 | 0x7 | 0x8 | 0x9 | 0xA | 0xB => {
                Self::from_u32(code)
            }
            _ => ValueType::Binary,
        }
    }

    /// Returns the OS numeric type tag.
    pub fn as_u32(&self) -> u32 {
        match self {
            ValueType::None => 0,
            ValueType::String => 1,
            ValueType::ExpandString => 2,
            ValueType::Binary => 3,
            ValueType::Dword => 4,
            ValueType::DwordBigEndian => 5,
            ValueType::Link => 6,
            ValueType::MultiString => 7,
            ValueType::ResourceList => 8,
            ValueType::FullResourceDescriptor => 9,
            ValueType::ResourceRequirementsList => 10,
            ValueType::Qword => 11,
            ValueType::Unknown(value) => *value,
        }
    }

    /// Returns the `REG_*` name of this value type.
    pub fn name(&self) -> String {
        match self {
            ValueType::None => "REG_NONE".to_string(),
            ValueType::String => "REG_SZ".to_string(),
            ValueType::ExpandString => "REG_EXPAND_SZ".to_string(),
            ValueType::Binary => "REG_BINARY".to_string(),
            ValueType::Dword => "REG_DWORD".to_string(),
            ValueType::DwordBigEndian => "REG_DWORD_BIG_ENDIAN".to_string(),
            ValueType::Link => "REG_LINK".to_string(),
            ValueType::MultiString => "REG_MULTI_SZ".to_string(),
            ValueType::ResourceList => "REG_RESOURCE_LIST".to_string(),
            ValueType::FullResourceDescriptor => "REG_FULL_RESOURCE_DESCRIPTOR".to_string(),
            ValueType::ResourceRequirementsList => "REG_RESOURCE_REQUIREMENTS_LIST".to_string(),
            ValueType::Qword => "REG_QWORD".to_string(),
            ValueType::Unknown(value) => format!("REG_UNKNOWN_{:#010x}", value),
        }
    }

    /// Returns true for the string-shaped types.
    pub fn is_string(&self) -> bool {
        matches!(
            self,
            ValueType::String | ValueType::ExpandString | ValueType::MultiString | ValueType::Link
        )
    }
}

/// A named, typed registry value with its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueEntry {
    /// Value name; empty for the unnamed default value.
    pub name: String,
    /// Value type tag.
    pub value_type: ValueType,
    /// Raw payload bytes.
    pub data: Vec<u8>,
}

impl ValueEntry {
    /// Creates a value from raw parts.
    pub fn new(name: impl Into<String>, value_type: ValueType, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            value_type,
            data,
        }
    }

    /// REG_SZ value, stored NUL-terminated.
    pub fn string(name: impl Into<String>, value: &str) -> Self {
        Self::new(name, ValueType::String, utf16_bytes(value, true))
    }

    /// REG_EXPAND_SZ value, stored NUL-terminated.
    pub fn expand_string(name: impl Into<String>, value: &str) -> Self {
        Self::new(name, ValueType::ExpandString, utf16_bytes(value, true))
    }

    /// REG_MULTI_SZ value: each string NUL-terminated plus a final NUL.
    pub fn multi_string<S: AsRef<str>>(name: impl Into<String>, values: &[S]) -> Self {
        let mut data = Vec::new();
        for value in values {
            data.extend(utf16_bytes(value.as_ref(), true));
        }
        data.extend_from_slice(&[0, 0]);
        Self::new(name, ValueType::MultiString, data)
    }

    /// REG_DWORD value.
    pub fn dword(name: impl Into<String>, value: u32) -> Self {
        Self::new(name, ValueType::Dword, value.to_le_bytes().to_vec())
    }

    /// REG_QWORD value.
    pub fn qword(name: impl Into<String>, value: u64) -> Self {
        Self::new(name, ValueType::Qword, value.to_le_bytes().to_vec())
    }

    /// REG_BINARY value.
    pub fn binary(name: impl Into<String>, data: &[u8]) -> Self {
        Self::new(name, ValueType::Binary, data.to_vec())
    }

    /// REG_LINK value as stored under [`SYMBOLIC_LINK_VALUE`] (no terminator).
    pub fn link(target: &str) -> Self {
        Self::new(SYMBOLIC_LINK_VALUE, ValueType::Link, utf16_bytes(target, false))
    }

    /// Returns true for the unnamed default value.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    /// Case-insensitive name comparison.
    pub fn has_name(&self, name: &str) -> bool {
        names_equal(&self.name, name)
    }

    /// Decodes the payload according to the value type.
    pub fn decoded(&self) -> ValueData {
        ValueData::decode(&self.data, self.value_type)
    }

    /// Name shown for this value in listings.
    pub fn display_name(&self) -> &str {
        if self.is_default() {
            "(Default)"
        } else {
            &self.name
        }
    }

    /// Copy of this entry with the payload dropped.
    pub fn without_data(&self) -> Self {
        Self::new(self.name.clone(), self.value_type, Vec::new())
    }
}

/// Decoded registry value data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueData {
    /// No data.
    None,
    /// String value.
    String(String),
    /// Expandable string value.
    ExpandString(String),
    /// Symbolic link target.
    Link(String),
    /// Binary data (also used for resource descriptors and unknown types).
    Binary(Vec<u8>),
    /// 32-bit integer (either byte order, already converted).
    Dword(u32),
    /// 64-bit integer.
    Qword(u64),
    /// Multiple strings.
    MultiString(Vec<String>),
}

impl ValueData {
    /// Decodes raw bytes based on the value type.
    ///
    /// Numeric types with a short payload fall back to [`ValueData::Binary`]
    /// instead of failing, since the live registry happily stores those.
    pub fn decode(data: &[u8], value_type: ValueType) -> Self {
        if data.is_empty() && !value_type.is_string() {
            return ValueData::None;
        }

        match value_type {
            ValueType::None => ValueData::Binary(data.to_vec()),
            ValueType::String => ValueData::String(trim_nul(utf16_lossy(data))),
            ValueType::ExpandString => ValueData::ExpandString(trim_nul(utf16_lossy(data))),
            ValueType::Link => ValueData::Link(trim_nul(utf16_lossy(data))),
            ValueType::MultiString => {
                let text = utf16_lossy(data);
                let strings = text
                    .trim_end_matches('\0')
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                ValueData::MultiString(strings)
            }
            ValueType::Dword if data.len() == 4 => {
                let mut cursor = Cursor::new(data);
                cursor
                    .read_u32::<LittleEndian>()
                    .map(ValueData::Dword)
                    .unwrap_or_else(|_| ValueData::Binary(data.to_vec()))
            }
            ValueType::DwordBigEndian if data.len() == 4 => {
                let mut cursor = Cursor::new(data);
                cursor
                    .read_u32::<BigEndian>()
                    .map(ValueData::Dword)
                    .unwrap_or_else(|_| ValueData::Binary(data.to_vec()))
            }
            ValueType::Qword if data.len() == 8 => {
                let mut cursor = Cursor::new(data);
                cursor
                    .read_u64::<LittleEndian>()
                    .map(ValueData::Qword)
                    .unwrap_or_else(|_| ValueData::Binary(data.to_vec()))
            }
            _ => ValueData::Binary(data.to_vec()),
        }
    }

    /// Text used for data searches and list rows.
    pub fn as_text(&self) -> String {
        self.to_string()
    }
}

fn trim_nul(s: String) -> String {
    match s.find('\0') {
        Some(pos) => s[..pos].to_string(),
        None => s,
    }
}

impl fmt::Display for ValueData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueData::None => write!(f, "(value not set)"),
            ValueData::String(s) | ValueData::ExpandString(s) | ValueData::Link(s) => {
                write!(f, "{}", s)
            }
            ValueData::Binary(b) => {
                let parts: Vec<String> = b.iter().map(|byte| format!("{:02x}", byte)).collect();
                write!(f, "{}", parts.join(" "))
            }
            ValueData::Dword(d) => write!(f, "0x{:08x} ({})", d, d),
            ValueData::Qword(q) => write!(f, "0x{:016x} ({})", q, q),
            ValueData::MultiString(strings) => write!(f, "{}", strings.join(" ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_tags() {
        for tag in 0..=11u32 {
            assert_eq!(ValueType::from_u32(tag).as_u32(), tag);
        }
        assert_eq!(ValueType::from_u32(0x20), ValueType::Unknown(0x20));
        assert_eq!(ValueType::String.name(), "REG_SZ");
    }

    #[test]
    fn test_export_code_table() {
        assert_eq!(ValueType::from_export_code(0x2), ValueType::ExpandString);
        assert_eq!(ValueType::from_export_code(0xb), ValueType::Qword);
        assert_eq!(ValueType::from_export_code(0x6), ValueType::Binary);
        assert_eq!(ValueType::from_export_code(0x42), ValueType::Binary);
    }

    #[test]
    fn test_decode_dword_orders() {
        let le = ValueEntry::dword("x", 0x0102_0304);
        assert_eq!(le.decoded(), ValueData::Dword(0x0102_0304));

        let be = ValueEntry::new("x", ValueType::DwordBigEndian, vec![1, 2, 3, 4]);
        assert_eq!(be.decoded(), ValueData::Dword(0x0102_0304));
    }

    #[test]
    fn test_decode_multi_string() {
        let v = ValueEntry::multi_string("m", &["one", "two"]);
        assert_eq!(
            v.decoded(),
            ValueData::MultiString(vec!["one".to_string(), "two".to_string()])
        );
    }

    #[test]
    fn test_short_dword_is_binary() {
        let v = ValueEntry::new("x", ValueType::Dword, vec![1, 2]);
        assert_eq!(v.decoded(), ValueData::Binary(vec![1, 2]));
    }

    #[test]
    fn test_display() {
        assert_eq!(ValueEntry::dword("d", 255).decoded().to_string(), "0x000000ff (255)");
        assert_eq!(ValueEntry::string("s", "hi").decoded().to_string(), "hi");
        assert_eq!(ValueEntry::binary("b", &[0xde, 0xad]).decoded().to_string(), "de ad");
    }

    #[test]
    fn test_link_value() {
        let v = ValueEntry::link("\\REGISTRY\\MACHINE\\SYSTEM\\ControlSet001");
        assert!(v.has_name("symboliclinkvalue"));
        assert_eq!(v.data.len() % 2, 0);
        assert_eq!(
            v.decoded(),
            ValueData::Link("\\REGISTRY\\MACHINE\\SYSTEM\\ControlSet001".to_string())
        );
    }
}
