//! Utility functions for binary parsing, UTF-16 conversion and timestamps.

use crate::error::{RegistryError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use encoding_rs::UTF_16LE;
use std::io::Cursor;

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01.
const FILETIME_UNIX_DIFF: i64 = 11_644_473_600;

/// FILETIME ticks (100ns) per second.
const FILETIME_TICKS_PER_SECOND: u64 = 10_000_000;

/// Folds a key or value name for case-insensitive comparison and map keys.
#[inline]
pub fn fold_case(name: &str) -> String {
    name.to_lowercase()
}

/// Case-insensitive name equality.
#[inline]
pub fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || fold_case(a) == fold_case(b)
}

/// Reads a compressed (Latin-1) name from a byte slice, trimming null terminators.
pub fn read_latin1_string(data: &[u8]) -> String {
    data.iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end_matches('\0')
        .to_string()
}

/// Reads a UTF-16LE string from a byte slice, trimming null terminators.
///
/// # Errors
///
/// Returns an error if the data length is odd or the decoder hits invalid
/// surrogates.
pub fn read_utf16_string(data: &[u8], offset: u32) -> Result<String> {
    if data.is_empty() {
        return Ok(String::new());
    }
    if data.len() % 2 != 0 {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    let (decoded, _encoding, had_errors) = UTF_16LE.decode(data);
    if had_errors {
        return Err(RegistryError::InvalidUtf16 { offset });
    }
    Ok(decoded.trim_end_matches('\0').to_string())
}

/// Decodes UTF-16LE without failing; a trailing odd byte is dropped.
pub fn utf16_lossy(data: &[u8]) -> String {
    let even = &data[..data.len() - data.len() % 2];
    let (decoded, _) = UTF_16LE.decode_without_bom_handling(even);
    decoded.into_owned()
}

/// Encodes a string as UTF-16LE bytes, optionally appending a NUL terminator.
pub fn utf16_bytes(s: &str, nul_terminated: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity((s.len() + 1) * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    if nul_terminated {
        out.extend_from_slice(&[0, 0]);
    }
    out
}

/// Encodes a string as UTF-16 code units with a trailing NUL, for OS calls.
pub fn wide_nul(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Reads a u32 from a byte slice at the given offset.
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = slice_at(data, offset, 4)?;
    Ok(Cursor::new(bytes).read_u32::<LittleEndian>()?)
}

/// Reads a u16 from a byte slice at the given offset.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    let bytes = slice_at(data, offset, 2)?;
    Ok(Cursor::new(bytes).read_u16::<LittleEndian>()?)
}

/// Reads an i32 from a byte slice at the given offset.
pub fn read_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    let bytes = slice_at(data, offset, 4)?;
    Ok(Cursor::new(bytes).read_i32::<LittleEndian>()?)
}

/// Reads a u64 from a byte slice at the given offset.
pub fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    let bytes = slice_at(data, offset, 8)?;
    Ok(Cursor::new(bytes).read_u64::<LittleEndian>()?)
}

fn slice_at(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    data.get(offset..offset + len)
        .ok_or_else(|| RegistryError::TruncatedData {
            offset: offset as u32,
            expected: len,
            actual: data.len().saturating_sub(offset),
        })
}

/// Converts a Windows FILETIME to a UTC timestamp.
///
/// Returns `None` for zero and for values outside chrono's range.
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let seconds = (filetime / FILETIME_TICKS_PER_SECOND) as i64 - FILETIME_UNIX_DIFF;
    let nanos = ((filetime % FILETIME_TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(seconds, nanos)
}

/// Converts a UTC timestamp to a Windows FILETIME.
pub fn datetime_to_filetime(dt: DateTime<Utc>) -> u64 {
    let seconds = (dt.timestamp() + FILETIME_UNIX_DIFF).max(0) as u64;
    seconds * FILETIME_TICKS_PER_SECOND + u64::from(dt.timestamp_subsec_nanos() / 100)
}

/// Current time as a FILETIME.
pub fn filetime_now() -> u64 {
    datetime_to_filetime(Utc::now())
}
