//! Live registry access through the Win32 registry API.

use crate::config::DriveMapping;
use crate::dispatch::StreamOptions;
use crate::error::{RegistryError, Result};
use crate::path::{KeyInfo, KeyPath, PredefinedKey};
use crate::utils::{filetime_to_datetime, utf16_lossy, wide_nul};
use crate::value::{ValueEntry, ValueType, SYMBOLIC_LINK_VALUE};
use std::ptr;
use tracing::debug;
use windows_sys::Win32::Foundation::{
    CloseHandle, LocalFree, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_MORE_DATA,
    ERROR_NO_MORE_ITEMS, ERROR_PATH_NOT_FOUND, ERROR_SUCCESS, FILETIME, HANDLE, WIN32_ERROR,
};
use windows_sys::Win32::Security::Authorization::ConvertSidToStringSidW;
use windows_sys::Win32::Security::{GetTokenInformation, TokenUser, TOKEN_QUERY, TOKEN_USER};
use windows_sys::Win32::Storage::FileSystem::{GetLogicalDriveStringsW, QueryDosDeviceW};
use windows_sys::Win32::System::Registry::{
    RegCloseKey, RegCreateKeyExW, RegDeleteTreeW, RegDeleteValueW, RegEnumKeyExW, RegEnumValueW,
    RegOpenKeyExW, RegQueryInfoKeyW, RegQueryValueExW, RegRenameKey, RegSetValueExW, HKEY,
    HKEY_CLASSES_ROOT, HKEY_CURRENT_CONFIG, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, HKEY_USERS,
    KEY_ALL_ACCESS, KEY_CREATE_LINK, KEY_QUERY_VALUE, KEY_READ, KEY_SET_VALUE, KEY_WRITE,
    REG_OPTION_CREATE_LINK, REG_OPTION_NON_VOLATILE, REG_OPTION_OPEN_LINK, REG_SAM_FLAGS,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

/// Longest key name the registry allows, plus the terminator.
const MAX_KEY_NAME: usize = 256;

/// Open registry key, closed on drop.
struct OwnedKey(HKEY);

impl Drop for OwnedKey {
    fn drop(&mut self) {
        // SAFETY: the handle came from a successful open/create and is closed once.
        unsafe {
            RegCloseKey(self.0);
        }
    }
}

fn predefined(root: PredefinedKey) -> HKEY {
    match root {
        PredefinedKey::ClassesRoot => HKEY_CLASSES_ROOT,
        PredefinedKey::CurrentUser => HKEY_CURRENT_USER,
        PredefinedKey::LocalMachine => HKEY_LOCAL_MACHINE,
        PredefinedKey::Users => HKEY_USERS,
        PredefinedKey::CurrentConfig => HKEY_CURRENT_CONFIG,
    }
}

fn check(code: WIN32_ERROR, what: impl FnOnce() -> String) -> Result<()> {
    match code {
        ERROR_SUCCESS => Ok(()),
        ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => Err(RegistryError::NotFound(what())),
        ERROR_ACCESS_DENIED => Err(RegistryError::PermissionDenied(what())),
        other => Err(RegistryError::Os {
            code: other,
            message: format!("{}: {}", what(), std::io::Error::from_raw_os_error(other as i32)),
        }),
    }
}

fn describe(root: PredefinedKey, path: &KeyPath) -> String {
    if path.is_empty() {
        root.full_name().to_string()
    } else {
        format!("{}\\{}", root.full_name(), path)
    }
}

fn open(root: PredefinedKey, path: &KeyPath, access: REG_SAM_FLAGS, options: u32) -> Result<OwnedKey> {
    let subkey = wide_nul(&path.to_string());
    let mut key: HKEY = ptr::null_mut();
    // SAFETY: `subkey` is NUL-terminated and outlives the call; `key` is a valid out pointer.
    let code = unsafe { RegOpenKeyExW(predefined(root), subkey.as_ptr(), options, access, &mut key) };
    check(code, || describe(root, path))?;
    Ok(OwnedKey(key))
}

fn from_wide(buffer: &[u16], len: usize) -> String {
    String::from_utf16_lossy(&buffer[..len.min(buffer.len())])
}

fn enum_key(key: &OwnedKey, index: u32) -> Result<Option<String>> {
    let mut name = [0u16; MAX_KEY_NAME];
    let mut len = name.len() as u32;
    // SAFETY: the buffer and length describe valid writable memory.
    let code = unsafe {
        RegEnumKeyExW(
            key.0,
            index,
            name.as_mut_ptr(),
            &mut len,
            ptr::null(),
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    if code == ERROR_NO_MORE_ITEMS {
        return Ok(None);
    }
    check(code, || format!("subkey #{}", index))?;
    Ok(Some(from_wide(&name, len as usize)))
}

/// Direct subkey names.
pub fn subkey_names(root: PredefinedKey, path: &KeyPath) -> Result<Vec<String>> {
    let key = open(root, path, KEY_READ, 0)?;
    let mut names = Vec::new();
    while let Some(name) = enum_key(&key, names.len() as u32)? {
        names.push(name);
    }
    Ok(names)
}

fn query_info_raw(key: &OwnedKey) -> Result<(u32, u32, u32, u32, FILETIME)> {
    let (mut subkeys, mut values, mut max_name, mut max_data) = (0u32, 0u32, 0u32, 0u32);
    let mut written = FILETIME {
        dwLowDateTime: 0,
        dwHighDateTime: 0,
    };
    // SAFETY: every out pointer is valid; unused outputs are null.
    let code = unsafe {
        RegQueryInfoKeyW(
            key.0,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null(),
            &mut subkeys,
            ptr::null_mut(),
            ptr::null_mut(),
            &mut values,
            &mut max_name,
            &mut max_data,
            ptr::null_mut(),
            &mut written,
        )
    };
    check(code, || "key information".to_string())?;
    Ok((subkeys, values, max_name, max_data, written))
}

/// Counts and last write time.
pub fn info(root: PredefinedKey, path: &KeyPath) -> Result<KeyInfo> {
    let key = open(root, path, KEY_READ, 0)?;
    let (subkeys, values, _, max_data, written) = query_info_raw(&key)?;
    let filetime = (u64::from(written.dwHighDateTime) << 32) | u64::from(written.dwLowDateTime);
    Ok(KeyInfo {
        subkey_count: subkeys,
        value_count: values,
        last_write: filetime_to_datetime(filetime),
        max_value_data_len: max_data,
    })
}

/// Streams values, then subkey names.
pub fn stream(
    root: PredefinedKey,
    path: &KeyPath,
    options: StreamOptions,
    on_value: &mut dyn FnMut(ValueEntry) -> bool,
    on_subkey: &mut dyn FnMut(&str) -> bool,
) -> Result<bool> {
    let key = open(root, path, KEY_READ, 0)?;

    if options.values {
        let (_, _, max_name, max_data, _) = query_info_raw(&key)?;
        let mut name = vec![0u16; max_name as usize + 1];
        let mut data = vec![0u8; (max_data as usize).max(1)];
        let mut index = 0u32;
        loop {
            let mut name_len = name.len() as u32;
            let mut data_len = data.len() as u32;
            let mut value_type = 0u32;
            // SAFETY: buffers and lengths describe valid writable memory; a null
            // data pointer asks for metadata only.
            let code = unsafe {
                RegEnumValueW(
                    key.0,
                    index,
                    name.as_mut_ptr(),
                    &mut name_len,
                    ptr::null(),
                    &mut value_type,
                    if options.data { data.as_mut_ptr() } else { ptr::null_mut() },
                    if options.data { &mut data_len } else { ptr::null_mut() },
                )
            };
            match code {
                ERROR_NO_MORE_ITEMS => break,
                ERROR_MORE_DATA => {
                    // The value changed since the size query, or the name was
                    // longer than reported.
                    debug!(index, data_len, "Growing live value buffers");
                    name.resize(name.len() * 2, 0);
                    data.resize((data_len as usize).max(data.len() * 2), 0);
                    continue;
                }
                other => check(other, || format!("value #{} of {}", index, describe(root, path)))?,
            }

            let payload = if options.data {
                data[..data_len as usize].to_vec()
            } else {
                Vec::new()
            };
            let entry = ValueEntry::new(from_wide(&name, name_len as usize), ValueType::from_u32(value_type), payload);
            if !on_value(entry) {
                return Ok(false);
            }
            index += 1;
        }
    }

    if options.subkeys {
        let mut index = 0u32;
        while let Some(name) = enum_key(&key, index)? {
            if !on_subkey(&name) {
                return Ok(false);
            }
            index += 1;
        }
    }

    Ok(true)
}

fn query_raw(key: &OwnedKey, name: &str) -> Result<ValueEntry> {
    let wide = wide_nul(name);
    let mut value_type = 0u32;
    let mut len = 0u32;
    // SAFETY: size query; the data pointer is null.
    let code = unsafe {
        RegQueryValueExW(key.0, wide.as_ptr(), ptr::null(), &mut value_type, ptr::null_mut(), &mut len)
    };
    check(code, || format!("value '{}'", name))?;

    loop {
        let mut data = vec![0u8; len as usize];
        // SAFETY: `data` has `len` writable bytes.
        let code = unsafe {
            RegQueryValueExW(key.0, wide.as_ptr(), ptr::null(), &mut value_type, data.as_mut_ptr(), &mut len)
        };
        if code == ERROR_MORE_DATA {
            continue;
        }
        check(code, || format!("value '{}'", name))?;
        data.truncate(len as usize);
        return Ok(ValueEntry::new(name, ValueType::from_u32(value_type), data));
    }
}

/// Reads one value.
pub fn value(root: PredefinedKey, path: &KeyPath, name: &str) -> Result<ValueEntry> {
    let key = open(root, path, KEY_QUERY_VALUE, 0)?;
    query_raw(&key, name)
}

fn create(root: PredefinedKey, path: &KeyPath, options: u32, access: REG_SAM_FLAGS) -> Result<OwnedKey> {
    let subkey = wide_nul(&path.to_string());
    let mut key: HKEY = ptr::null_mut();
    let mut disposition = 0u32;
    // SAFETY: `subkey` is NUL-terminated; out pointers are valid.
    let code = unsafe {
        RegCreateKeyExW(
            predefined(root),
            subkey.as_ptr(),
            0,
            ptr::null(),
            options,
            access,
            ptr::null(),
            &mut key,
            &mut disposition,
        )
    };
    check(code, || describe(root, path))?;
    Ok(OwnedKey(key))
}

/// Creates a key and missing ancestors.
pub fn create_key(root: PredefinedKey, path: &KeyPath) -> Result<()> {
    create(root, path, REG_OPTION_NON_VOLATILE, KEY_READ | KEY_WRITE).map(drop)
}

/// Creates a link key pointing at an NT path.
pub fn create_link(root: PredefinedKey, path: &KeyPath, target: &str) -> Result<()> {
    let key = create(
        root,
        path,
        REG_OPTION_NON_VOLATILE | REG_OPTION_CREATE_LINK,
        KEY_WRITE | KEY_CREATE_LINK,
    )?;
    set_raw(&key, &ValueEntry::link(target))
}

/// Deletes a key with its subtree.
pub fn delete_key(root: PredefinedKey, path: &KeyPath) -> Result<()> {
    let (parent, name) = match (path.parent(), path.name()) {
        (Some(parent), Some(name)) => (parent, name),
        _ => return Err(RegistryError::InvalidPath("cannot delete a predefined key".to_string())),
    };
    let parent_key = open(root, &parent, KEY_ALL_ACCESS, 0)?;
    let wide = wide_nul(name);
    // With a subkey name the named key goes too, not just its descendants.
    // SAFETY: `wide` is NUL-terminated and outlives the call.
    let code = unsafe { RegDeleteTreeW(parent_key.0, wide.as_ptr()) };
    check(code, || describe(root, path))
}

/// Renames a key in place.
pub fn rename_key(root: PredefinedKey, path: &KeyPath, new_name: &str) -> Result<()> {
    let (parent, name) = match (path.parent(), path.name()) {
        (Some(parent), Some(name)) => (parent, name),
        _ => return Err(RegistryError::InvalidPath("cannot rename a predefined key".to_string())),
    };
    let parent_key = open(root, &parent, KEY_ALL_ACCESS, 0)?;
    let old = wide_nul(name);
    let new = wide_nul(new_name);
    // SAFETY: both names are NUL-terminated and outlive the call.
    let code = unsafe { RegRenameKey(parent_key.0, old.as_ptr(), new.as_ptr()) };
    check(code, || describe(root, path))
}

fn set_raw(key: &OwnedKey, value: &ValueEntry) -> Result<()> {
    let name = wide_nul(&value.name);
    // SAFETY: the data slice is valid for `len` bytes.
    let code = unsafe {
        RegSetValueExW(
            key.0,
            name.as_ptr(),
            0,
            value.value_type.as_u32(),
            value.data.as_ptr(),
            value.data.len() as u32,
        )
    };
    check(code, || format!("value '{}'", value.name))
}

/// Creates or replaces a value.
pub fn set_value(root: PredefinedKey, path: &KeyPath, value: &ValueEntry) -> Result<()> {
    let key = open(root, path, KEY_SET_VALUE, 0)?;
    set_raw(&key, value)
}

/// Deletes a value.
pub fn delete_value(root: PredefinedKey, path: &KeyPath, name: &str) -> Result<()> {
    let key = open(root, path, KEY_SET_VALUE, 0)?;
    let wide = wide_nul(name);
    // SAFETY: `wide` is NUL-terminated.
    let code = unsafe { RegDeleteValueW(key.0, wide.as_ptr()) };
    check(code, || format!("value '{}'", name))
}

/// Target of a link key; the key is opened as the link object itself.
pub fn link_target(root: PredefinedKey, path: &KeyPath) -> Result<Option<String>> {
    let key = open(root, path, KEY_QUERY_VALUE, REG_OPTION_OPEN_LINK)?;
    match query_raw(&key, SYMBOLIC_LINK_VALUE) {
        Ok(value) if value.value_type == ValueType::Link => {
            Ok(Some(utf16_lossy(&value.data).trim_end_matches('\0').to_string()))
        }
        Ok(_) => Ok(None),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// String SID of the user running this process.
pub fn current_user_sid() -> Option<String> {
    let mut token: HANDLE = ptr::null_mut();
    // SAFETY: the pseudo handle needs no cleanup; `token` is closed below.
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) } == 0 {
        return None;
    }

    let mut needed = 0u32;
    // SAFETY: size query with a null buffer.
    unsafe { GetTokenInformation(token, TokenUser, ptr::null_mut(), 0, &mut needed) };
    let mut buffer = vec![0u64; (needed as usize + 7) / 8 + 1];
    // SAFETY: `buffer` is 8-aligned and at least `needed` bytes.
    let ok = unsafe {
        GetTokenInformation(token, TokenUser, buffer.as_mut_ptr().cast(), needed, &mut needed)
    };
    let sid = if ok != 0 {
        // SAFETY: on success the buffer holds a TOKEN_USER.
        let user = unsafe { &*(buffer.as_ptr() as *const TOKEN_USER) };
        let mut text = ptr::null_mut();
        // SAFETY: the SID points into `buffer`; `text` is freed with LocalFree.
        if unsafe { ConvertSidToStringSidW(user.User.Sid, &mut text) } != 0 {
            let mut len = 0;
            // SAFETY: ConvertSidToStringSidW returns a NUL-terminated string.
            while unsafe { *text.add(len) } != 0 {
                len += 1;
            }
            // SAFETY: `len` units were just read.
            let s = String::from_utf16_lossy(unsafe { std::slice::from_raw_parts(text, len) });
            unsafe { LocalFree(text.cast()) };
            Some(s)
        } else {
            None
        }
    } else {
        None
    };

    // SAFETY: `token` came from OpenProcessToken.
    unsafe { CloseHandle(token) };
    sid
}

/// Device path behind every logical drive letter.
pub fn logical_drives() -> Vec<DriveMapping> {
    let mut buffer = vec![0u16; 512];
    // SAFETY: the buffer length is passed in characters.
    let len = unsafe { GetLogicalDriveStringsW(buffer.len() as u32, buffer.as_mut_ptr()) } as usize;
    if len == 0 || len > buffer.len() {
        return Vec::new();
    }

    buffer[..len]
        .split(|c| *c == 0)
        .filter(|root| !root.is_empty())
        .filter_map(|root| {
            let drive: String = String::from_utf16_lossy(root).trim_end_matches('\\').to_string();
            let name = wide_nul(&drive);
            let mut target = vec![0u16; 1024];
            // SAFETY: `name` is NUL-terminated; the target length is in characters.
            let written = unsafe { QueryDosDeviceW(name.as_ptr(), target.as_mut_ptr(), target.len() as u32) };
            if written == 0 {
                return None;
            }
            let end = target.iter().position(|c| *c == 0).unwrap_or(target.len());
            Some(DriveMapping::new(drive, String::from_utf16_lossy(&target[..end])))
        })
        .collect()
}
