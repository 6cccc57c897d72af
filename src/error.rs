//! Error types for registry access across all backends.
//!
//! Every backend reports failures through [`RegistryError`]. The dispatcher's
//! boolean/`Option` surface swallows these after logging them; the `try_`
//! variants hand them to the caller so the OS error text can be shown.

use std::io;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while reading or mutating a registry backend.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// I/O error while reading or writing a hive or export file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key or value not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend refused access to the key or value.
    #[error("Access denied: {0}")]
    PermissionDenied(String),

    /// The backend is not available in this process (e.g. no hive API, or the
    /// live registry on a non-Windows host).
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A line of export text could not be parsed.
    #[error("Parse error at line {line}: {message}")]
    Parse {
        /// 1-based physical line number where the logical line started.
        line: usize,
        /// What was wrong with the line.
        message: String,
    },

    /// Symbolic link resolution revisited a path or ran out of depth.
    #[error("Symbolic link cycle at {path} (depth {depth})")]
    LinkCycle {
        /// Path at which the cycle was detected.
        path: String,
        /// Number of redirections followed.
        depth: usize,
    },

    /// A streaming callback asked to stop.
    #[error("Operation cancelled")]
    Cancelled,

    /// Target key or value name is already taken.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Non-recursive key delete on a key that still has subkeys.
    #[error("Key has subkeys: {0}")]
    HasSubkeys(String),

    /// The hive file is held by another open handle.
    #[error("Hive in use: {0}")]
    HiveInUse(String),

    /// Offline hive handle is unknown or already closed.
    #[error("Invalid hive handle: {0}")]
    InvalidHandle(u64),

    /// The supplied buffer is too small; retry with at least `required` bytes.
    #[error("Buffer too small: {required} bytes required")]
    MoreData {
        /// Minimum buffer size in bytes.
        required: usize,
    },

    /// A user-supplied search pattern failed validation.
    #[error("Invalid search pattern: {0}")]
    InvalidPattern(String),

    /// A path string could not be mapped to a registry address.
    #[error("Invalid registry path: {0}")]
    InvalidPath(String),

    /// Raw OS error code with its rendered message.
    #[error("OS error {code}: {message}")]
    Os {
        /// Win32 error code.
        code: u32,
        /// Rendered message.
        message: String,
    },

    /// Invalid magic signature in a hive structure.
    #[error("Invalid signature: expected {expected:?}, found {found:?}")]
    InvalidSignature {
        /// Expected signature bytes.
        expected: Vec<u8>,
        /// Signature bytes actually present.
        found: Vec<u8>,
    },

    /// Invalid hive format or corrupted data.
    #[error("Invalid hive format: {0}")]
    InvalidFormat(String),

    /// Cell offset is out of bounds.
    #[error("Invalid cell offset: {offset:#x} (hive size: {hive_size:#x})")]
    InvalidOffset {
        /// Offending cell offset.
        offset: u32,
        /// Size of the hive data.
        hive_size: usize,
    },

    /// Cell size is invalid or corrupted.
    #[error("Invalid cell size: {size} at offset {offset:#x}")]
    InvalidCellSize {
        /// Raw cell size field.
        size: i32,
        /// Cell offset.
        offset: u32,
    },

    /// Data truncated or incomplete.
    #[error("Truncated data at offset {offset:#x}: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        /// Offset of the structure being read.
        offset: u32,
        /// Bytes needed.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Invalid UTF-16 string data.
    #[error("Invalid UTF-16 string at offset {offset:#x}")]
    InvalidUtf16 {
        /// Offset of the string's cell.
        offset: u32,
    },

    /// Hive is too small to be valid.
    #[error("Hive too small: {size} bytes (minimum: {minimum} bytes)")]
    HiveTooSmall {
        /// Actual size.
        size: usize,
        /// Minimum size.
        minimum: usize,
    },

    /// Checksum mismatch in the hive base block.
    #[error("Checksum mismatch: expected {expected:#x}, calculated {calculated:#x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        calculated: u32,
    },

    /// Unsupported hive version.
    #[error("Unsupported hive version: {major}.{minor}")]
    UnsupportedVersion {
        /// Major version.
        major: u32,
        /// Minor version.
        minor: u32,
    },

    /// Invalid subkey list signature.
    #[error("Invalid subkey list type: {list_type:?}")]
    InvalidSubkeyList {
        /// Signature found.
        list_type: [u8; 2],
    },
}

impl RegistryError {
    /// Creates an invalid signature error with context.
    pub fn invalid_signature(expected: &[u8], found: &[u8]) -> Self {
        Self::InvalidSignature {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// Creates an invalid offset error with context.
    pub fn invalid_offset(offset: u32, hive_size: usize) -> Self {
        Self::InvalidOffset { offset, hive_size }
    }

    /// Creates an invalid cell size error with context.
    pub fn invalid_cell_size(size: i32, offset: u32) -> Self {
        Self::InvalidCellSize { size, offset }
    }

    /// Creates a format error with detailed context.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use unireg::error::RegistryError;
    /// let err = RegistryError::format_error(format!("bad list at {:#x}", 0x20));
    /// assert!(err.to_string().contains("0x20"));
    /// ```
    pub fn format_error(message: String) -> Self {
        Self::InvalidFormat(message)
    }

    /// Creates a not found error naming what was being looked up.
    ///
    /// # Arguments
    ///
    /// * `item_type` - Type of item (e.g., "key", "value")
    /// * `name` - Name of the item that wasn't found
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use unireg::error::RegistryError;
    /// let err = RegistryError::not_found("value", "DisplayName");
    /// assert_eq!(err.to_string(), "Not found: value 'DisplayName'");
    /// ```
    pub fn not_found(item_type: &str, name: &str) -> Self {
        Self::NotFound(format!("{} '{}'", item_type, name))
    }

    /// Creates a parse error for the given line.
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    /// Creates a backend-unavailable error.
    pub fn unavailable(what: impl Into<String>) -> Self {
        Self::BackendUnavailable(what.into())
    }

    /// Returns true for errors that mean "the key or value is simply absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
