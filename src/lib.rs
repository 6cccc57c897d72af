//! # Unified Registry Access
//!
//! One key/value interface over three very different registry backends:
//!
//! - **Live**: the running system's registry (Windows only; elsewhere every
//!   live call reports [`RegistryError::BackendUnavailable`])
//! - **Offline**: a hive file opened without mounting it, through the
//!   [`HiveApi`] seam; the bundled [`RegfHiveApi`] reads and writes regf files
//! - **Virtual**: an in-memory tree parsed from a `.reg` export file
//!
//! On top of the backends sit path canonicalization, symbolic link
//! resolution across hives, recursive search, and an undo/redo log.
//!
//! ## Architecture
//!
//! 1. **Addresses**: a [`NodeAddress`] names a key by backend root plus path.
//!    It is plain data and never holds a handle open.
//! 2. **Context**: [`RegistryContext`] owns the shared tables (registered
//!    virtual roots, open offline hives, link cache, host facts).
//! 3. **Dispatcher**: [`BackendDispatcher`] routes each operation by the
//!    address's tagged root.
//! 4. **Services**: [`PathNormalizer`], [`SymbolicLinkResolver`],
//!    [`search`](search::search) and [`UndoableOperationLog`] are built on the
//!    dispatcher.
//!
//! ## Examples
//!
//! ### Editing a `.reg` file as a registry
//!
//! ```rust
//! use std::sync::Arc;
//! use unireg::{regfile, BackendDispatcher, ValueEntry, VirtualRegistryData};
//!
//! let text = "Windows Registry Editor Version 5.00\r\n\r\n\
//!             [HKEY_CURRENT_USER\\Software\\Demo]\r\n\
//!             \"Count\"=dword:000000ff\r\n";
//! let parsed = regfile::parse(text);
//! assert!(parsed.diagnostics.is_empty());
//!
//! let dispatcher = BackendDispatcher::default();
//! let root = dispatcher.register_virtual_root(Arc::new(VirtualRegistryData::new("demo.reg", parsed.root)));
//! let demo = root.child("HKEY_CURRENT_USER").child("Software").child("Demo");
//!
//! assert_eq!(dispatcher.query_value(&demo, "count").unwrap().data, 255u32.to_le_bytes());
//! assert!(dispatcher.set_value(&demo, &ValueEntry::string("Name", "demo")));
//! let exported = regfile::export_node(&dispatcher, &root).unwrap();
//! assert!(exported.contains("\"Name\"=\"demo\""));
//! ```
//!
//! ### Writing and reopening an offline hive
//!
//! ```no_run
//! use unireg::{BackendDispatcher, BackendRoot, ValueEntry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = BackendDispatcher::default();
//! let root = dispatcher.create_offline_hive("SOFTWARE", Some("HKLM\\SOFTWARE"))?;
//! let key = root.child("Vendor");
//! dispatcher.try_create_key(&key)?;
//! dispatcher.try_set_value(&key, &ValueEntry::dword("Enabled", 1))?;
//!
//! if let BackendRoot::Offline(hive) = &root.root {
//!     dispatcher.save_offline_hive(*hive, "software.hiv")?;
//!     dispatcher.close_offline_hive(*hive)?;
//! }
//! let reopened = dispatcher.open_offline_hive("software.hiv", "SOFTWARE", None)?;
//! assert!(dispatcher.key_exists(&reopened.child("Vendor")));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod hive;
pub mod live;
pub mod normalize;
pub mod offline;
pub mod path;
pub mod regfile;
pub mod search;
pub mod symlink;
pub mod undo;
pub mod utils;
pub mod value;
pub mod virtual_tree;

// Re-export main types for convenience
pub use config::{DriveMapping, RegistryConfig};
pub use context::RegistryContext;
pub use dispatch::{BackendDispatcher, StreamOptions};
pub use error::{RegistryError, Result};
pub use hive::RegfHiveApi;
pub use live::LiveBackend;
pub use normalize::PathNormalizer;
pub use offline::{HiveApi, OfflineBackend, OfflineHiveHandle};
pub use path::{build_path, root_name, BackendRoot, KeyInfo, KeyPath, NodeAddress, PredefinedKey};
pub use search::{SearchHit, SearchMatcher, SearchQuery};
pub use symlink::SymbolicLinkResolver;
pub use undo::{KeySnapshot, UndoOperation, UndoableOperationLog};
pub use value::{ValueData, ValueEntry, ValueType};
pub use virtual_tree::{VirtualRegistryData, VirtualRegistryKey};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
