//! # Windows Registry Hive Engine
//!
//! A read-write storage engine for the Windows registry hive file format,
//! built on memory-mapped I/O.
//!
//! ## Features
//!
//! - **In-place editing**: create, update, and delete keys and values
//!   directly in the mapped file, including multi-megabyte values
//! - **Cell allocator**: per-HBIN free lists with best-fit, splitting,
//!   and coalescing
//! - **Durable commits**: page-level dirty tracking, msync-based flushing,
//!   sequence numbers as the commit marker
//! - **Write strategies**: in-place, append-only, or hybrid cell reuse
//! - **Fast lookup**: an in-memory name index rebuilt from disk on open
//!
//! ## Architecture
//!
//! The engine is built on several layers:
//!
//! 1. **Base Block (Header)**: hive metadata, root key reference, and the
//!    paired sequence numbers
//! 2. **Hive Bins (hbin)**: 4KB-aligned blocks containing cells
//! 3. **Cells**: variable-sized units with a signed size prefix (negative
//!    when allocated, positive when free)
//! 4. **Key Nodes (nk)**: registry keys with subkeys and values
//! 5. **Value Keys (vk)**: registry values with typed data
//! 6. **Subkey Lists (lf/lh/li/ri)**: sorted, hash-hinted subkey indexes
//! 7. **Security (sk)**: shared, reference-counted security descriptors
//!
//! ## Binary Layout
//!
//! ```text
//! [Base Block - 4KB]
//!   - Signature: "regf"
//!   - Sequence numbers, version, root reference
//!   - Checksum
//!
//! [Hive Bins - variable size, 4KB aligned]
//!   [Hbin Header - 32 bytes]
//!     - Signature: "hbin"
//!     - Offset, size
//!
//!   [Cells - variable size]
//!     [Cell Size - 4 bytes, negative if allocated]
//!     [Cell Data]
//!       - Key nodes (nk)
//!       - Value keys (vk)
//!       - Subkey lists (lf/lh/li/ri)
//!       - Security descriptors (sk)
//!       - Big data (db) fan-outs
//! ```
//!
//! ## Examples
//!
//! ```no_run
//! use reg_engine::{CancelToken, CommitMode, Hive, ValueType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cancel = CancelToken::new();
//! let mut hive = Hive::open("SOFTWARE")?;
//!
//! let root = hive.root();
//! let (services, _created) =
//!     hive.ensure_key_path(root, &["CurrentControlSet", "Services"], &cancel)?;
//!
//! hive.upsert_value(services, "Start", ValueType::Dword, &2u32.to_le_bytes(), &cancel)?;
//! hive.commit(CommitMode::Auto, &cancel)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod bigdata;
pub mod cancel;
pub mod cell;
pub mod deferred;
pub mod dirty;
pub mod editor;
pub mod error;
pub mod hbin;
pub mod header;
pub mod hive;
pub mod index;
pub mod key;
pub mod mapping;
pub mod security;
pub mod strategy;
pub mod subkey_list;
pub mod utils;
pub mod value;
pub mod value_list;
pub mod walker;

// Re-export main types for convenience
pub use cancel::CancelToken;
pub use cell::{CellClass, CellType, KeyNodeFlags, ValueType};
pub use dirty::{CommitMode, DirtyTracker};
pub use editor::MAX_VALUE_DATA;
pub use error::{EngineError, Result};
pub use hbin::HbinHeader;
pub use header::BaseBlock;
pub use hive::Hive;
pub use key::KeyNode;
pub use security::DEFAULT_SECURITY_DESCRIPTOR;
pub use strategy::WriteStrategy;
pub use subkey_list::{SubkeyEntry, SubkeyList, SubkeyListType};
pub use value::{ValueData, ValueKey};
pub use walker::WalkControl;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
