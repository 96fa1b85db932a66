//! Error types for hive engine operations.
//!
//! Every failure surfaces to the caller as a tagged [`EngineError`]; the
//! engine never silently retries. Mid-edit failures leave the hive in the
//! state it was in before the failing mutation began.

use std::io;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while reading or mutating a hive.
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O error from the underlying file or mapping.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A cell reference is zero, the 0xFFFFFFFF sentinel, out of bounds,
    /// or points at a free cell.
    #[error("Invalid cell reference {reference:#x}: {reason}")]
    InvalidRef {
        /// The offending reference.
        reference: u32,
        /// Why the reference was rejected.
        reason: &'static str,
    },

    /// A key or value name is empty or fails the encoding rules.
    #[error("Invalid name {name:?}: {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Why the name was rejected.
        reason: &'static str,
    },

    /// A key lookup that must succeed did not.
    #[error("Key not found: {0:?}")]
    KeyNotFound(String),

    /// A value lookup that must succeed did not.
    #[error("Value not found: {0:?}")]
    ValueNotFound(String),

    /// The root key cannot be deleted.
    #[error("Cannot delete the root key")]
    CannotDeleteRoot,

    /// Non-recursive delete of a key that still has subkeys.
    #[error("Key has {count} subkeys; delete recursively or remove them first")]
    KeyHasSubkeys {
        /// Number of subkeys still present.
        count: u32,
    },

    /// Value data exceeds the sanity limit.
    #[error("Value data too large: {size} bytes (limit {limit})")]
    DataTooLarge {
        /// Requested data size.
        size: usize,
        /// The enforced limit.
        limit: usize,
    },

    /// Growing the hive file failed.
    #[error("Out of space growing the hive: {0}")]
    OutOfSpace(String),

    /// Base block signature, checksum, version, or geometry is invalid.
    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    /// Cell size out of bounds, cell beyond its HBIN, or a bad signature
    /// where one is required.
    #[error("Corrupt cell at {offset:#x}: {reason}")]
    CorruptCell {
        /// Hive-relative reference of the cell.
        offset: u32,
        /// What was wrong with it.
        reason: String,
    },

    /// The caller requested cancellation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Deferred subkey building was disabled while parents still held
    /// pending children.
    #[error("Deferred subkey builder still holds {parents} pending parents")]
    DeferredPending {
        /// Number of parents with unflushed children.
        parents: usize,
    },
}

impl EngineError {
    /// Creates an invalid-reference error with context.
    pub fn invalid_ref(reference: u32, reason: &'static str) -> Self {
        Self::InvalidRef { reference, reason }
    }

    /// Creates a corrupt-cell error with context.
    pub fn corrupt_cell(offset: u32, reason: impl Into<String>) -> Self {
        Self::CorruptCell {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a corrupt-header error.
    pub fn corrupt_header(reason: impl Into<String>) -> Self {
        Self::CorruptHeader(reason.into())
    }

    /// Creates an invalid-name error.
    pub fn invalid_name(name: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::invalid_ref(0xFFFFFFFF, "sentinel reference");
        assert!(err.to_string().contains("0xffffffff"));

        let err = EngineError::KeyHasSubkeys { count: 3 };
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
