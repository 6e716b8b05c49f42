//! Error types for pmkv core.

use pmkv_pmem::PmemError;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in pmkv core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error outside of opening the pool file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration is missing a required field or has a malformed one.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// No engine is registered under this name.
    #[error("unknown engine: {name}")]
    EngineUnknown {
        /// The requested engine name.
        name: String,
    },

    /// The pool file cannot be created, opened or mapped.
    #[error("path unavailable: {}: {reason}", .path.display())]
    PathUnavailable {
        /// The pool path.
        path: PathBuf,
        /// Why the path could not be used.
        reason: String,
    },

    /// The heap cannot satisfy an allocation.
    #[error("out of space: cannot allocate {requested} bytes")]
    OutOfSpace {
        /// Requested payload size in bytes.
        requested: u64,
    },

    /// Keys must be non-empty.
    #[error("invalid key: keys must not be empty")]
    InvalidKey,

    /// The key has no record.
    #[error("key not found")]
    NotFound,

    /// Another store holds the pool open.
    #[error("pool already open: {}", .path.display())]
    AlreadyOpen {
        /// The pool path.
        path: PathBuf,
    },

    /// The store was closed or poisoned by a failed transaction.
    #[error("store is closed")]
    StoreClosed,

    /// The operation was called from a visitor of the same store and would
    /// wait on the iteration that is running it.
    #[error("{operation} cannot run inside an iteration of the same store")]
    Busy {
        /// The refused operation.
        operation: &'static str,
    },

    /// Persistent metadata failed validation.
    #[error("corrupt metadata: {message}")]
    CorruptMetadata {
        /// Description of the corruption.
        message: String,
    },

    /// The pool was written by an unsupported format version.
    #[error("format version mismatch: pool has major {found}, supported major is {supported}")]
    VersionMismatch {
        /// Major version found in the pool header.
        found: u16,
        /// Major version this build reads.
        supported: u16,
    },

    /// The mutation was rolled back; state is unchanged and it may be retried.
    #[error("transaction failed: {reason}")]
    TransactionFailed {
        /// Why the transaction failed.
        reason: String,
    },

    /// The engine does not offer this operation.
    #[error("{operation} is not supported by the {engine} engine")]
    NotSupported {
        /// The refused operation.
        operation: &'static str,
        /// Name of the engine.
        engine: &'static str,
    },
}

impl CoreError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a corrupt metadata error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptMetadata {
            message: message.into(),
        }
    }

    /// Creates a transaction failed error.
    pub fn transaction_failed(reason: impl Into<String>) -> Self {
        Self::TransactionFailed {
            reason: reason.into(),
        }
    }

    /// Creates a not supported error.
    pub fn not_supported(operation: &'static str, engine: &'static str) -> Self {
        Self::NotSupported { operation, engine }
    }

    /// Converts an error raised while creating or opening a pool file.
    ///
    /// Failures to reach the file become `PathUnavailable`, a held lock
    /// becomes `AlreadyOpen`.
    pub(crate) fn from_open(err: PmemError, path: &Path) -> Self {
        match err {
            PmemError::Locked { path } => Self::AlreadyOpen { path },
            PmemError::Io(err) => Self::PathUnavailable {
                path: path.to_path_buf(),
                reason: err.to_string(),
            },
            other => other.into(),
        }
    }

    /// Returns true if the failed operation left state unchanged and may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransactionFailed { .. } | Self::OutOfSpace { .. })
    }
}

impl From<PmemError> for CoreError {
    fn from(err: PmemError) -> Self {
        match err {
            PmemError::Io(err) => Self::Io(err),
            PmemError::OutOfBounds { offset, len, size } => Self::corrupt(format!(
                "access outside the pool: offset {offset}, len {len}, pool size {size}"
            )),
            PmemError::Locked { path } => Self::AlreadyOpen { path },
            PmemError::AlreadyExists { path } => Self::PathUnavailable {
                path,
                reason: "file exists; set force_create to overwrite it".into(),
            },
            PmemError::NotFound { path } => Self::PathUnavailable {
                path,
                reason: "file does not exist".into(),
            },
            PmemError::InvalidSize { size } => {
                Self::invalid_config(format!("region size {size} is not usable"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_errors_map_to_store_errors() {
        let path = PathBuf::from("/tmp/pool");

        let locked: CoreError = PmemError::Locked { path: path.clone() }.into();
        assert!(matches!(locked, CoreError::AlreadyOpen { .. }));

        let missing: CoreError = PmemError::NotFound { path: path.clone() }.into();
        assert!(matches!(missing, CoreError::PathUnavailable { .. }));

        let oob: CoreError = PmemError::OutOfBounds {
            offset: 10,
            len: 10,
            size: 12,
        }
        .into();
        assert!(matches!(oob, CoreError::CorruptMetadata { .. }));
    }

    #[test]
    fn open_io_errors_are_path_errors() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let mapped = CoreError::from_open(PmemError::Io(err), Path::new("/root/pool"));
        assert!(matches!(mapped, CoreError::PathUnavailable { .. }));
        assert!(mapped.to_string().contains("/root/pool"));
    }

    #[test]
    fn retryable_errors() {
        assert!(CoreError::transaction_failed("undo log full").is_retryable());
        assert!(CoreError::OutOfSpace { requested: 1 }.is_retryable());
        assert!(!CoreError::corrupt("bad magic").is_retryable());
        assert!(!CoreError::StoreClosed.is_retryable());
    }
}
