//! Error types for region operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for region operations.
pub type PmemResult<T> = Result<T, PmemError>;

/// Errors that can occur while mapping or accessing a region.
#[derive(Debug, Error)]
pub enum PmemError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An access touched bytes outside the region.
    #[error("access out of bounds: offset {offset}, len {len}, size {size}")]
    OutOfBounds {
        /// The requested offset.
        offset: u64,
        /// The requested length.
        len: u64,
        /// The region size.
        size: u64,
    },

    /// Another owner holds the region's lock.
    #[error("region is locked by another owner: {}", .path.display())]
    Locked {
        /// Path of the locked file.
        path: PathBuf,
    },

    /// Creation was refused because the file already exists.
    #[error("region already exists: {}", .path.display())]
    AlreadyExists {
        /// Path of the existing file.
        path: PathBuf,
    },

    /// The backing file does not exist.
    #[error("region not found: {}", .path.display())]
    NotFound {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// The requested or discovered size cannot back a region.
    #[error("invalid region size: {size}")]
    InvalidSize {
        /// The offending size in bytes.
        size: u64,
    },
}
