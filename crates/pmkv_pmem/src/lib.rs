//! # pmkv pmem
//!
//! Persistent memory regions for pmkv.
//!
//! This crate is the lowest layer of pmkv. A region is a fixed-size,
//! byte-addressable area that can be read and written at arbitrary offsets
//! and explicitly persisted. Regions are **opaque** - they know nothing about
//! pools, heaps, logs or engines.
//!
//! ## Design Principles
//!
//! - Fixed size, chosen when the region is created
//! - Writes become durable only after `persist` covers them
//! - Exclusive ownership: a file-backed region holds an advisory lock
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Regions
//!
//! - [`MappedRegion`] - A memory-mapped file, the persistent case
//! - [`VolatileRegion`] - Anonymous memory for tests and scratch stores
//!
//! ## Example
//!
//! ```rust
//! use pmkv_pmem::{PersistentMemory, VolatileRegion};
//!
//! let region = VolatileRegion::new(4096).unwrap();
//! region.write_at(128, b"hello world").unwrap();
//! region.persist(128, 11).unwrap();
//! assert_eq!(region.read_vec(128, 11).unwrap(), b"hello world");
//! ```

#![warn(missing_docs)]

mod error;
mod mapped;
mod raw;
mod region;
mod volatile;

pub use error::{PmemError, PmemResult};
pub use mapped::MappedRegion;
pub use region::PersistentMemory;
pub use volatile::VolatileRegion;
