//! # pmkv core
//!
//! Pluggable key-value engines over a persistent memory pool.
//!
//! This crate provides:
//! - The pool: header, undo-log lanes and a block heap over one region
//! - Transactions that make every put and remove crash-atomic
//! - Three engines behind one [`Store`] facade:
//!   - `cmap`, a hash map with striped bucket locks, unordered
//!   - `stree`, a copy-on-write B+ tree whose readers never block
//!   - `radix`, a path-compressed trie over key nibbles
//!
//! ## Example
//!
//! ```rust
//! use pmkv_core::{EngineKind, Store};
//! use std::ops::ControlFlow;
//!
//! let store = Store::open_volatile(EngineKind::Radix, 16 << 20).unwrap();
//! store.put(b"John", b"123-456-789").unwrap();
//! store.put(b"Jane", b"987-654-321").unwrap();
//!
//! let mut names = Vec::new();
//! store
//!     .get_all(|key, _| {
//!         names.push(String::from_utf8_lossy(key).into_owned());
//!         ControlFlow::Continue(())
//!     })
//!     .unwrap();
//! assert_eq!(names, ["Jane", "John"]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod heap;
mod index;
mod iter;
pub mod pool;
mod record;
mod stats;
mod store;
mod transaction;
mod types;

pub use config::{
    Config, EngineTuning, DEFAULT_BUCKETS, DEFAULT_DEGREE, DEFAULT_LANES, DEFAULT_LANE_SIZE,
    MIN_POOL_SIZE,
};
pub use engine::{engines, lookup, EngineEntry};
pub use error::{CoreError, CoreResult};
pub use heap::HeapStats;
pub use iter::{KeyRange, ScanMode, Visitor, SCAN_BATCH};
pub use pool::header::{PoolHeader, FORMAT_MAJOR, FORMAT_MINOR};
pub use pool::{read_header, Pool};
pub use stats::StoreStats;
pub use store::{OpenMode, Store};
pub use transaction::{FailPoint, Transaction, TransactionState};
pub use types::{EngineKind, Handle};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
