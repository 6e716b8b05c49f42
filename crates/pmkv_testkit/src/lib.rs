//! # pmkv testkit
//!
//! Test utilities for pmkv.
//!
//! This crate provides:
//! - Store fixtures over anonymous memory and temporary pool files
//! - A crash recovery harness built on fail points and a write-budget region
//! - Multi-threaded stress helpers
//! - Property-based generators and a `BTreeMap` model to check stores against
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pmkv_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_store() {
//!     for kind in ALL_ENGINES {
//!         with_temp_store(kind, |store| {
//!             store.put(b"key", b"value").unwrap();
//!         });
//!     }
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
