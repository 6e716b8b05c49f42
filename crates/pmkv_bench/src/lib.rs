//! Benchmark utilities shared by the pmkv benches.

#![warn(missing_docs)]

pub mod utils;
