//! Property-based test generators using proptest.
//!
//! Provides strategies for keys, values and operation sequences, and a
//! `BTreeMap` model that a store can be checked against.

use pmkv_core::{CoreResult, Store};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::ops::{Bound, ControlFlow};

/// Strategy for keys drawn from a small alphabet.
///
/// Short keys over few symbols collide and share prefixes often, which is
/// what exercises replacement, bucket chains and trie splits.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(vec![0u8, 1, b'a', b'b', 0x7f, 0xff]), 1..6)
}

/// Strategy for arbitrary non-empty keys.
pub fn wide_key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..64)
}

/// Strategy for values, including empty ones.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// One store operation.
#[derive(Debug, Clone)]
pub enum StoreOperation {
    /// Insert or replace a key
    Put {
        /// Key
        key: Vec<u8>,
        /// Value
        value: Vec<u8>,
    },
    /// Remove a key
    Remove {
        /// Key
        key: Vec<u8>,
    },
    /// Read a key
    Get {
        /// Key
        key: Vec<u8>,
    },
}

/// Strategy for generating store operations.
pub fn operation_strategy() -> impl Strategy<Value = StoreOperation> {
    prop_oneof![
        3 => (key_strategy(), value_strategy())
            .prop_map(|(key, value)| StoreOperation::Put { key, value }),
        1 => key_strategy().prop_map(|key| StoreOperation::Remove { key }),
        2 => key_strategy().prop_map(|key| StoreOperation::Get { key }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<StoreOperation>> {
    prop::collection::vec(operation_strategy(), min_ops..max_ops)
}

/// Reference model of a store.
#[derive(Debug, Clone, Default)]
pub struct Model {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Model {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `op` to the model and to `store`, failing on the first
    /// disagreement.
    pub fn apply(&mut self, store: &Store, op: &StoreOperation) -> Result<(), String> {
        match op {
            StoreOperation::Put { key, value } => {
                store.put(key, value).map_err(|e| e.to_string())?;
                self.entries.insert(key.clone(), value.clone());
            }
            StoreOperation::Remove { key } => {
                let removed = store.remove(key).map_err(|e| e.to_string())?;
                let expected = self.entries.remove(key).is_some();
                if removed != expected {
                    return Err(format!("remove {key:?} returned {removed}, model {expected}"));
                }
            }
            StoreOperation::Get { key } => {
                let found = store.get(key).map_err(|e| e.to_string())?;
                if found.as_ref() != self.entries.get(key) {
                    return Err(format!("get {key:?} returned {found:?}"));
                }
            }
        }
        Ok(())
    }

    /// Returns the model entries in key order.
    pub fn entries(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.entries
    }

    /// Returns the model entries inside the bounds, in key order.
    pub fn range(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let empty = match (lower, upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u)) => l >= u,
            _ => false,
        };
        if empty {
            return Vec::new();
        }
        self.entries
            .range::<[u8], _>((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Checks count, point reads and full iteration of `store` against the model.
    ///
    /// `ordered` also checks that iteration follows key order.
    pub fn check(&self, store: &Store, ordered: bool) -> Result<(), String> {
        let count = store.count_all().map_err(|e| e.to_string())?;
        if count != self.entries.len() as u64 {
            return Err(format!("count {count}, model {}", self.entries.len()));
        }
        for (key, value) in &self.entries {
            let found = store.get(key).map_err(|e| e.to_string())?;
            if found.as_ref() != Some(value) {
                return Err(format!("get {key:?} returned {found:?}"));
            }
        }

        let mut visited = Vec::new();
        store
            .get_all(|k, v| {
                visited.push((k.to_vec(), v.to_vec()));
                ControlFlow::Continue(())
            })
            .map_err(|e| e.to_string())?;
        if !ordered {
            visited.sort();
        }
        let expected: Vec<_> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if visited != expected {
            return Err(format!(
                "iteration visited {} entries, model has {}",
                visited.len(),
                expected.len()
            ));
        }
        Ok(())
    }
}

/// Collects the entries a store visits inside the bounds.
pub fn scan_store(
    store: &Store,
    lower: Bound<&[u8]>,
    upper: Bound<&[u8]>,
) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    store.scan(lower, upper, |k, v| {
        out.push((k.to_vec(), v.to_vec()));
        ControlFlow::Continue(())
    })?;
    Ok(out)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
