//! Iteration protocol.
//!
//! Iteration runs on the caller's thread and never holds an engine lock
//! while the visitor runs:
//!
//! - `cmap` visits one bucket at a time, copying the bucket under its stripe
//!   read lock.
//! - `stree` and `radix` collect up to [`SCAN_BATCH`] entries in key order
//!   under the tree read lock, release it, visit them, and resume strictly
//!   after the last key of the batch.
//!
//! A record present for the whole call is visited exactly once by the
//! ordered engines and at least once by `cmap`. Records inserted or removed
//! meanwhile may or may not be seen. There is no snapshot isolation.

use crate::error::CoreResult;
use std::ops::{Bound, ControlFlow};

/// Entries collected per lock acquisition by ordered scans.
pub const SCAN_BATCH: usize = 256;

/// Callback invoked once per visited record.
pub type Visitor<'v> = dyn FnMut(&[u8], &[u8]) -> ControlFlow<()> + 'v;

/// What a scan reads for each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Keys and values.
    Pairs,
    /// Keys only; visitors receive an empty value.
    KeysOnly,
}

/// Bounds of a key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange<'a> {
    /// Lower bound.
    pub lower: Bound<&'a [u8]>,
    /// Upper bound.
    pub upper: Bound<&'a [u8]>,
}

impl<'a> KeyRange<'a> {
    /// Every key.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Keys strictly greater than `key`.
    #[must_use]
    pub const fn above(key: &'a [u8]) -> Self {
        Self {
            lower: Bound::Excluded(key),
            upper: Bound::Unbounded,
        }
    }

    /// Keys greater than or equal to `key`.
    #[must_use]
    pub const fn equal_above(key: &'a [u8]) -> Self {
        Self {
            lower: Bound::Included(key),
            upper: Bound::Unbounded,
        }
    }

    /// Keys strictly less than `key`.
    #[must_use]
    pub const fn below(key: &'a [u8]) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Excluded(key),
        }
    }

    /// Keys less than or equal to `key`.
    #[must_use]
    pub const fn equal_below(key: &'a [u8]) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Included(key),
        }
    }

    /// Keys strictly between `low` and `high`.
    #[must_use]
    pub const fn between(low: &'a [u8], high: &'a [u8]) -> Self {
        Self {
            lower: Bound::Excluded(low),
            upper: Bound::Excluded(high),
        }
    }

    /// Returns true if neither bound is set.
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(
            (self.lower, self.upper),
            (Bound::Unbounded, Bound::Unbounded)
        )
    }

    /// Returns true if `key` lies at or past the lower bound.
    #[must_use]
    pub fn after_lower(&self, key: &[u8]) -> bool {
        match self.lower {
            Bound::Unbounded => true,
            Bound::Included(low) => key >= low,
            Bound::Excluded(low) => key > low,
        }
    }

    /// Returns true if `key` lies at or before the upper bound.
    #[must_use]
    pub fn before_upper(&self, key: &[u8]) -> bool {
        match self.upper {
            Bound::Unbounded => true,
            Bound::Included(high) => key <= high,
            Bound::Excluded(high) => key < high,
        }
    }

    /// Returns true if `key` lies inside the range.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.after_lower(key) && self.before_upper(key)
    }
}

/// One collected entry.
pub(crate) type Entry = (Vec<u8>, Vec<u8>);

/// Drives an ordered scan in batches.
///
/// `collect` is called with the current range and must return up to
/// `SCAN_BATCH` entries inside it in ascending key order. It is expected to
/// take and release the engine's read lock itself.
pub(crate) fn drive_batches(
    range: &KeyRange<'_>,
    visitor: &mut Visitor<'_>,
    mut collect: impl FnMut(&KeyRange<'_>) -> CoreResult<Vec<Entry>>,
) -> CoreResult<ControlFlow<()>> {
    let mut resume: Option<Vec<u8>> = None;
    loop {
        let current = KeyRange {
            lower: resume
                .as_deref()
                .map_or(range.lower, Bound::Excluded),
            upper: range.upper,
        };
        let batch = collect(&current)?;
        let full = batch.len() >= SCAN_BATCH;
        for (key, value) in &batch {
            if visitor(key, value).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        match batch.into_iter().last() {
            Some((key, _)) if full => resume = Some(key),
            _ => return Ok(ControlFlow::Continue(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn model(n: usize) -> BTreeMap<Vec<u8>, Vec<u8>> {
        (0..n)
            .map(|i| (format!("key{i:05}").into_bytes(), i.to_string().into_bytes()))
            .collect()
    }

    fn collector<'m>(
        model: &'m BTreeMap<Vec<u8>, Vec<u8>>,
        calls: &'m mut usize,
    ) -> impl FnMut(&KeyRange<'_>) -> CoreResult<Vec<Entry>> + 'm {
        move |range| {
            *calls += 1;
            Ok(model
                .iter()
                .filter(|(k, _)| range.contains(k))
                .take(SCAN_BATCH)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    #[test]
    fn visits_every_entry_once_across_batches() {
        let model = model(SCAN_BATCH * 2 + 17);
        let mut calls = 0;
        let mut seen = Vec::new();
        let flow = drive_batches(
            &KeyRange::all(),
            &mut |k: &[u8], _: &[u8]| {
                seen.push(k.to_vec());
                ControlFlow::Continue(())
            },
            collector(&model, &mut calls),
        )
        .unwrap();
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(seen, model.keys().cloned().collect::<Vec<_>>());
        assert_eq!(calls, 3);
    }

    #[test]
    fn exact_batch_multiple_needs_an_empty_probe() {
        let model = model(SCAN_BATCH);
        let mut calls = 0;
        let mut n = 0;
        drive_batches(
            &KeyRange::all(),
            &mut |_: &[u8], _: &[u8]| {
                n += 1;
                ControlFlow::Continue(())
            },
            collector(&model, &mut calls),
        )
        .unwrap();
        assert_eq!(n, SCAN_BATCH);
        assert_eq!(calls, 2);
    }

    #[test]
    fn visitor_can_stop() {
        let model = model(1000);
        let mut calls = 0;
        let mut n = 0;
        let flow = drive_batches(
            &KeyRange::all(),
            &mut |_: &[u8], _: &[u8]| {
                n += 1;
                if n == 10 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
            collector(&model, &mut calls),
        )
        .unwrap();
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(n, 10);
        assert_eq!(calls, 1);
    }

    #[test]
    fn range_bounds() {
        assert!(KeyRange::above(b"b").contains(b"c"));
        assert!(!KeyRange::above(b"b").contains(b"b"));
        assert!(KeyRange::equal_above(b"b").contains(b"b"));
        assert!(KeyRange::below(b"b").contains(b"a"));
        assert!(!KeyRange::below(b"b").contains(b"b"));
        assert!(KeyRange::equal_below(b"b").contains(b"b"));
        assert!(KeyRange::between(b"a", b"c").contains(b"b"));
        assert!(!KeyRange::between(b"a", b"c").contains(b"a"));
        assert!(!KeyRange::between(b"a", b"c").contains(b"c"));
        assert!(KeyRange::all().is_full());
        assert!(!KeyRange::above(b"a").is_full());
    }
}
