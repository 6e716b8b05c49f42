//! Bounds-checked access to a mapped address range.

use crate::error::{PmemError, PmemResult};
use std::ptr;

/// A raw view of a live mapping.
///
/// The owner of the mapping keeps it alive for as long as this view exists;
/// both region types store the mapping next to its view and never remap.
#[derive(Debug)]
pub(crate) struct RawRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the view is a plain address range. Concurrent access to disjoint
// ranges is sound; pmkv's index and transaction locks serialize overlapping
// writers.
unsafe impl Send for RawRegion {}
// SAFETY: see above.
unsafe impl Sync for RawRegion {}

impl RawRegion {
    /// Wraps a mapping of `len` bytes starting at `ptr`.
    pub(crate) fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub(crate) fn len(&self) -> u64 {
        self.len as u64
    }

    /// Validates `offset..offset + len` and returns the start as `usize`.
    pub(crate) fn check(&self, offset: u64, len: u64) -> PmemResult<usize> {
        let end = offset.checked_add(len);
        match end {
            Some(end) if end <= self.len as u64 => Ok(offset as usize),
            _ => Err(PmemError::OutOfBounds {
                offset,
                len,
                size: self.len as u64,
            }),
        }
    }

    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> PmemResult<()> {
        let start = self.check(offset, buf.len() as u64)?;
        // SAFETY: `check` keeps the range inside the live mapping, and `buf`
        // cannot alias the mapping because it is a unique borrow.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.add(start), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> PmemResult<()> {
        let start = self.check(offset, data.len() as u64)?;
        // SAFETY: the range is inside the live mapping; `data` may point into
        // the mapping only through `read_vec` copies, never directly.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(start), data.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_rejects_overflowing_ranges() {
        let mut backing = vec![0u8; 64];
        let raw = RawRegion::new(backing.as_mut_ptr(), backing.len());

        assert!(raw.check(0, 64).is_ok());
        assert!(raw.check(60, 4).is_ok());
        assert!(matches!(
            raw.check(60, 5),
            Err(PmemError::OutOfBounds { size: 64, .. })
        ));
        assert!(raw.check(u64::MAX, 2).is_err());
    }

    #[test]
    fn read_write_through_view() {
        let mut backing = vec![0u8; 32];
        let raw = RawRegion::new(backing.as_mut_ptr(), backing.len());

        raw.write(8, b"abcd").unwrap();
        let mut out = [0u8; 4];
        raw.read(8, &mut out).unwrap();
        assert_eq!(&out, b"abcd");
        drop(raw);
        assert_eq!(&backing[8..12], b"abcd");
    }
}
