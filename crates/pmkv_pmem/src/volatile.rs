//! Anonymous memory region for tests and scratch stores.

use crate::error::{PmemError, PmemResult};
use crate::raw::RawRegion;
use crate::region::PersistentMemory;
use memmap2::{MmapMut, MmapOptions};

/// A region backed by anonymous memory.
///
/// Nothing survives the process. `persist` only validates its range, so
/// the region behaves like a pool whose media never fails. Tests capture
/// the bytes with [`VolatileRegion::image`] and rebuild a region from them
/// with [`VolatileRegion::from_image`] to simulate a restart.
#[derive(Debug)]
pub struct VolatileRegion {
    raw: RawRegion,
    _map: MmapMut,
}

impl VolatileRegion {
    /// Creates a zero-filled region of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSize` for zero or unaddressable sizes, or an I/O error
    /// if the mapping fails.
    pub fn new(size: u64) -> PmemResult<Self> {
        let len = usize::try_from(size)
            .ok()
            .filter(|len| *len > 0)
            .ok_or(PmemError::InvalidSize { size })?;
        let mut map = MmapOptions::new().len(len).map_anon()?;
        let raw = RawRegion::new(map.as_mut_ptr(), map.len());
        Ok(Self { raw, _map: map })
    }

    /// Creates a region holding a copy of `image`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSize` for an empty image.
    pub fn from_image(image: &[u8]) -> PmemResult<Self> {
        let region = Self::new(image.len() as u64)?;
        region.raw.write(0, image)?;
        Ok(region)
    }

    /// Returns a copy of every byte in the region.
    #[must_use]
    pub fn image(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.raw.len() as usize];
        // the full range is always in bounds
        let _ = self.raw.read(0, &mut out);
        out
    }
}

impl PersistentMemory for VolatileRegion {
    fn len(&self) -> u64 {
        self.raw.len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> PmemResult<()> {
        self.raw.read(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> PmemResult<()> {
        self.raw.write(offset, data)
    }

    fn persist(&self, offset: u64, len: u64) -> PmemResult<()> {
        self.raw.check(offset, len).map(|_| ())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
