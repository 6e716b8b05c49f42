//! Typed access to the pool's region.

use crate::error::CoreResult;
use pmkv_pmem::PersistentMemory;

/// The pool's region plus its persist policy.
///
/// Every layer above the region goes through `Media`, so region errors
/// arrive as [`crate::CoreError`] and `sync_on_commit = false` turns every
/// persist into a no-op in one place.
pub(crate) struct Media {
    region: Box<dyn PersistentMemory>,
    sync: bool,
}

impl Media {
    pub(crate) fn new(region: Box<dyn PersistentMemory>, sync: bool) -> Self {
        Self { region, sync }
    }

    pub(crate) fn region(&self) -> &dyn PersistentMemory {
        self.region.as_ref()
    }

    pub(crate) fn into_region(self) -> Box<dyn PersistentMemory> {
        self.region
    }

    pub(crate) fn len(&self) -> u64 {
        self.region.len()
    }

    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> CoreResult<()> {
        Ok(self.region.read_at(offset, buf)?)
    }

    pub(crate) fn read_vec(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        Ok(self.region.read_vec(offset, len)?)
    }

    pub(crate) fn read_u64(&self, offset: u64) -> CoreResult<u64> {
        Ok(self.region.read_u64(offset)?)
    }

    pub(crate) fn read_u32(&self, offset: u64) -> CoreResult<u32> {
        Ok(self.region.read_u32(offset)?)
    }

    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> CoreResult<()> {
        Ok(self.region.write_at(offset, data)?)
    }

    pub(crate) fn write_u64(&self, offset: u64, value: u64) -> CoreResult<()> {
        Ok(self.region.write_u64(offset, value)?)
    }

    pub(crate) fn fill(&self, offset: u64, len: u64, byte: u8) -> CoreResult<()> {
        Ok(self.region.fill(offset, len, byte)?)
    }

    pub(crate) fn persist(&self, offset: u64, len: u64) -> CoreResult<()> {
        if self.sync {
            self.region.persist(offset, len)?;
        }
        Ok(())
    }

    pub(crate) fn persist_all(&self) -> CoreResult<()> {
        if self.sync {
            self.region.persist_all()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Media {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Media")
            .field("len", &self.region.len())
            .field("durable", &self.region.is_durable())
            .field("sync", &self.sync)
            .finish()
    }
}
