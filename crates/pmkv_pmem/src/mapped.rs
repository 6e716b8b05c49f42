//! Memory-mapped file region.

use crate::error::{PmemError, PmemResult};
use crate::raw::RawRegion;
use crate::region::PersistentMemory;
use fs2::FileExt;
use memmap2::{MmapOptions, MmapRaw};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// A region backed by a memory-mapped file.
///
/// The file is mapped shared, so stores land in the page cache and
/// `persist` pushes the covered pages to the device with `msync`.
///
/// # Ownership
///
/// The region holds an exclusive advisory lock on its file for its whole
/// lifetime. A second `create` or `open` of the same path, from this or any
/// other process, fails with [`PmemError::Locked`]. Dropping the region
/// unmaps the file and releases the lock.
///
/// # Example
///
/// ```no_run
/// use pmkv_pmem::{MappedRegion, PersistentMemory};
/// use std::path::Path;
///
/// let region = MappedRegion::create(Path::new("pool.pmkv"), 8 << 20, false).unwrap();
/// region.write_at(0, b"durable").unwrap();
/// region.persist(0, 7).unwrap();
/// ```
#[derive(Debug)]
pub struct MappedRegion {
    raw: RawRegion,
    map: MmapRaw,
    path: PathBuf,
    file: File,
}

impl MappedRegion {
    /// Creates a zero-filled file of `size` bytes and maps it.
    ///
    /// An existing file is only replaced when `overwrite` is set; its lock is
    /// taken before truncation so an open pool is never clobbered.
    ///
    /// # Errors
    ///
    /// - `InvalidSize` if `size` is zero or unaddressable
    /// - `AlreadyExists` if the file exists and `overwrite` is false
    /// - `Locked` if another owner has the file open
    /// - `Io` if the file cannot be created, sized or mapped
    pub fn create(path: &Path, size: u64, overwrite: bool) -> PmemResult<Self> {
        if size == 0 || usize::try_from(size).is_err() {
            return Err(PmemError::InvalidSize { size });
        }
        if !overwrite && path.exists() {
            return Err(PmemError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock(&file, path)?;

        file.set_len(0)?;
        file.set_len(size)?;
        file.sync_all()?;

        tracing::debug!(path = %path.display(), size, "created region file");
        Self::map(path, file)
    }

    /// Maps an existing file.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the file does not exist
    /// - `Locked` if another owner has the file open
    /// - `InvalidSize` if the file is empty
    /// - `Io` for any other open or mapping failure
    pub fn open(path: &Path) -> PmemResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => PmemError::NotFound {
                    path: path.to_path_buf(),
                },
                _ => PmemError::Io(err),
            })?;
        lock(&file, path)?;

        let size = file.metadata()?.len();
        if size == 0 || usize::try_from(size).is_err() {
            return Err(PmemError::InvalidSize { size });
        }
        Self::map(path, file)
    }

    fn map(path: &Path, file: File) -> PmemResult<Self> {
        let map = MmapOptions::new().map_raw(&file)?;
        let raw = RawRegion::new(map.as_mut_ptr(), map.len());
        Ok(Self {
            raw,
            map,
            path: path.to_path_buf(),
            file,
        })
    }

    /// Returns the size of the backing file as seen by the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn file_len(&self) -> PmemResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

fn lock(file: &File, path: &Path) -> PmemResult<()> {
    // non-blocking: a held lock means the pool is open elsewhere
    file.try_lock_exclusive().map_err(|_| PmemError::Locked {
        path: path.to_path_buf(),
    })
}

impl PersistentMemory for MappedRegion {
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
        let start = self.raw.check(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        self.map.flush_range(start, len as usize)?;
        Ok(())
    }

    fn persist_all(&self) -> PmemResult<()> {
        self.map.flush()?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SIZE: u64 = 1 << 20;

    #[test]
    fn create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        {
            let region = MappedRegion::create(&path, SIZE, false).unwrap();
            assert_eq!(region.len(), SIZE);
            assert_eq!(region.path(), Some(path.as_path()));
            region.write_at(4096, b"persistent data").unwrap();
            region.persist(4096, 15).unwrap();
        }

        let region = MappedRegion::open(&path).unwrap();
        assert_eq!(region.len(), SIZE);
        assert_eq!(region.read_vec(4096, 15).unwrap(), b"persistent data");
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");
        drop(MappedRegion::create(&path, SIZE, false).unwrap());

        let result = MappedRegion::create(&path, SIZE, false);
        assert!(matches!(result, Err(PmemError::AlreadyExists { .. })));
    }

    #[test]
    fn overwrite_zeroes_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");
        {
            let region = MappedRegion::create(&path, SIZE, false).unwrap();
            region.write_at(0, b"old").unwrap();
            region.persist_all().unwrap();
        }

        let region = MappedRegion::create(&path, SIZE * 2, true).unwrap();
        assert_eq!(region.len(), SIZE * 2);
        assert_eq!(region.file_len().unwrap(), SIZE * 2);
        assert_eq!(region.read_vec(0, 3).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn open_missing_file() {
        let dir = tempdir().unwrap();
        let result = MappedRegion::open(&dir.path().join("missing"));
        assert!(matches!(result, Err(PmemError::NotFound { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");
        let _region = MappedRegion::create(&path, SIZE, false).unwrap();

        assert!(matches!(
            MappedRegion::open(&path),
            Err(PmemError::Locked { .. })
        ));
        assert!(matches!(
            MappedRegion::create(&path, SIZE, true),
            Err(PmemError::Locked { .. })
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");
        drop(MappedRegion::create(&path, SIZE, false).unwrap());

        assert!(MappedRegion::open(&path).is_ok());
    }

    #[test]
    fn zero_size_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");
        assert!(matches!(
            MappedRegion::create(&path, 0, false),
            Err(PmemError::InvalidSize { size: 0 })
        ));

        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            MappedRegion::open(&path),
            Err(PmemError::InvalidSize { size: 0 })
        ));
    }

    #[test]
    fn persist_checks_bounds() {
        let dir = tempdir().unwrap();
        let region = MappedRegion::create(&dir.path().join("pool"), SIZE, false).unwrap();
        assert!(region.persist(SIZE - 8, 8).is_ok());
        assert!(region.persist(SIZE - 8, 9).is_err());
        assert!(region.persist(0, 0).is_ok());
    }
}
