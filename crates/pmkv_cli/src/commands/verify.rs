//! Verify command implementation.

use pmkv_core::{CoreError, Store};
use std::path::Path;

/// Runs the verify command.
///
/// Recovery runs first; the heap chain and the engine structure are then
/// walked and every record checksum is checked.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying pool at {}", path.display());
    match verify(path) {
        Ok(entries) => {
            println!("OK: {entries} entries, heap and index consistent");
            Ok(())
        }
        Err(err) => {
            println!("FAILED: {err}");
            Err(err.into())
        }
    }
}

/// Opens and verifies the pool at `path`, returning the entry count.
pub fn verify(path: &Path) -> Result<u64, CoreError> {
    let store = Store::open_path(path)?;
    let entries = store.verify()?;
    tracing::debug!(entries, "verification finished");
    store.close()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmkv_core::{Config, EngineKind, MIN_POOL_SIZE};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn pool(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("pool");
        let config = Config::new(&path).size(MIN_POOL_SIZE).force_create(true);
        let store = Store::open_with_config(EngineKind::CMap, &config).unwrap();
        for i in 0..10u8 {
            store.put(&[b'k', i], &[i; 16]).unwrap();
        }
        store.close().unwrap();
        path
    }

    #[test]
    fn healthy_pool_verifies() {
        let dir = TempDir::new().unwrap();
        let path = pool(&dir);
        assert_eq!(verify(&path).unwrap(), 10);
    }

    #[test]
    fn damaged_header_fails() {
        let dir = TempDir::new().unwrap();
        let path = pool(&dir);
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(20)).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        drop(file);

        assert!(matches!(
            verify(&path),
            Err(CoreError::CorruptMetadata { .. })
        ));
    }
}
