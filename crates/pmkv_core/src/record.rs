//! Record layout.
//!
//! A record is one heap block holding a key and its value:
//!
//! ```text
//! [key_len u64][value_len u64][crc32 u32][reserved u32][key][value]
//! ```
//!
//! The checksum covers `key || value`. Records are immutable once their
//! transaction commits; an update writes a new record and frees the old one.

use crate::error::{CoreError, CoreResult};
use crate::pool::Pool;
use crate::transaction::Transaction;
use crate::types::Handle;
use std::cmp::Ordering;

/// Bytes in front of the key.
pub(crate) const RECORD_HEADER: u64 = 24;

/// Writes a new record and returns its handle.
pub(crate) fn create(tx: &mut Transaction<'_>, key: &[u8], value: &[u8]) -> CoreResult<Handle> {
    let body = key.len() as u64 + value.len() as u64;
    let handle = tx.alloc(RECORD_HEADER + body)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    hasher.update(value);

    let mut buf = Vec::with_capacity((RECORD_HEADER + body) as usize);
    buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    tx.write(handle.as_u64(), &buf)?;
    Ok(handle)
}

struct Lengths {
    key: u64,
    value: u64,
}

fn lengths(pool: &Pool, handle: Handle) -> CoreResult<Lengths> {
    let media = pool.media();
    let key = media.read_u64(handle.as_u64())?;
    let value = media.read_u64(handle.at(8))?;
    let fits = key
        .checked_add(value)
        .and_then(|body| body.checked_add(handle.at(RECORD_HEADER)))
        .is_some_and(|end| end <= media.len());
    if !fits || key == 0 {
        return Err(CoreError::corrupt(format!(
            "record {handle} has impossible lengths {key}/{value}"
        )));
    }
    Ok(Lengths { key, value })
}

/// Reads the key of a record.
pub(crate) fn read_key(pool: &Pool, handle: Handle) -> CoreResult<Vec<u8>> {
    let lengths = lengths(pool, handle)?;
    pool.media()
        .read_vec(handle.at(RECORD_HEADER), lengths.key as usize)
}

/// Reads the value of a record.
pub(crate) fn read_value(pool: &Pool, handle: Handle) -> CoreResult<Vec<u8>> {
    let lengths = lengths(pool, handle)?;
    pool.media()
        .read_vec(handle.at(RECORD_HEADER + lengths.key), lengths.value as usize)
}

/// Reads key and value with one header read.
pub(crate) fn read_pair(pool: &Pool, handle: Handle) -> CoreResult<(Vec<u8>, Vec<u8>)> {
    let lengths = lengths(pool, handle)?;
    let mut buf = pool.media().read_vec(
        handle.at(RECORD_HEADER),
        (lengths.key + lengths.value) as usize,
    )?;
    let value = buf.split_off(lengths.key as usize);
    Ok((buf, value))
}

/// Compares the record's key with `key`.
pub(crate) fn compare_key(pool: &Pool, handle: Handle, key: &[u8]) -> CoreResult<Ordering> {
    Ok(read_key(pool, handle)?.as_slice().cmp(key))
}

/// Checks the block header and the checksum of a record.
pub(crate) fn verify(pool: &Pool, handle: Handle) -> CoreResult<()> {
    let block = pool.heap().block_of(pool.media(), handle)?;
    let lengths = lengths(pool, handle)?;
    if RECORD_HEADER + lengths.key + lengths.value > block.capacity() {
        return Err(CoreError::corrupt(format!(
            "record {handle} overruns its block"
        )));
    }
    let (key, value) = read_pair(pool, handle)?;
    let stored = pool.media().read_u32(handle.at(16))?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key);
    hasher.update(&value);
    if hasher.finalize() != stored {
        return Err(CoreError::corrupt(format!(
            "record {handle} failed its checksum"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineTuning;
    use crate::types::EngineKind;
    use pmkv_pmem::VolatileRegion;

    fn pool() -> Pool {
        let tuning = EngineTuning {
            lanes: 2,
            lane_size: 8192,
            ..EngineTuning::default()
        };
        Pool::create(
            Box::new(VolatileRegion::new(8 << 20).unwrap()),
            EngineKind::CMap,
            &tuning,
            true,
            |tx| tx.alloc(8),
        )
        .unwrap()
    }

    fn put(pool: &Pool, key: &[u8], value: &[u8]) -> Handle {
        let mut tx = pool.begin().unwrap();
        let handle = create(&mut tx, key, value).unwrap();
        tx.commit().unwrap();
        handle
    }

    #[test]
    fn reads_back_parts() {
        let pool = pool();
        let handle = put(&pool, b"John", b"123-456-789");
        assert_eq!(read_key(&pool, handle).unwrap(), b"John");
        assert_eq!(read_value(&pool, handle).unwrap(), b"123-456-789");
        assert_eq!(
            read_pair(&pool, handle).unwrap(),
            (b"John".to_vec(), b"123-456-789".to_vec())
        );
        assert_eq!(compare_key(&pool, handle, b"Kate").unwrap(), Ordering::Less);
        assert_eq!(compare_key(&pool, handle, b"John").unwrap(), Ordering::Equal);
        assert!(verify(&pool, handle).is_ok());
    }

    #[test]
    fn empty_value_allowed() {
        let pool = pool();
        let handle = put(&pool, b"k", b"");
        assert!(read_value(&pool, handle).unwrap().is_empty());
        assert!(verify(&pool, handle).is_ok());
    }

    #[test]
    fn flipped_byte_fails_verify() {
        let pool = pool();
        let handle = put(&pool, b"key", b"value");
        pool.media().write(handle.at(RECORD_HEADER + 4), b"X").unwrap();
        assert!(matches!(
            verify(&pool, handle),
            Err(CoreError::CorruptMetadata { .. })
        ));
    }

    #[test]
    fn absurd_length_is_corrupt() {
        let pool = pool();
        let handle = put(&pool, b"key", b"value");
        pool.media().write_u64(handle.at(8), u64::MAX - 1).unwrap();
        assert!(read_value(&pool, handle).is_err());
    }
}
