//! Pool header format.
//!
//! ```text
//! offset  size  field
//!      0     8  magic "PMKVPOOL" (written last at creation)
//!      8     2  format major
//!     10     2  format minor
//!     12     4  engine tag
//!     16    16  pool uuid
//!     32     8  pool size
//!     40     4  lane count
//!     44     4  lane size
//!     48     8  heap offset
//!     56     8  heap size
//!     64     8  root handle (mutable, excluded from the checksum)
//!     72     4  crc32 of bytes 0..64
//! ```
//!
//! The header occupies the first [`HEADER_SIZE`] bytes of the pool; the rest
//! of that page is reserved.

use crate::error::{CoreError, CoreResult};
use crate::types::EngineKind;
use uuid::Uuid;

/// Magic bytes at the start of every pool.
pub const POOL_MAGIC: [u8; 8] = *b"PMKVPOOL";

/// Major format version. Pools with another major version are refused.
pub const FORMAT_MAJOR: u16 = 1;

/// Minor format version. Minor bumps stay readable.
pub const FORMAT_MINOR: u16 = 0;

/// Bytes reserved for the header at the start of the pool.
pub const HEADER_SIZE: u64 = 4096;

/// Region offset of the root handle word.
pub(crate) const ROOT_OFFSET: u64 = 64;

/// Bytes covered by the checksum.
const BODY_LEN: usize = 64;

/// Bytes read when decoding.
pub(crate) const ENCODED_LEN: usize = 76;

const CRC_OFFSET: usize = 72;

/// Decoded pool header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHeader {
    /// Format major version.
    pub major: u16,
    /// Format minor version.
    pub minor: u16,
    /// Engine the pool was created for.
    pub engine: EngineKind,
    /// Identity of the pool, fixed at creation.
    pub uuid: Uuid,
    /// Size of the whole pool in bytes.
    pub pool_size: u64,
    /// Number of undo lanes.
    pub lane_count: u32,
    /// Bytes per undo lane.
    pub lane_size: u32,
    /// Region offset of the heap.
    pub heap_offset: u64,
    /// Size of the heap in bytes.
    pub heap_size: u64,
}

impl PoolHeader {
    /// Region offset of the first lane.
    pub(crate) const fn lanes_offset(&self) -> u64 {
        HEADER_SIZE
    }

    /// End of the heap.
    pub(crate) const fn heap_end(&self) -> u64 {
        self.heap_offset + self.heap_size
    }

    /// Encodes the checksummed body, magic included.
    fn body(&self) -> [u8; BODY_LEN] {
        let mut buf = [0u8; BODY_LEN];
        buf[0..8].copy_from_slice(&POOL_MAGIC);
        buf[8..10].copy_from_slice(&self.major.to_le_bytes());
        buf[10..12].copy_from_slice(&self.minor.to_le_bytes());
        buf[12..16].copy_from_slice(&self.engine.tag().to_le_bytes());
        buf[16..32].copy_from_slice(self.uuid.as_bytes());
        buf[32..40].copy_from_slice(&self.pool_size.to_le_bytes());
        buf[40..44].copy_from_slice(&self.lane_count.to_le_bytes());
        buf[44..48].copy_from_slice(&self.lane_size.to_le_bytes());
        buf[48..56].copy_from_slice(&self.heap_offset.to_le_bytes());
        buf[56..64].copy_from_slice(&self.heap_size.to_le_bytes());
        buf
    }

    /// Returns the header bytes without the magic, and the checksum.
    ///
    /// Creation writes these first and the magic last.
    pub(crate) fn encode_without_magic(&self) -> (Vec<u8>, u32) {
        let body = self.body();
        (body[8..].to_vec(), crc32fast::hash(&body))
    }

    /// Decodes and validates a header read from the start of a pool.
    ///
    /// # Errors
    ///
    /// - `CorruptMetadata` if the magic or checksum is wrong, or the engine tag
    ///   is unknown
    /// - `VersionMismatch` if the major version is not [`FORMAT_MAJOR`]
    pub(crate) fn decode(bytes: &[u8; ENCODED_LEN]) -> CoreResult<Self> {
        if bytes[0..8] != POOL_MAGIC {
            return Err(CoreError::corrupt(
                "not a pmkv pool (bad magic); use force_create to overwrite it",
            ));
        }

        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(word)
        };
        let u64_at = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(word)
        };

        let major = u16_at(8);
        if major != FORMAT_MAJOR {
            return Err(CoreError::VersionMismatch {
                found: major,
                supported: FORMAT_MAJOR,
            });
        }

        let expected = u32_at(CRC_OFFSET);
        let actual = crc32fast::hash(&bytes[..BODY_LEN]);
        if expected != actual {
            return Err(CoreError::corrupt(format!(
                "pool header checksum mismatch: expected {expected:08x}, got {actual:08x}"
            )));
        }

        let tag = u32_at(12);
        let engine = EngineKind::from_tag(tag)
            .ok_or_else(|| CoreError::corrupt(format!("unknown engine tag {tag}")))?;

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[16..32]);

        Ok(Self {
            major,
            minor: u16_at(10),
            engine,
            uuid: Uuid::from_bytes(uuid),
            pool_size: u64_at(32),
            lane_count: u32_at(40),
            lane_size: u32_at(44),
            heap_offset: u64_at(48),
            heap_size: u64_at(56),
        })
    }

    /// Checks that the recorded layout fits a region of `region_len` bytes.
    pub(crate) fn check_layout(&self, region_len: u64) -> CoreResult<()> {
        if self.pool_size != region_len {
            return Err(CoreError::corrupt(format!(
                "pool header records {} bytes but the region has {region_len}",
                self.pool_size
            )));
        }
        let lanes_end = u64::from(self.lane_count)
            .checked_mul(u64::from(self.lane_size))
            .and_then(|bytes| bytes.checked_add(self.lanes_offset()));
        let fits = matches!(lanes_end, Some(end) if end <= self.heap_offset)
            && self.lane_count > 0
            && self
                .heap_offset
                .checked_add(self.heap_size)
                .is_some_and(|end| end <= self.pool_size);
        if !fits {
            return Err(CoreError::corrupt("pool header layout does not fit the pool"));
        }
        Ok(())
    }
}

/// Byte offset of the checksum, for writers.
pub(crate) const fn crc_offset() -> u64 {
    CRC_OFFSET as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PoolHeader {
        PoolHeader {
            major: FORMAT_MAJOR,
            minor: FORMAT_MINOR,
            engine: EngineKind::STree,
            uuid: Uuid::new_v4(),
            pool_size: 8 << 20,
            lane_count: 4,
            lane_size: 8192,
            heap_offset: 40960,
            heap_size: (8 << 20) - 40960,
        }
    }

    fn encoded(header: &PoolHeader) -> [u8; ENCODED_LEN] {
        let (rest, crc) = header.encode_without_magic();
        let mut bytes = [0u8; ENCODED_LEN];
        bytes[0..8].copy_from_slice(&POOL_MAGIC);
        bytes[8..BODY_LEN].copy_from_slice(&rest);
        bytes[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    #[test]
    fn decode_accepts_encoded_header() {
        let header = sample();
        let bytes = encoded(&header);
        assert_eq!(PoolHeader::decode(&bytes).unwrap(), header);
        assert!(header.check_layout(8 << 20).is_ok());
    }

    #[test]
    fn root_word_is_not_checksummed() {
        let header = sample();
        let mut bytes = encoded(&header);
        bytes[ROOT_OFFSET as usize] = 0x55;
        assert!(PoolHeader::decode(&bytes).is_ok());
    }

    #[test]
    fn missing_magic_is_corrupt() {
        let mut bytes = encoded(&sample());
        bytes[0..8].fill(0);
        assert!(matches!(
            PoolHeader::decode(&bytes),
            Err(CoreError::CorruptMetadata { .. })
        ));
    }

    #[test]
    fn other_major_version_refused() {
        let mut header = sample();
        header.major = FORMAT_MAJOR + 1;
        let bytes = encoded(&header);
        assert!(matches!(
            PoolHeader::decode(&bytes),
            Err(CoreError::VersionMismatch { found, .. }) if found == FORMAT_MAJOR + 1
        ));
    }

    #[test]
    fn flipped_bit_is_corrupt() {
        let mut bytes = encoded(&sample());
        bytes[33] ^= 0x01;
        assert!(matches!(
            PoolHeader::decode(&bytes),
            Err(CoreError::CorruptMetadata { .. })
        ));
    }

    #[test]
    fn layout_must_fit_region() {
        let header = sample();
        assert!(header.check_layout((8 << 20) + 4096).is_err());

        let mut overlapping = sample();
        overlapping.heap_offset = HEADER_SIZE;
        assert!(overlapping.check_layout(8 << 20).is_err());
    }
}
