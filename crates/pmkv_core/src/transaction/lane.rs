//! Undo log lanes.
//!
//! Every transaction owns one lane for its lifetime. A lane is a fixed slice
//! of the pool laid out as:
//!
//! ```text
//! [state u64][used u64][txid u64][entry][entry]...
//! entry = [target u64][len u32][crc32 u32][old bytes, padded to 8]
//! ```
//!
//! ## Write ordering
//!
//! 1. The entry is written and persisted past the current `used` mark.
//! 2. `used` (and on first use `txid` and `state = ACTIVE`) are written and
//!    persisted. The three words share one cache line.
//! 3. Only then is the logged range modified.
//!
//! An entry therefore never counts until its bytes are durable, and a range
//! is never modified before its old contents are. A lane is cleared by
//! writing `state = IDLE` first, which is the commit point of the owning
//! transaction.
//!
//! ## Recovery Policy
//!
//! - `IDLE` lanes are skipped.
//! - `ACTIVE` lanes are rolled back newest entry first, then cleared.
//! - A checksum mismatch, a target outside the pool or an unknown state
//!   word is `CorruptMetadata`; the pool does not open.

use crate::error::{CoreError, CoreResult};
use crate::pool::media::Media;

/// Bytes of lane header.
pub(crate) const LANE_HEADER: u64 = 24;

const LANE_IDLE: u64 = 0;
const LANE_ACTIVE: u64 = 0x4556_4954_4341_4e4c;
const ENTRY_HEADER: u64 = 16;

/// One logged range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UndoEntry {
    pub target: u64,
    pub old: Vec<u8>,
}

/// Location of a lane inside the pool.
#[derive(Debug)]
pub(crate) struct Lane {
    index: u32,
    offset: u64,
    size: u64,
}

impl Lane {
    pub(crate) fn new(index: u32, offset: u64, size: u64) -> Self {
        Self {
            index,
            offset,
            size,
        }
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Bytes available for entries.
    pub(crate) fn capacity(&self) -> u64 {
        self.size - LANE_HEADER
    }

    /// Bytes an entry for `len` logged bytes occupies.
    pub(crate) fn entry_len(len: u64) -> u64 {
        ENTRY_HEADER + len.div_ceil(8) * 8
    }

    /// Writes the empty lane header.
    pub(crate) fn format(&self, media: &Media) -> CoreResult<()> {
        media.write(self.offset, &[0u8; LANE_HEADER as usize])?;
        media.persist(self.offset, LANE_HEADER)
    }

    /// Appends an entry at `used` and persists it. Returns the new `used`.
    ///
    /// # Errors
    ///
    /// Returns `TransactionFailed` if the entry does not fit.
    pub(crate) fn append(
        &self,
        media: &Media,
        used: u64,
        target: u64,
        old: &[u8],
    ) -> CoreResult<u64> {
        let len = Self::entry_len(old.len() as u64);
        if used + len > self.capacity() {
            return Err(CoreError::transaction_failed(format!(
                "undo log full: lane {} holds {} bytes, transaction needs {}",
                self.index,
                self.capacity(),
                used + len
            )));
        }
        let data_len = u32::try_from(old.len())
            .map_err(|_| CoreError::transaction_failed("logged range larger than 4 GiB"))?;

        let mut entry = Vec::with_capacity(len as usize);
        entry.extend_from_slice(&target.to_le_bytes());
        entry.extend_from_slice(&data_len.to_le_bytes());
        entry.extend_from_slice(&crc32fast::hash(old).to_le_bytes());
        entry.extend_from_slice(old);
        entry.resize(len as usize, 0);

        let at = self.offset + LANE_HEADER + used;
        media.write(at, &entry)?;
        media.persist(at, len)?;
        Ok(used + len)
    }

    /// Makes `used` entries count and marks the lane active.
    pub(crate) fn publish(&self, media: &Media, used: u64, txid: u64) -> CoreResult<()> {
        media.write_u64(self.offset + 8, used)?;
        media.write_u64(self.offset + 16, txid)?;
        media.write_u64(self.offset, LANE_ACTIVE)?;
        media.persist(self.offset, LANE_HEADER)
    }

    /// Marks the lane idle. For a committing transaction this is the commit point.
    pub(crate) fn clear(&self, media: &Media) -> CoreResult<()> {
        media.write_u64(self.offset, LANE_IDLE)?;
        media.write_u64(self.offset + 8, 0)?;
        media.persist(self.offset, LANE_HEADER)
    }

    /// Reads and validates the first `used` bytes of entries.
    pub(crate) fn entries(&self, media: &Media, used: u64) -> CoreResult<Vec<UndoEntry>> {
        if used > self.capacity() || used % 8 != 0 {
            return Err(CoreError::corrupt(format!(
                "lane {} records {used} used bytes",
                self.index
            )));
        }
        let mut entries = Vec::new();
        let mut pos = 0u64;
        while pos < used {
            let at = self.offset + LANE_HEADER + pos;
            let target = media.read_u64(at)?;
            let len = u64::from(media.read_u32(at + 8)?);
            let crc = media.read_u32(at + 12)?;
            let entry_len = Self::entry_len(len);
            if pos + entry_len > used {
                return Err(CoreError::corrupt(format!(
                    "lane {} entry at {pos} runs past the log",
                    self.index
                )));
            }
            let in_pool = target
                .checked_add(len)
                .is_some_and(|end| end <= media.len());
            if !in_pool {
                return Err(CoreError::corrupt(format!(
                    "lane {} entry targets {target:#x}+{len} outside the pool",
                    self.index
                )));
            }
            let old = media.read_vec(at + ENTRY_HEADER, len as usize)?;
            if crc32fast::hash(&old) != crc {
                return Err(CoreError::corrupt(format!(
                    "lane {} entry at {pos} failed its checksum",
                    self.index
                )));
            }
            entries.push(UndoEntry { target, old });
            pos += entry_len;
        }
        Ok(entries)
    }

    /// Restores every logged range, newest first, then clears the lane.
    ///
    /// Returns the number of entries applied.
    pub(crate) fn rollback(&self, media: &Media, used: u64) -> CoreResult<usize> {
        let entries = self.entries(media, used)?;
        for entry in entries.iter().rev() {
            media.write(entry.target, &entry.old)?;
            media.persist(entry.target, entry.old.len() as u64)?;
        }
        self.clear(media)?;
        Ok(entries.len())
    }

    /// Rolls back the lane if a crash left it active.
    ///
    /// Returns the number of entries applied, or `None` for an idle lane.
    pub(crate) fn recover(&self, media: &Media) -> CoreResult<Option<usize>> {
        match media.read_u64(self.offset)? {
            LANE_IDLE => Ok(None),
            LANE_ACTIVE => {
                let used = media.read_u64(self.offset + 8)?;
                let txid = media.read_u64(self.offset + 16)?;
                let applied = self.rollback(media, used)?;
                tracing::warn!(
                    lane = self.index,
                    txid,
                    entries = applied,
                    "rolled back interrupted transaction"
                );
                Ok(Some(applied))
            }
            other => Err(CoreError::corrupt(format!(
                "lane {} has invalid state {other:#x}",
                self.index
            ))),
        }
    }
}
