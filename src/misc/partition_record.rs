// SPDX-License-Identifier: Apache-2.0

use crate::constants::{
    PARTITION_NAME_LEN, PARTITION_RECORD_AREA_LEN, PARTITION_RECORD_INFO_LEN,
    PARTITION_RECORD_OFFSET, PARTITION_RECORD_START,
};
use crate::error::{Result, UpdateError};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Append-only journal of per-partition completion flags inside the misc
/// region. A partition that is already recorded as updated is skipped when a
/// rebooted update retries, which is what makes the block writer at-most-once
/// at partition granularity.
///
/// Layout inside misc: an i64 LE write offset at `PARTITION_RECORD_OFFSET`,
/// then `PARTITION_RECORD_MAX` records of 65 bytes (64-byte NUL-padded name,
/// one updated flag). The header offset is written after the record and
/// fsynced, so a torn append leaves only ignorable bytes past the offset.
pub struct PartitionRecord {
    misc_path: PathBuf,
}

impl PartitionRecord {
    pub fn new(misc_path: impl Into<PathBuf>) -> Self {
        Self {
            misc_path: misc_path.into(),
        }
    }

    pub fn misc_path(&self) -> &Path {
        &self.misc_path
    }

    fn open(&self, write: bool) -> Result<Flock<File>> {
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .open(&self.misc_path)
            .map_err(|e| {
                UpdateError::MiscUnavailable(format!("{}: {}", self.misc_path.display(), e))
            })?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, e)| UpdateError::MiscUnavailable(e.to_string()))
    }

    fn read_offset(file: &File) -> Result<i64> {
        let mut raw = [0u8; 8];
        file.read_exact_at(&mut raw, PARTITION_RECORD_OFFSET)?;
        let offset = i64::from_le_bytes(raw);
        if offset < 0 || offset as usize > PARTITION_RECORD_AREA_LEN {
            warn!(offset, "partition record offset out of range, treating as empty");
            return Ok(0);
        }
        Ok(offset)
    }

    fn write_offset(file: &File, offset: i64) -> Result<()> {
        file.write_all_at(&offset.to_le_bytes(), PARTITION_RECORD_OFFSET)?;
        Ok(())
    }

    /// Whether `name` has already been recorded as updated. Unknown names
    /// and unreadable misc regions both read as "not done", so a fresh run
    /// does the work rather than skipping it.
    pub fn is_done(&self, name: &str) -> bool {
        let file = match self.open(false) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "cannot open misc for partition record");
                return false;
            }
        };
        match self.scan(&file, name) {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                debug!(name, "no partition record entry");
                false
            }
            Err(e) => {
                warn!(error = %e, "partition record scan failed");
                false
            }
        }
    }

    fn scan(&self, file: &File, name: &str) -> Result<Option<bool>> {
        let offset = Self::read_offset(file)? as usize;
        let mut area = vec![0u8; offset];
        file.read_exact_at(&mut area, PARTITION_RECORD_START)?;
        for record in area.chunks_exact(PARTITION_RECORD_INFO_LEN) {
            let end = record[..PARTITION_NAME_LEN]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(PARTITION_NAME_LEN);
            let entry_name = std::str::from_utf8(&record[..end]).unwrap_or("");
            if entry_name == name {
                return Ok(Some(record[PARTITION_NAME_LEN] != 0));
            }
        }
        Ok(None)
    }

    /// Appends a record for `name`. The record bytes land first, the header
    /// offset second, and the fsync covers both, so recovery never sees an
    /// offset that points past valid data.
    pub fn mark_done(&self, name: &str, updated: bool) -> Result<()> {
        let file = self.open(true)?;
        let offset = Self::read_offset(&file)?;
        if offset as usize + PARTITION_RECORD_INFO_LEN > PARTITION_RECORD_AREA_LEN {
            return Err(UpdateError::MiscFull(offset));
        }

        let mut record = [0u8; PARTITION_RECORD_INFO_LEN];
        let name_bytes = name.as_bytes();
        let n = name_bytes.len().min(PARTITION_NAME_LEN - 1);
        record[..n].copy_from_slice(&name_bytes[..n]);
        record[PARTITION_NAME_LEN] = updated as u8;

        file.write_all_at(&record, PARTITION_RECORD_START + offset as u64)?;
        Self::write_offset(&file, offset + PARTITION_RECORD_INFO_LEN as i64)?;
        file.sync_all()?;
        debug!(name, updated, offset, "partition record appended");
        Ok(())
    }

    /// Resets the journal: offset back to zero and the record area wiped.
    pub fn clear(&self) -> Result<()> {
        let file = self.open(true)?;
        Self::write_offset(&file, 0)?;
        let zeros = vec![0u8; PARTITION_RECORD_AREA_LEN];
        file.write_all_at(&zeros, PARTITION_RECORD_START)?;
        file.sync_all()?;
        Ok(())
    }
}
