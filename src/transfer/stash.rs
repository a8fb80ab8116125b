// SPDX-License-Identifier: Apache-2.0

//! Content-addressed stash: blocks read from the source before they are
//! overwritten, persisted under their sha-256 so a replay after a crash
//! finds them again. One file per key, written atomically; duplicate saves
//! of the same key are no-ops.

use crate::blockset::BlockSet;
use crate::error::{Result, UpdateError};
use crate::verify::hash_buffer;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

struct StashEntry {
    set: BlockSet,
    declared: u32,
    used: u32,
}

pub struct StashStore {
    dir: PathBuf,
    entries: HashMap<String, StashEntry>,
}

impl StashStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            entries: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Saves `data` under its content hash. The key must equal the actual
    /// hash; a mismatch means the source blocks changed under us. Saving an
    /// already-present key verifies and reuses the file.
    pub fn save(
        &mut self,
        key: &[u8; 32],
        set: &BlockSet,
        data: &[u8],
        declared: u32,
    ) -> Result<()> {
        let actual = hash_buffer(data);
        if &actual != key {
            return Err(UpdateError::HashMismatch {
                expected: hex::encode(key),
                actual: hex::encode(actual),
            });
        }
        let name = hex::encode(key);
        let path = self.path_for(&name);
        if !path.exists() {
            let tmp = self.dir.join(format!("{}.tmp", name));
            std::fs::write(&tmp, data)?;
            std::fs::rename(&tmp, &path)?;
        }
        debug!(key = %name, blocks = set.block_count(), declared, "stashed");
        self.entries.insert(
            name,
            StashEntry {
                set: set.clone(),
                declared,
                used: 0,
            },
        );
        Ok(())
    }

    /// Whether a stash entry covering exactly `set` exists; consumers reach
    /// stashed bytes by the set they would otherwise read from the source.
    pub fn key_for_set(&self, set: &BlockSet) -> Option<[u8; 32]> {
        self.entries.iter().find_map(|(name, entry)| {
            if &entry.set == set {
                let raw = hex::decode(name).ok()?;
                raw.try_into().ok()
            } else {
                None
            }
        })
    }

    /// Loads stashed bytes, counting the use against the declared consumer
    /// budget.
    pub fn load(&mut self, key: &[u8; 32]) -> Result<Vec<u8>> {
        let name = hex::encode(key);
        let entry = self
            .entries
            .get_mut(&name)
            .ok_or_else(|| UpdateError::StashMissing(name.clone()))?;
        if entry.used >= entry.declared {
            return Err(UpdateError::ProgramInvalid(format!(
                "stash {} used more times than declared ({})",
                name, entry.declared
            )));
        }
        entry.used += 1;
        let data = std::fs::read(self.path_for(&name))
            .map_err(|_| UpdateError::StashMissing(name.clone()))?;
        let actual = hash_buffer(&data);
        if &actual != key {
            return Err(UpdateError::HashMismatch {
                expected: name,
                actual: hex::encode(actual),
            });
        }
        Ok(data)
    }

    /// Drops an entry. Every declared consumer must have loaded it first;
    /// the on-disk file is unlinked atomically.
    pub fn free(&mut self, key: &[u8; 32]) -> Result<()> {
        let name = hex::encode(key);
        let entry = self
            .entries
            .get(&name)
            .ok_or_else(|| UpdateError::StashMissing(name.clone()))?;
        if entry.used < entry.declared {
            return Err(UpdateError::ProgramInvalid(format!(
                "stash {} freed with {} of {} consumers outstanding",
                name,
                entry.declared - entry.used,
                entry.declared
            )));
        }
        std::fs::remove_file(self.path_for(&name))
            .map_err(|_| UpdateError::StashMissing(name.clone()))?;
        self.entries.remove(&name);
        debug!(key = %name, "stash freed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StashStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StashStore::open(dir.path().join("stash")).unwrap();
        (dir, store)
    }

    fn sample() -> ([u8; 32], BlockSet, Vec<u8>) {
        let data = vec![0xC3u8; 8192];
        let key = hash_buffer(&data);
        let set = BlockSet::new(vec![(10, 12)]).unwrap();
        (key, set, data)
    }

    #[test]
    fn save_load_free_cycle() {
        let (_dir, mut store) = store();
        let (key, set, data) = sample();

        store.save(&key, &set, &data, 2).unwrap();
        assert_eq!(store.key_for_set(&set), Some(key));
        assert_eq!(store.load(&key).unwrap(), data);
        assert_eq!(store.load(&key).unwrap(), data);
        store.free(&key).unwrap();
        assert!(store.key_for_set(&set).is_none());
        assert!(matches!(
            store.load(&key).unwrap_err(),
            UpdateError::StashMissing(_)
        ));
    }

    #[test]
    fn key_must_match_content() {
        let (_dir, mut store) = store();
        let (_, set, data) = sample();
        let wrong_key = [0u8; 32];
        assert!(matches!(
            store.save(&wrong_key, &set, &data, 1).unwrap_err(),
            UpdateError::HashMismatch { .. }
        ));
    }

    #[test]
    fn over_consumption_rejected() {
        let (_dir, mut store) = store();
        let (key, set, data) = sample();
        store.save(&key, &set, &data, 1).unwrap();
        store.load(&key).unwrap();
        assert!(matches!(
            store.load(&key).unwrap_err(),
            UpdateError::ProgramInvalid(_)
        ));
    }

    #[test]
    fn early_free_rejected() {
        let (_dir, mut store) = store();
        let (key, set, data) = sample();
        store.save(&key, &set, &data, 1).unwrap();
        assert!(matches!(
            store.free(&key).unwrap_err(),
            UpdateError::ProgramInvalid(_)
        ));
        store.load(&key).unwrap();
        store.free(&key).unwrap();
    }

    #[test]
    fn duplicate_save_reuses_file() {
        let (_dir, mut store) = store();
        let (key, set, data) = sample();
        store.save(&key, &set, &data, 1).unwrap();
        store.save(&key, &set, &data, 1).unwrap();
        assert_eq!(store.load(&key).unwrap(), data);
    }

    #[test]
    fn file_survives_new_store_handle() {
        let dir = tempfile::tempdir().unwrap();
        let stash_dir = dir.path().join("stash");
        let (key, set, data) = sample();
        {
            let mut store = StashStore::open(&stash_dir).unwrap();
            store.save(&key, &set, &data, 1).unwrap();
        }
        // the file is still on disk for a replaying interpreter to re-adopt
        assert!(stash_dir.join(hex::encode(key)).exists());
    }
}
