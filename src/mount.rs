// SPDX-License-Identifier: Apache-2.0

use crate::constants::DEFAULT_MISC_DEVICE;
use crate::error::{Result, UpdateError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// Mount-point to block-device mapping. The update core never mounts or
/// interprets filesystems itself; it only asks this table which device backs
/// a mount point, and delegates format requests to the platform mkfs tools.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: HashMap<String, MountEntry>,
}

#[derive(Debug, Clone)]
pub struct MountEntry {
    pub mount_point: String,
    pub device: PathBuf,
    pub fs_type: String,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a fstab-style table: `<device> <mount_point> <fs_type> ...`,
    /// one entry per line, `#` comments ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut table = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                warn!(line, "skipping malformed mount table line");
                continue;
            }
            table.insert(fields[1], fields[0], fields[2]);
        }
        Ok(table)
    }

    pub fn insert(&mut self, mount_point: &str, device: impl Into<PathBuf>, fs_type: &str) {
        self.entries.insert(
            mount_point.to_string(),
            MountEntry {
                mount_point: mount_point.to_string(),
                device: device.into(),
                fs_type: fs_type.to_string(),
            },
        );
    }

    /// The block device backing `mount_point`, or None when unknown.
    pub fn device_for(&self, mount_point: &str) -> Option<&Path> {
        self.entries.get(mount_point).map(|e| e.device.as_path())
    }

    /// Misc path resolution: the table wins; the compiled-in device path is
    /// only the fallback for tables with no misc entry.
    pub fn misc_device(&self) -> PathBuf {
        match self.device_for("/misc") {
            Some(dev) => dev.to_path_buf(),
            None => {
                warn!("no misc entry in mount table, using compiled-in path");
                PathBuf::from(DEFAULT_MISC_DEVICE)
            }
        }
    }

    /// Formats the filesystem behind `mount_point` with its configured type.
    /// Used by the wipe tokens; the core treats this as an opaque platform
    /// operation.
    pub fn format(&self, mount_point: &str) -> Result<()> {
        let entry = self.entries.get(mount_point).ok_or_else(|| {
            UpdateError::MiscUnavailable(format!("unknown mount point {}", mount_point))
        })?;
        let tool = format!("mkfs.{}", entry.fs_type);
        info!(mount_point, device = %entry.device.display(), %tool, "formatting");
        let status = Command::new(&tool).arg(&entry.device).status()?;
        if !status.success() {
            return Err(UpdateError::Io(std::io::Error::other(format!(
                "{} {} exited with {}",
                tool,
                entry.device.display(),
                status
            ))));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_table_and_resolves_misc() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# boot partitions").unwrap();
        writeln!(file, "/dev/block/sda1 /misc none defaults").unwrap();
        writeln!(file, "/dev/block/sda2 /data ext4 defaults").unwrap();
        writeln!(file, "bad-line").unwrap();
        let table = MountTable::load(file.path()).unwrap();

        assert_eq!(table.misc_device(), PathBuf::from("/dev/block/sda1"));
        assert_eq!(
            table.device_for("/data"),
            Some(Path::new("/dev/block/sda2"))
        );
        assert_eq!(table.device_for("/cache"), None);
    }

    #[test]
    fn misc_falls_back_to_constant() {
        let table = MountTable::new();
        assert_eq!(table.misc_device(), PathBuf::from(DEFAULT_MISC_DEVICE));
    }
}
