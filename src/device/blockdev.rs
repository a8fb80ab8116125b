// SPDX-License-Identifier: Apache-2.0

use crate::error::Result;
use nix::{ioctl_read, ioctl_read_bad, request_code_none};
use serde::Serialize;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use tracing::debug;

// block-layer ioctls
ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), c_int);
ioctl_read_bad!(blkpbszget, request_code_none!(0x12, 123), c_int);

/// One entry of the startup block-device inventory.
#[derive(Debug, Clone, Serialize)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    pub read_only: bool,
}

impl BlockDevice {
    /// Probes an open device with the block-layer ioctls; regular files
    /// (loopback images, test fixtures) fall back to file metadata.
    pub fn probe(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        let fd = file.as_raw_fd();

        let mut size: u64 = 0;
        let mut logical: c_int = 0;
        let mut physical: c_int = 0;
        let is_block = unsafe { blkgetsize64(fd, &mut size) }.is_ok();
        if is_block {
            unsafe {
                let _ = blksszget(fd, &mut logical);
                let _ = blkpbszget(fd, &mut physical);
            }
        } else {
            size = meta.len();
        }
        if logical <= 0 {
            logical = 512;
        }
        if physical <= 0 {
            physical = logical;
        }

        Ok(Self {
            path: path.to_path_buf(),
            size_bytes: size,
            logical_sector_size: logical as u32,
            physical_sector_size: physical as u32,
            read_only: meta.permissions().readonly(),
        })
    }

    /// Scans the system block directory and probes every whole device.
    /// Loop and ram devices are skipped; they are never update targets.
    pub fn scan(sys_block: &Path) -> Result<Vec<Self>> {
        let mut devices = Vec::new();
        let entries = match std::fs::read_dir(sys_block) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "no block directory to scan");
                return Ok(devices);
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("loop") || name.starts_with("ram") {
                continue;
            }
            let dev_path = Path::new("/dev").join(name.as_ref());
            match Self::probe(&dev_path) {
                Ok(dev) => devices.push(dev),
                Err(e) => debug!(device = %dev_path.display(), error = %e, "probe failed"),
            }
        }
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_regular_file_uses_metadata() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(1 << 20).unwrap();
        let dev = BlockDevice::probe(file.path()).unwrap();
        assert_eq!(dev.size_bytes, 1 << 20);
        assert_eq!(dev.logical_sector_size, 512);
        assert_eq!(dev.physical_sector_size, 512);
    }

    #[test]
    fn scan_missing_directory_is_empty() {
        let devices = BlockDevice::scan(Path::new("/nonexistent/sys/block")).unwrap();
        assert!(devices.is_empty());
    }
}
