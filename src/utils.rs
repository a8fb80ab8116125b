// SPDX-License-Identifier: Apache-2.0

use crate::error::{Result, UpdateError};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn format_elapsed_time(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{}h {}m {}.{:03}s", hours, mins, secs, millis)
    } else if mins > 0 {
        format!("{}m {}.{:03}s", mins, secs, millis)
    } else {
        format!("{}.{:03}s", secs, millis)
    }
}

pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}

/// Resolves `path` and checks the canonical form still lives under one of
/// `roots`. Device paths come from the mount table or the command line, so a
/// symlink pointing outside the device tree is rejected instead of followed.
pub fn resolve_device_path(path: &Path, roots: &[&Path]) -> Result<PathBuf> {
    let real = path.canonicalize()?;
    let allowed = roots.iter().any(|root| {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        real.starts_with(&root)
    });
    if allowed {
        Ok(real)
    } else {
        Err(UpdateError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("{} escapes the allowed device roots", real.display()),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_size_units() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn resolve_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("blk0");
        std::fs::write(&inside, b"x").unwrap();
        let ok = resolve_device_path(&inside, &[dir.path()]).unwrap();
        assert!(ok.starts_with(dir.path().canonicalize().unwrap()));

        let err = resolve_device_path(Path::new("/etc/hostname"), &[dir.path()]);
        assert!(err.is_err());
    }
}
