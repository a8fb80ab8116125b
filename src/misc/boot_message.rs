// SPDX-License-Identifier: Apache-2.0

use crate::constants::{
    BOOT_CMD_FLASH, BOOT_CMD_UPDATER, BOOT_MESSAGE_OFFSET, BOOT_MESSAGE_SIZE,
    TOKEN_FACTORY_WIPE_DATA, TOKEN_RETRY_COUNT, TOKEN_SDCARD_UPDATE, TOKEN_UPDATE_PACKAGE,
    TOKEN_UPGRADED_PKG_NUM, TOKEN_USER_WIPE_DATA,
};
use crate::error::{Result, UpdateError};
use crate::mount::MountTable;
use nix::fcntl::{Flock, FlockArg};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::info;

/// Fixed-layout record at the head of the misc partition carrying reboot
/// intent between the normal system, the updater and the flashing service.
/// All fields are NUL-padded byte arrays; writes never disturb the misc
/// bytes beyond the struct.
#[derive(Clone)]
pub struct BootMessage {
    pub command: [u8; 32],
    pub status: [u8; 32],
    pub update: [u8; 768],
    pub reserved: [u8; 224],
}

/// Boot mode selected by the command field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Normal,
    Updater,
    Flash,
}

impl Default for BootMessage {
    fn default() -> Self {
        Self {
            command: [0; 32],
            status: [0; 32],
            update: [0; 768],
            reserved: [0; 224],
        }
    }
}

fn field_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

fn set_field(field: &mut [u8], value: &str) {
    field.fill(0);
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len() - 1);
    field[..n].copy_from_slice(&bytes[..n]);
}

impl BootMessage {
    pub fn command_str(&self) -> &str {
        field_str(&self.command)
    }

    pub fn status_str(&self) -> &str {
        field_str(&self.status)
    }

    pub fn update_str(&self) -> &str {
        field_str(&self.update)
    }

    pub fn set_command(&mut self, value: &str) {
        set_field(&mut self.command, value);
    }

    pub fn set_status(&mut self, value: &str) {
        set_field(&mut self.status, value);
    }

    pub fn set_update(&mut self, value: &str) {
        set_field(&mut self.update, value);
    }

    pub fn mode(&self) -> BootMode {
        match self.command_str() {
            BOOT_CMD_UPDATER => BootMode::Updater,
            BOOT_CMD_FLASH => BootMode::Flash,
            _ => BootMode::Normal,
        }
    }

    pub fn options(&self) -> UpdateOptions {
        UpdateOptions::parse(self.update_str())
    }

    fn encode(&self) -> [u8; BOOT_MESSAGE_SIZE] {
        let mut out = [0u8; BOOT_MESSAGE_SIZE];
        out[..32].copy_from_slice(&self.command);
        out[32..64].copy_from_slice(&self.status);
        out[64..832].copy_from_slice(&self.update);
        out[832..].copy_from_slice(&self.reserved);
        out
    }

    fn decode(raw: &[u8; BOOT_MESSAGE_SIZE]) -> Self {
        let mut msg = Self::default();
        msg.command.copy_from_slice(&raw[..32]);
        msg.status.copy_from_slice(&raw[32..64]);
        msg.update.copy_from_slice(&raw[64..832]);
        msg.reserved.copy_from_slice(&raw[832..]);
        msg
    }

    /// Reads the full struct from offset 0 of `path`; a short read is an
    /// error, never a default message.
    pub fn read(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path).map_err(|e| {
            UpdateError::MiscUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, e)| UpdateError::MiscUnavailable(e.to_string()))?;
        let mut raw = [0u8; BOOT_MESSAGE_SIZE];
        lock.read_exact_at(&mut raw, BOOT_MESSAGE_OFFSET)?;
        Ok(Self::decode(&raw))
    }

    /// Writes the struct at offset 0 without truncating, preserving every
    /// byte past the struct, and fsyncs before returning.
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
            UpdateError::MiscUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, e)| UpdateError::MiscUnavailable(e.to_string()))?;
        lock.write_all_at(&self.encode(), BOOT_MESSAGE_OFFSET)?;
        lock.sync_all()?;
        Ok(())
    }

    /// Reads the boot message from the misc device named by the mount table.
    pub fn read_misc(table: &MountTable) -> Result<Self> {
        let path = table.misc_device();
        info!(path = %path.display(), "reading boot message");
        Self::read(&path)
    }

    /// Writes the boot message to the misc device named by the mount table.
    pub fn write_misc(&self, table: &MountTable) -> Result<()> {
        let path = table.misc_device();
        info!(path = %path.display(), command = self.command_str(), "writing boot message");
        self.write(&path)
    }
}

/// Parsed form of the newline-separated `--key[=value]` tokens in the
/// update argument block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub update_packages: Vec<String>,
    pub retry_count: u32,
    pub upgraded_pkg_num: usize,
    pub sdcard_update: bool,
    pub user_wipe_data: bool,
    pub factory_wipe_data: bool,
}

impl UpdateOptions {
    pub fn parse(text: &str) -> Self {
        let mut opts = Self::default();
        for token in text.lines() {
            let token = token.trim();
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };
            match key {
                TOKEN_UPDATE_PACKAGE => {
                    if let Some(v) = value {
                        opts.update_packages.push(v.to_string());
                    }
                }
                TOKEN_RETRY_COUNT => {
                    opts.retry_count = value.and_then(|v| v.parse().ok()).unwrap_or(0);
                }
                TOKEN_UPGRADED_PKG_NUM => {
                    opts.upgraded_pkg_num = value.and_then(|v| v.parse().ok()).unwrap_or(0);
                }
                TOKEN_SDCARD_UPDATE => opts.sdcard_update = true,
                TOKEN_USER_WIPE_DATA => opts.user_wipe_data = true,
                TOKEN_FACTORY_WIPE_DATA => opts.factory_wipe_data = true,
                _ => {}
            }
        }
        opts
    }

    pub fn to_update_block(&self) -> String {
        let mut lines = Vec::new();
        for pkg in &self.update_packages {
            lines.push(format!("{}={}", TOKEN_UPDATE_PACKAGE, pkg));
        }
        if self.retry_count > 0 {
            lines.push(format!("{}={}", TOKEN_RETRY_COUNT, self.retry_count));
        }
        if self.upgraded_pkg_num > 0 {
            lines.push(format!("{}={}", TOKEN_UPGRADED_PKG_NUM, self.upgraded_pkg_num));
        }
        if self.sdcard_update {
            lines.push(TOKEN_SDCARD_UPDATE.to_string());
        }
        if self.user_wipe_data {
            lines.push(TOKEN_USER_WIPE_DATA.to_string());
        }
        if self.factory_wipe_data {
            lines.push(TOKEN_FACTORY_WIPE_DATA.to_string());
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PARTITION_RECORD_START;

    fn misc_image() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file()
            .set_len(PARTITION_RECORD_START + 16 * 1024)
            .unwrap();
        file
    }

    #[test]
    fn roundtrip_on_fresh_misc() {
        let misc = misc_image();
        let mut msg = BootMessage::default();
        msg.set_command(BOOT_CMD_UPDATER);
        msg.set_update("--update_package=/data/ota.zip\n--retry_count=2");
        msg.write(misc.path()).unwrap();

        let back = BootMessage::read(misc.path()).unwrap();
        assert_eq!(back.command_str(), BOOT_CMD_UPDATER);
        assert_eq!(back.mode(), BootMode::Updater);
        let opts = back.options();
        assert_eq!(opts.update_packages, vec!["/data/ota.zip".to_string()]);
        assert_eq!(opts.retry_count, 2);
    }

    #[test]
    fn write_preserves_unrelated_bytes() {
        let misc = misc_image();
        let marker = [0xABu8; 8];
        {
            use std::os::unix::fs::FileExt;
            misc.as_file().write_all_at(&marker, 4096).unwrap();
        }
        BootMessage::default().write(misc.path()).unwrap();
        let mut back = [0u8; 8];
        {
            use std::os::unix::fs::FileExt;
            misc.as_file().read_exact_at(&mut back, 4096).unwrap();
        }
        assert_eq!(back, marker);
    }

    #[test]
    fn short_file_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(100).unwrap();
        assert!(BootMessage::read(file.path()).is_err());
    }

    #[test]
    fn options_roundtrip() {
        let opts = UpdateOptions {
            update_packages: vec!["/sdcard/a.zip".into(), "/sdcard/b.zip".into()],
            retry_count: 1,
            upgraded_pkg_num: 1,
            sdcard_update: true,
            user_wipe_data: false,
            factory_wipe_data: true,
        };
        assert_eq!(UpdateOptions::parse(&opts.to_update_block()), opts);
    }

    #[test]
    fn unknown_command_is_normal_boot() {
        let mut msg = BootMessage::default();
        assert_eq!(msg.mode(), BootMode::Normal);
        msg.set_command(BOOT_CMD_FLASH);
        assert_eq!(msg.mode(), BootMode::Flash);
    }
}
