// SPDX-License-Identifier: Apache-2.0

use crate::error::{Result, UpdateError};
use crate::utils::resolve_device_path;
use nix::{ioctl_write_ptr_bad, request_code_none};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// discard ioctls take an inclusive [offset, length] pair of u64
ioctl_write_ptr_bad!(blkdiscard, request_code_none!(0x12, 119), [u64; 2]);
ioctl_write_ptr_bad!(blksecdiscard, request_code_none!(0x12, 125), [u64; 2]);

const ZERO_FILL_CHUNK: usize = 1 << 20;

/// Writer selection for a target. A closed set dispatched by match; decrypt
/// targets are not wired up yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Raw,
    Block,
}

pub enum DataWriter {
    Raw(RawWriter),
    Block(BlockWriter),
}

impl DataWriter {
    pub fn create(mode: WriteMode, path: &Path, offset: u64) -> Result<Self> {
        match mode {
            WriteMode::Raw => Ok(DataWriter::Raw(RawWriter::open(path, offset)?)),
            WriteMode::Block => Ok(DataWriter::Block(BlockWriter::open(path)?)),
        }
    }

    /// Same dispatch with explicit containment roots for the block mode;
    /// raw targets are ordinary files and take no containment check.
    pub fn create_with_roots(
        mode: WriteMode,
        path: &Path,
        offset: u64,
        roots: &[&Path],
    ) -> Result<Self> {
        match mode {
            WriteMode::Raw => Ok(DataWriter::Raw(RawWriter::open(path, offset)?)),
            WriteMode::Block => Ok(DataWriter::Block(BlockWriter::open_with_roots(path, roots)?)),
        }
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        match self {
            DataWriter::Raw(w) => w.write_at(offset, data),
            DataWriter::Block(w) => w.write_at(offset, data),
        }
    }

    pub fn sync(&self) -> Result<()> {
        match self {
            DataWriter::Raw(w) => w.sync(),
            DataWriter::Block(w) => w.sync(),
        }
    }
}

/// Sequential-offset writer producing a fresh ordinary file: rebuilt
/// images and other extracted output. Opening truncates; on a device node
/// the truncate is a kernel no-op.
pub struct RawWriter {
    file: File,
    base: u64,
}

impl RawWriter {
    pub fn open(path: &Path, base: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file, base })
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        write_fully(&self.file, self.base + offset, data)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// The crash-safe partition writer. Opens the backing device after a
/// realpath containment check, writes fully with EINTR/short-write retry,
/// and exposes the discard chain used by erase and format.
pub struct BlockWriter {
    file: File,
    path: PathBuf,
}

impl BlockWriter {
    /// Opens with the default containment roots (`/dev`).
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_roots(path, &[Path::new("/dev")])
    }

    /// Test entry point: fixtures live under a scratch root instead of /dev.
    pub fn open_with_roots(path: &Path, roots: &[&Path]) -> Result<Self> {
        let real = resolve_device_path(path, roots)?;
        let file = OpenOptions::new().read(true).write(true).open(&real)?;
        Ok(Self { file, path: real })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        write_fully(&self.file, offset, data)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// fsync; failure here is fatal to the partition, never ignored.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Secure discard, then plain discard, then an explicit zero write when
    /// the kernel supports neither on this device.
    pub fn discard(&self, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let range = [offset, len];
        let fd = self.file.as_raw_fd();
        if unsafe { blksecdiscard(fd, &range) }.is_ok() {
            debug!(offset, len, "secure discard");
            return Ok(());
        }
        if unsafe { blkdiscard(fd, &range) }.is_ok() {
            debug!(offset, len, "discard");
            return Ok(());
        }
        warn!(offset, len, "discard unsupported, zero-filling");
        self.zero_fill(offset, len)
    }

    fn zero_fill(&self, offset: u64, len: u64) -> Result<()> {
        let zeros = vec![0u8; ZERO_FILL_CHUNK.min(len as usize)];
        let mut written = 0u64;
        while written < len {
            let chunk = (len - written).min(zeros.len() as u64) as usize;
            write_fully(&self.file, offset + written, &zeros[..chunk])?;
            written += chunk as u64;
        }
        Ok(())
    }
}

/// Writes all of `data` at `offset`, retrying interrupted and short writes.
fn write_fully(file: &File, offset: u64, data: &[u8]) -> Result<usize> {
    use std::os::unix::fs::FileExt;
    let mut done = 0usize;
    while done < data.len() {
        match file.write_at(&data[done..], offset + done as u64) {
            Ok(0) => {
                return Err(UpdateError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "device accepted no bytes",
                )));
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn scratch_device(len: u64) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blk0");
        let file = File::create(&path).unwrap();
        file.set_len(len).unwrap();
        (dir, path)
    }

    #[test]
    fn block_writer_writes_at_offset() {
        let (dir, path) = scratch_device(8192);
        let writer = BlockWriter::open_with_roots(&path, &[dir.path()]).unwrap();
        assert_eq!(writer.write_at(4096, b"hello").unwrap(), 5);
        writer.sync().unwrap();

        let mut content = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(&content[4096..4101], b"hello");
        assert_eq!(content[0], 0);
    }

    #[test]
    fn discard_falls_back_to_zero() {
        let (dir, path) = scratch_device(8192);
        let writer = BlockWriter::open_with_roots(&path, &[dir.path()]).unwrap();
        writer.write_at(0, &[0xFFu8; 8192]).unwrap();
        // regular files reject the discard ioctls, so this exercises the
        // zero-fill fallback
        writer.discard(1024, 2048).unwrap();

        let mut content = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut content).unwrap();
        assert!(content[1024..3072].iter().all(|&b| b == 0));
        assert!(content[..1024].iter().all(|&b| b == 0xFF));
        assert!(content[3072..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn open_rejects_outside_roots() {
        let (dir, _path) = scratch_device(4096);
        let err = BlockWriter::open_with_roots(Path::new("/etc/hostname"), &[dir.path()]);
        assert!(err.is_err());
    }

    #[test]
    fn raw_writer_applies_base_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.img");
        let mut writer = RawWriter::open(&path, 100).unwrap();
        writer.write_at(0, b"abc").unwrap();
        writer.sync().unwrap();

        let mut content = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(&content[100..103], b"abc");
    }

    #[test]
    fn data_writer_dispatches_by_mode() {
        let dir = tempfile::tempdir().unwrap();

        // raw mode: fresh output file, stale bytes truncated away
        let out = dir.path().join("out.img");
        std::fs::write(&out, vec![0xFF; 64]).unwrap();
        let mut writer = DataWriter::create(WriteMode::Raw, &out, 0).unwrap();
        writer.write_at(0, b"image").unwrap();
        writer.sync().unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"image");

        // block mode: offset-addressed writes under the containment roots
        let (blk_dir, blk_path) = scratch_device(8192);
        let mut writer =
            DataWriter::create_with_roots(WriteMode::Block, &blk_path, 0, &[blk_dir.path()])
                .unwrap();
        writer.write_at(4096, b"tail").unwrap();
        writer.sync().unwrap();
        let mut content = Vec::new();
        File::open(&blk_path).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content.len(), 8192);
        assert_eq!(&content[4096..4100], b"tail");

        let err = DataWriter::create_with_roots(
            WriteMode::Block,
            Path::new("/etc/hostname"),
            0,
            &[blk_dir.path()],
        );
        assert!(err.is_err());
    }
}
