// SPDX-License-Identifier: Apache-2.0

pub mod builder;
pub mod manifest;
pub mod reader;
pub mod signature;
pub mod zip;

pub use builder::PackageBuilder;
pub use manifest::{ComponentEntry, ComponentType, PackageManifest};
pub use reader::PkgReader;
pub use signature::SignatureVerifier;

use crate::error::Result;
use async_trait::async_trait;

/// Random-access byte source backing a package: a local file today, kept as
/// a trait so tests can parse from memory.
#[async_trait]
pub trait PkgIO: Send + Sync {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    async fn size(&self) -> Result<u64>;
}

pub struct FilePkgIO {
    file: std::fs::File,
    size: u64,
}

impl FilePkgIO {
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

#[async_trait]
impl PkgIO for FilePkgIO {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        tokio::task::block_in_place(|| {
            use std::os::unix::fs::FileExt;
            self.file.read_exact_at(buf, offset)?;
            Ok(())
        })
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

/// In-memory package, used by tests and by small-package loads where the
/// whole file is slurped up front.
pub struct MemPkgIO {
    pub data: Vec<u8>,
}

#[async_trait]
impl PkgIO for MemPkgIO {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = offset as usize;
        if offset + buf.len() > self.data.len() {
            return Err(crate::error::UpdateError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past package end",
            )));
        }
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }
}
