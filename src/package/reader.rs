// SPDX-License-Identifier: Apache-2.0

//! Streaming package reader. Listing walks the central directory and parses
//! the embedded manifest; extraction runs a producer task that decodes the
//! entry into bounded chunks consumed through a channel, so one side never
//! runs far ahead of the other and a stop releases both within a chunk.

use crate::constants::{
    HASHTREE_ENTRY, MANIFEST_ENTRY, METHOD_DEFLATE, METHOD_GZIP, METHOD_LZ4, METHOD_STORE,
};
use crate::error::{Result, UpdateError};
use crate::package::manifest::PackageManifest;
use crate::package::signature::HashTree;
use crate::package::zip::{PkgEntry, ZipParser};
use crate::package::PkgIO;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 64 * 1024;
const RING_CAPACITY: usize = 16;

static CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

fn bad(msg: impl Into<String>) -> UpdateError {
    UpdateError::BadPackage(msg.into())
}

pub struct PkgReader<I: PkgIO> {
    io: Arc<I>,
    entries: Vec<PkgEntry>,
    manifest: PackageManifest,
    hash_tree: HashTree,
    extracting: Arc<AtomicBool>,
}

impl<I: PkgIO + 'static> PkgReader<I> {
    /// Lists the container, parses the manifest entry and the optional
    /// hash-tree sidecar.
    pub async fn load(io: I) -> Result<Self> {
        let io = Arc::new(io);
        let (entries, manifest, hash_tree) = Self::load_package(&io).await?;
        Ok(Self {
            io,
            entries,
            manifest,
            hash_tree,
            extracting: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn load_package(io: &Arc<I>) -> Result<(Vec<PkgEntry>, PackageManifest, HashTree)> {
        let entries = ZipParser::list_entries(io.as_ref()).await?;
        debug!(entries = entries.len(), "package listed");

        let manifest_entry = entries
            .iter()
            .find(|e| e.name == MANIFEST_ENTRY)
            .ok_or_else(|| bad(format!("package has no {}", MANIFEST_ENTRY)))?;
        let raw = read_whole(io.as_ref(), manifest_entry).await?;
        let manifest = PackageManifest::decode(&raw)?;

        let hash_tree = match entries.iter().find(|e| e.name == HASHTREE_ENTRY) {
            Some(entry) => HashTree::decode(&read_whole(io.as_ref(), entry).await?)?,
            None => HashTree::new(),
        };

        Ok((entries, manifest, hash_tree))
    }

    /// Re-lists the container on the same handle. A second load after a
    /// completed extraction yields the same manifest.
    pub async fn reload(&mut self) -> Result<()> {
        let (entries, manifest, hash_tree) = Self::load_package(&self.io).await?;
        self.entries = entries;
        self.manifest = manifest;
        self.hash_tree = hash_tree;
        Ok(())
    }

    pub fn manifest(&self) -> &PackageManifest {
        &self.manifest
    }

    pub fn hash_tree(&self) -> &HashTree {
        &self.hash_tree
    }

    pub fn entry(&self, name: &str) -> Option<&PkgEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Opens a streaming extraction. At most one may be in flight per
    /// reader; the stream's drop releases the slot.
    pub async fn open_entry(&self, name: &str) -> Result<EntryStream> {
        if self.extracting.swap(true, Ordering::AcqRel) {
            return Err(bad("another extraction is already in flight"));
        }
        let slot = ExtractSlot(self.extracting.clone());

        let entry = match self.entry(name) {
            Some(entry) => entry.clone(),
            None => return Err(bad(format!("no entry named {}", name))),
        };
        let data_offset = ZipParser::data_offset(self.io.as_ref(), &entry).await?;
        let io = self.io.clone();

        let (tx, rx) = mpsc::channel::<Result<Vec<u8>>>(RING_CAPACITY);
        let producer = tokio::spawn(async move {
            if let Err(e) = produce(io, entry, data_offset, &tx).await {
                // consumer may already be gone; that is a normal stop
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(EntryStream {
            rx,
            producer,
            _slot: slot,
        })
    }

    /// Extracts a whole entry into memory, verifying its CRC and, when the
    /// hash tree lists it, its sha-256.
    pub async fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        let mut stream = self.open_entry(name).await?;
        let mut out = Vec::new();
        let mut hasher = Sha256::new();
        while let Some(chunk) = stream.next_chunk().await? {
            hasher.update(&chunk);
            out.extend_from_slice(&chunk);
        }
        let entry = self.entry(name).expect("entry disappeared during read");
        let computed = crc32(&out);
        if computed != entry.crc32 {
            return Err(bad(format!(
                "entry {} crc mismatch: directory {:08x}, data {:08x}",
                name, entry.crc32, computed
            )));
        }
        if out.len() as u64 != entry.uncompressed_size {
            return Err(bad(format!(
                "entry {} size mismatch: directory {}, data {}",
                name,
                entry.uncompressed_size,
                out.len()
            )));
        }
        self.hash_tree.check(name, &hasher.finalize().into())?;
        Ok(out)
    }

    /// Streams a whole entry to `sink`, returning (bytes, sha-256). CRC and
    /// hash-tree checks run on the fly; a failure after partial output is
    /// the caller's signal to discard the sink.
    pub async fn extract_to<W: tokio::io::AsyncWrite + Unpin>(
        &self,
        name: &str,
        sink: &mut W,
    ) -> Result<(u64, [u8; 32])> {
        use tokio::io::AsyncWriteExt;
        let mut stream = self.open_entry(name).await?;
        let mut hasher = Sha256::new();
        let mut crc = CRC.digest();
        let mut total = 0u64;
        while let Some(chunk) = stream.next_chunk().await? {
            hasher.update(&chunk);
            crc.update(&chunk);
            total += chunk.len() as u64;
            sink.write_all(&chunk).await?;
        }
        sink.flush().await?;

        let entry = self.entry(name).expect("entry disappeared during extract");
        if crc.finalize() != entry.crc32 {
            return Err(bad(format!("entry {} crc mismatch", name)));
        }
        let digest: [u8; 32] = hasher.finalize().into();
        self.hash_tree.check(name, &digest)?;
        Ok((total, digest))
    }
}

struct ExtractSlot(Arc<AtomicBool>);

impl Drop for ExtractSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Consumer half of the extraction ring.
pub struct EntryStream {
    rx: mpsc::Receiver<Result<Vec<u8>>>,
    producer: tokio::task::JoinHandle<()>,
    _slot: ExtractSlot,
}

impl EntryStream {
    /// The next decompressed chunk, or None at end of entry.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Stops the extraction: closes the ring so the producer's next push
    /// fails, then aborts it. Safe to call mid-stream.
    pub fn stop(&mut self) {
        self.rx.close();
        self.producer.abort();
    }
}

impl Drop for EntryStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

async fn produce<I: PkgIO>(
    io: Arc<I>,
    entry: PkgEntry,
    data_offset: u64,
    tx: &mpsc::Sender<Result<Vec<u8>>>,
) -> Result<()> {
    // pull the stored bytes range-by-range, then decode in one pass;
    // decompressed chunks are what the ring bounds
    let mut stored = vec![0u8; entry.compressed_size as usize];
    let mut read = 0usize;
    while read < stored.len() {
        let n = CHUNK_SIZE.min(stored.len() - read);
        io.read_at(data_offset + read as u64, &mut stored[read..read + n])
            .await?;
        read += n;
    }

    match entry.method {
        METHOD_STORE => {
            for chunk in stored.chunks(CHUNK_SIZE) {
                if tx.send(Ok(chunk.to_vec())).await.is_err() {
                    warn!(entry = %entry.name, "extraction stopped by consumer");
                    return Ok(());
                }
            }
        }
        METHOD_DEFLATE => {
            let decoder =
                async_compression::tokio::bufread::DeflateDecoder::new(stored.as_slice());
            push_decoded(decoder, tx, &entry.name).await?;
        }
        METHOD_GZIP => {
            let decoder = async_compression::tokio::bufread::GzipDecoder::new(stored.as_slice());
            push_decoded(decoder, tx, &entry.name).await?;
        }
        METHOD_LZ4 => {
            let decoded = lz4_flex::decompress_size_prepended(&stored)
                .map_err(|e| bad(format!("lz4 entry {}: {}", entry.name, e)))?;
            for chunk in decoded.chunks(CHUNK_SIZE) {
                if tx.send(Ok(chunk.to_vec())).await.is_err() {
                    return Ok(());
                }
            }
        }
        other => return Err(UpdateError::UnsupportedEntry(other)),
    }
    Ok(())
}

async fn push_decoded<R: tokio::io::AsyncRead + Unpin>(
    mut decoder: R,
    tx: &mpsc::Sender<Result<Vec<u8>>>,
    name: &str,
) -> Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = decoder
            .read(&mut buf)
            .await
            .map_err(|e| bad(format!("decode {}: {}", name, e)))?;
        if n == 0 {
            return Ok(());
        }
        if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
            warn!(entry = name, "extraction stopped by consumer");
            return Ok(());
        }
    }
}

async fn read_whole<I: PkgIO>(io: &I, entry: &PkgEntry) -> Result<Vec<u8>> {
    let data_offset = ZipParser::data_offset(io, entry).await?;
    let mut stored = vec![0u8; entry.compressed_size as usize];
    io.read_at(data_offset, &mut stored).await?;
    match entry.method {
        METHOD_STORE => Ok(stored),
        METHOD_DEFLATE => {
            let mut decoder =
                async_compression::tokio::bufread::DeflateDecoder::new(stored.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .await
                .map_err(|e| bad(format!("decode {}: {}", entry.name, e)))?;
            Ok(out)
        }
        METHOD_GZIP => {
            let mut decoder =
                async_compression::tokio::bufread::GzipDecoder::new(stored.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .await
                .map_err(|e| bad(format!("decode {}: {}", entry.name, e)))?;
            Ok(out)
        }
        METHOD_LZ4 => lz4_flex::decompress_size_prepended(&stored)
            .map_err(|e| bad(format!("lz4 entry {}: {}", entry.name, e))),
        other => Err(UpdateError::UnsupportedEntry(other)),
    }
}
