// SPDX-License-Identifier: Apache-2.0

//! PKGDIFF0: a chunked container carrying mixed raw, copy and BSDIFF
//! regions that together rebuild a whole image. Chunks apply in order;
//! every offset is bounds-checked and a source range past the end of the
//! source image is an error, never a clamp.

use crate::constants::PKGDIFF_MAGIC;
use crate::error::{Result, UpdateError};
use crate::patch::bspatch::apply_patch;

const CHUNK_RAW: u8 = 0;
const CHUNK_NORMAL: u8 = 1;
const CHUNK_BSDIFF: u8 = 2;

fn bad(msg: impl Into<String>) -> UpdateError {
    UpdateError::BadPatch(msg.into())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(bad("image diff truncated"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn source_slice(old: &[u8], start: u64, len: u64) -> Result<&[u8]> {
    let end = start
        .checked_add(len)
        .ok_or_else(|| bad("source range overflow"))?;
    if end > old.len() as u64 {
        return Err(bad(format!(
            "source range [{}, {}) past image end {}",
            start,
            end,
            old.len()
        )));
    }
    Ok(&old[start as usize..end as usize])
}

/// Applies an image diff to `old`, producing the full new image.
pub fn apply_image_diff(old: &[u8], image_diff: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor {
        data: image_diff,
        pos: 0,
    };
    if cursor.take(8)? != PKGDIFF_MAGIC {
        return Err(bad("bad image diff magic"));
    }
    let count = cursor.u32()?;

    let mut out = Vec::new();
    for index in 0..count {
        match cursor.u8()? {
            CHUNK_RAW => {
                let dst_len = cursor.u64()? as usize;
                out.extend_from_slice(cursor.take(dst_len)?);
            }
            CHUNK_NORMAL => {
                let src_start = cursor.u64()?;
                let src_len = cursor.u64()?;
                let dst_len = cursor.u64()?;
                if src_len != dst_len {
                    return Err(bad("copy chunk with mismatched lengths"));
                }
                out.extend_from_slice(source_slice(old, src_start, src_len)?);
            }
            CHUNK_BSDIFF => {
                let patch_offset = cursor.u64()? as usize;
                let patch_len = cursor.u64()? as usize;
                let src_start = cursor.u64()?;
                let src_len = cursor.u64()?;
                let end = patch_offset
                    .checked_add(patch_len)
                    .filter(|&e| e <= image_diff.len())
                    .ok_or_else(|| bad("embedded patch range out of bounds"))?;
                let src = source_slice(old, src_start, src_len)?;
                out.extend_from_slice(&apply_patch(src, &image_diff[patch_offset..end])?);
            }
            tag => {
                return Err(bad(format!("unknown chunk type {} at index {}", tag, index)));
            }
        }
    }
    Ok(out)
}

/// Assembles an image diff. Chunks are appended in apply order; embedded
/// BSDIFF patches land after the chunk table and are referenced by absolute
/// offset.
#[derive(Default)]
pub struct ImageDiffBuilder {
    chunks: Vec<ChunkSpec>,
}

enum ChunkSpec {
    Raw(Vec<u8>),
    Normal { src_start: u64, len: u64 },
    Bsdiff { patch: Vec<u8>, src_start: u64, src_len: u64 },
}

impl ImageDiffBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(mut self, data: &[u8]) -> Self {
        self.chunks.push(ChunkSpec::Raw(data.to_vec()));
        self
    }

    pub fn copy(mut self, src_start: u64, len: u64) -> Self {
        self.chunks.push(ChunkSpec::Normal { src_start, len });
        self
    }

    pub fn bsdiff(mut self, patch: Vec<u8>, src_start: u64, src_len: u64) -> Self {
        self.chunks.push(ChunkSpec::Bsdiff {
            patch,
            src_start,
            src_len,
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        // chunk table size first, so embedded patch offsets are known
        let mut table_len = 8 + 4;
        for chunk in &self.chunks {
            table_len += 1 + match chunk {
                ChunkSpec::Raw(data) => 8 + data.len(),
                ChunkSpec::Normal { .. } => 24,
                ChunkSpec::Bsdiff { .. } => 32,
            };
        }

        let mut out = Vec::with_capacity(table_len);
        out.extend_from_slice(PKGDIFF_MAGIC);
        out.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        let mut patch_cursor = table_len as u64;
        let mut patches = Vec::new();
        for chunk in &self.chunks {
            match chunk {
                ChunkSpec::Raw(data) => {
                    out.push(CHUNK_RAW);
                    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
                    out.extend_from_slice(data);
                }
                ChunkSpec::Normal { src_start, len } => {
                    out.push(CHUNK_NORMAL);
                    out.extend_from_slice(&src_start.to_le_bytes());
                    out.extend_from_slice(&len.to_le_bytes());
                    out.extend_from_slice(&len.to_le_bytes());
                }
                ChunkSpec::Bsdiff {
                    patch,
                    src_start,
                    src_len,
                } => {
                    out.push(CHUNK_BSDIFF);
                    out.extend_from_slice(&patch_cursor.to_le_bytes());
                    out.extend_from_slice(&(patch.len() as u64).to_le_bytes());
                    out.extend_from_slice(&src_start.to_le_bytes());
                    out.extend_from_slice(&src_len.to_le_bytes());
                    patch_cursor += patch.len() as u64;
                    patches.push(patch.as_slice());
                }
            }
        }
        for patch in patches {
            out.extend_from_slice(patch);
        }
        out
    }
}
