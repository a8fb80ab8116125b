// SPDX-License-Identifier: Apache-2.0

//! Transfer-list execution: strictly sequential rewriting of one target
//! partition from a source partition, a patch blob, a new-data blob and the
//! stash. Restart granularity is the whole partition; the partition record
//! at the layer above decides whether to run at all.

use crate::blockset::BlockSet;
use crate::constants::BLOCK_SIZE;
use crate::device::BlockWriter;
use crate::error::{Result, UpdateError};
use crate::patch::{apply_image_diff, apply_patch};
use crate::transfer::command::{Command, TransferList};
use crate::transfer::stash::StashStore;
use crate::verify::{hash_buffer, verify_blocks};
use tracing::{debug, info};

/// Receives per-command progress deltas in written blocks.
pub trait ProgressSink {
    fn advance(&mut self, blocks: u64);
}

/// Sink for callers that do not report progress (tests, CLI one-shots).
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn advance(&mut self, _blocks: u64) {}
}

pub struct Interpreter<'a> {
    source: &'a BlockWriter,
    target: &'a BlockWriter,
    patch_blob: &'a [u8],
    new_data: &'a [u8],
    stash: StashStore,
    new_pos: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        source: &'a BlockWriter,
        target: &'a BlockWriter,
        patch_blob: &'a [u8],
        new_data: &'a [u8],
        stash: StashStore,
    ) -> Self {
        Self {
            source,
            target,
            patch_blob,
            new_data,
            stash,
            new_pos: 0,
        }
    }

    /// Runs the whole program. Any failure is fatal to this partition; the
    /// final fsync on success is what makes the writes visible in order.
    pub fn execute(
        &mut self,
        list: &TransferList,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        info!(
            commands = list.commands.len(),
            total_blocks = list.total_blocks,
            "executing transfer list"
        );
        for (index, command) in list.commands.iter().enumerate() {
            self.step(list, index, command)?;
            progress.advance(command.written_blocks());
        }
        self.target.sync()?;
        Ok(())
    }

    fn step(&mut self, list: &TransferList, index: usize, command: &Command) -> Result<()> {
        match command {
            Command::New { target } => {
                let len = target.byte_len() as usize;
                if self.new_pos + len > self.new_data.len() {
                    return Err(UpdateError::ProgramInvalid(format!(
                        "new-data stream exhausted at command {}",
                        index
                    )));
                }
                let data = &self.new_data[self.new_pos..self.new_pos + len];
                write_blocks(self.target, target, data)?;
                self.new_pos += len;
            }
            Command::Zero { target } => {
                let zeros = vec![0u8; BLOCK_SIZE as usize];
                for block in target.iter_blocks() {
                    self.target.write_at(block * BLOCK_SIZE, &zeros)?;
                }
            }
            Command::Erase { target } => {
                for &(start, end) in target.ranges() {
                    self.target
                        .discard(start * BLOCK_SIZE, (end - start) * BLOCK_SIZE)?;
                }
            }
            Command::Move {
                hash,
                target,
                source,
            } => {
                let data = self.source_bytes(source)?;
                let actual = hash_buffer(&data);
                if &actual != hash {
                    return Err(UpdateError::HashMismatch {
                        expected: hex::encode(hash),
                        actual: hex::encode(actual),
                    });
                }
                write_blocks(self.target, target, &data)?;
                verify_blocks(self.target, target, hash, target.block_count())?;
            }
            Command::Bsdiff {
                patch_start,
                patch_len,
                src_hash,
                dst_hash,
                target,
                source,
            } => {
                let output = self.patch_source(
                    *patch_start,
                    *patch_len,
                    src_hash,
                    source,
                    false,
                )?;
                self.write_patched(target, dst_hash, &output)?;
            }
            Command::ImgDiff {
                patch_start,
                patch_len,
                src_hash,
                dst_hash,
                target,
                source,
            } => {
                let output = self.patch_source(
                    *patch_start,
                    *patch_len,
                    src_hash,
                    source,
                    true,
                )?;
                self.write_patched(target, dst_hash, &output)?;
            }
            Command::Stash { hash, source } => {
                let data = read_blocks(self.source, source)?;
                let declared = list.declared_consumers(index);
                self.stash.save(hash, source, &data, declared)?;
            }
            Command::Free { hash } => {
                self.stash.free(hash)?;
            }
        }
        debug!(index, "command complete");
        Ok(())
    }

    /// Source bytes for a patch-style command: the stash wins when it holds
    /// exactly this set, because the on-device blocks may already be
    /// overwritten.
    fn source_bytes(&mut self, set: &BlockSet) -> Result<Vec<u8>> {
        if let Some(key) = self.stash.key_for_set(set) {
            return self.stash.load(&key);
        }
        read_blocks(self.source, set)
    }

    fn patch_source(
        &mut self,
        patch_start: u64,
        patch_len: u64,
        src_hash: &[u8; 32],
        source: &BlockSet,
        image_diff: bool,
    ) -> Result<Vec<u8>> {
        let src_data = self.source_bytes(source)?;
        let actual = hash_buffer(&src_data);
        if &actual != src_hash {
            return Err(UpdateError::HashMismatch {
                expected: hex::encode(src_hash),
                actual: hex::encode(actual),
            });
        }

        let end = patch_start
            .checked_add(patch_len)
            .filter(|&e| e <= self.patch_blob.len() as u64)
            .ok_or_else(|| {
                UpdateError::BadPatch(format!(
                    "patch range [{}, +{}) outside blob of {} bytes",
                    patch_start,
                    patch_len,
                    self.patch_blob.len()
                ))
            })?;
        let patch = &self.patch_blob[patch_start as usize..end as usize];

        if image_diff {
            apply_image_diff(&src_data, patch)
        } else {
            apply_patch(&src_data, patch)
        }
    }

    fn write_patched(
        &mut self,
        target: &BlockSet,
        dst_hash: &[u8; 32],
        output: &[u8],
    ) -> Result<()> {
        if output.len() as u64 != target.byte_len() {
            return Err(UpdateError::BadPatch(format!(
                "patch output {} bytes, target set holds {}",
                output.len(),
                target.byte_len()
            )));
        }
        write_blocks(self.target, target, output)?;
        verify_blocks(self.target, target, dst_hash, target.block_count())
    }
}

fn read_blocks(device: &BlockWriter, set: &BlockSet) -> Result<Vec<u8>> {
    let mut data = vec![0u8; set.byte_len() as usize];
    let mut pos = 0usize;
    for &(start, end) in set.ranges() {
        let len = ((end - start) * BLOCK_SIZE) as usize;
        device.read_at(start * BLOCK_SIZE, &mut data[pos..pos + len])?;
        pos += len;
    }
    Ok(data)
}

fn write_blocks(device: &BlockWriter, set: &BlockSet, data: &[u8]) -> Result<()> {
    if data.len() as u64 != set.byte_len() {
        return Err(UpdateError::InvalidRange {
            start: data.len() as u64,
            end: set.byte_len(),
        });
    }
    let mut pos = 0usize;
    for &(start, end) in set.ranges() {
        let len = ((end - start) * BLOCK_SIZE) as usize;
        device.write_at(start * BLOCK_SIZE, &data[pos..pos + len])?;
        pos += len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::make_patch;
    use crate::transfer::command::TRANSFER_LIST_VERSION;
    use std::fs::File;
    use std::os::unix::fs::FileExt;
    use std::path::PathBuf;

    const BS: usize = BLOCK_SIZE as usize;

    fn scratch(dir: &tempfile::TempDir, name: &str, blocks: u64) -> PathBuf {
        let path = dir.path().join(name);
        File::create(&path)
            .unwrap()
            .set_len(blocks * BLOCK_SIZE)
            .unwrap();
        path
    }

    fn fill(path: &PathBuf, block: u64, byte: u8) {
        let file = File::options().write(true).open(path).unwrap();
        file.write_all_at(&[byte; BS], block * BLOCK_SIZE).unwrap();
    }

    fn read_block(path: &PathBuf, block: u64) -> Vec<u8> {
        let file = File::open(path).unwrap();
        let mut buf = vec![0u8; BS];
        file.read_exact_at(&mut buf, block * BLOCK_SIZE).unwrap();
        buf
    }

    fn run(list: &TransferList, ctx: &TestCtx) -> Result<()> {
        let source = BlockWriter::open_with_roots(&ctx.source, &[ctx.dir.path()]).unwrap();
        let target = BlockWriter::open_with_roots(&ctx.target, &[ctx.dir.path()]).unwrap();
        let stash = StashStore::open(ctx.dir.path().join("stash")).unwrap();
        let mut interp = Interpreter::new(&source, &target, &ctx.patch, &ctx.new_data, stash);
        interp.execute(list, &mut NoProgress)
    }

    struct TestCtx {
        dir: tempfile::TempDir,
        source: PathBuf,
        target: PathBuf,
        patch: Vec<u8>,
        new_data: Vec<u8>,
    }

    fn ctx(blocks: u64) -> TestCtx {
        let dir = tempfile::tempdir().unwrap();
        let source = scratch(&dir, "source", blocks);
        let target = scratch(&dir, "target", blocks);
        TestCtx {
            dir,
            source,
            target,
            patch: Vec::new(),
            new_data: Vec::new(),
        }
    }

    fn list_of(commands: Vec<Command>, total: u64, stash_max: u64) -> TransferList {
        TransferList {
            version: TRANSFER_LIST_VERSION,
            total_blocks: total,
            stash_max,
            commands,
        }
    }

    #[test]
    fn new_zero_and_move() {
        let mut ctx = ctx(8);
        fill(&ctx.source, 0, 0x55);
        fill(&ctx.source, 1, 0x66);
        fill(&ctx.target, 3, 0xFF);
        ctx.new_data = vec![0x11; BS];

        let moved: Vec<u8> = [vec![0x55u8; BS], vec![0x66u8; BS]].concat();
        let commands = vec![
            Command::New {
                target: BlockSet::parse("2,0,1").unwrap(),
            },
            Command::Zero {
                target: BlockSet::parse("2,3,4").unwrap(),
            },
            Command::Move {
                hash: hash_buffer(&moved),
                target: BlockSet::parse("2,4,6").unwrap(),
                source: BlockSet::parse("2,0,2").unwrap(),
            },
        ];
        run(&list_of(commands, 5, 0), &ctx).unwrap();

        assert_eq!(read_block(&ctx.target, 0), vec![0x11; BS]);
        assert_eq!(read_block(&ctx.target, 3), vec![0x00; BS]);
        assert_eq!(read_block(&ctx.target, 4), vec![0x55; BS]);
        assert_eq!(read_block(&ctx.target, 5), vec![0x66; BS]);
    }

    #[test]
    fn bsdiff_command_applies_patch() {
        let mut ctx = ctx(4);
        fill(&ctx.source, 0, 0xAA);
        let src = vec![0xAAu8; BS];
        let mut dst = src.clone();
        dst[100..104].fill(0xBB);
        ctx.patch = make_patch(&src, &dst).unwrap();

        let commands = vec![Command::Bsdiff {
            patch_start: 0,
            patch_len: ctx.patch.len() as u64,
            src_hash: hash_buffer(&src),
            dst_hash: hash_buffer(&dst),
            target: BlockSet::parse("2,1,2").unwrap(),
            source: BlockSet::parse("2,0,1").unwrap(),
        }];
        run(&list_of(commands, 1, 0), &ctx).unwrap();
        assert_eq!(read_block(&ctx.target, 1), dst);
    }

    #[test]
    fn stash_covers_self_overwrite() {
        let mut ctx = ctx(4);
        fill(&ctx.source, 0, 0x10);
        fill(&ctx.source, 1, 0x20);
        ctx.new_data = vec![0x99; BS];
        // target and source are the same device: block 0 is rewritten by
        // new data before the move consumes its original content
        ctx.target = ctx.source.clone();

        let original = vec![0x10u8; BS];
        let key = hash_buffer(&original);
        let commands = vec![
            Command::Stash {
                hash: key,
                source: BlockSet::parse("2,0,1").unwrap(),
            },
            Command::New {
                target: BlockSet::parse("2,0,1").unwrap(),
            },
            Command::Move {
                hash: key,
                target: BlockSet::parse("2,2,3").unwrap(),
                source: BlockSet::parse("2,0,1").unwrap(),
            },
            Command::Free { hash: key },
        ];
        run(&list_of(commands, 2, 1), &ctx).unwrap();

        assert_eq!(read_block(&ctx.source, 0), vec![0x99; BS]);
        assert_eq!(read_block(&ctx.source, 2), original);
    }

    #[test]
    fn hash_mismatch_aborts() {
        let ctx = ctx(4);
        let commands = vec![Command::Move {
            hash: [0xEE; 32],
            target: BlockSet::parse("2,1,2").unwrap(),
            source: BlockSet::parse("2,0,1").unwrap(),
        }];
        let err = run(&list_of(commands, 1, 0), &ctx).unwrap_err();
        assert!(matches!(err, UpdateError::HashMismatch { .. }));
    }

    #[test]
    fn new_data_exhaustion_is_program_error() {
        let mut ctx = ctx(4);
        ctx.new_data = vec![0u8; BS / 2];
        let commands = vec![Command::New {
            target: BlockSet::parse("2,0,1").unwrap(),
        }];
        let err = run(&list_of(commands, 1, 0), &ctx).unwrap_err();
        assert!(matches!(err, UpdateError::ProgramInvalid(_)));
    }

    #[test]
    fn patch_range_outside_blob_rejected() {
        let mut ctx = ctx(4);
        ctx.patch = vec![0u8; 10];
        let src = vec![0u8; BS];
        let commands = vec![Command::Bsdiff {
            patch_start: 8,
            patch_len: 100,
            src_hash: hash_buffer(&src),
            dst_hash: [0u8; 32],
            target: BlockSet::parse("2,1,2").unwrap(),
            source: BlockSet::parse("2,0,1").unwrap(),
        }];
        let err = run(&list_of(commands, 1, 0), &ctx).unwrap_err();
        assert!(matches!(err, UpdateError::BadPatch(_)));
    }
}
