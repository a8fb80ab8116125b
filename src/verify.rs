// SPDX-License-Identifier: Apache-2.0

use crate::blockset::BlockSet;
use crate::constants::BLOCK_SIZE;
use crate::device::BlockWriter;
use crate::error::{Result, UpdateError};
use sha2::{Digest, Sha256};

/// Computes the rolling sha-256 of the blocks named by `set`, in iteration
/// order, through one reusable page-sized buffer.
pub fn hash_blocks(device: &BlockWriter, set: &BlockSet) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    for block in set.iter_blocks() {
        device.read_at(block * BLOCK_SIZE, &mut buf)?;
        hasher.update(&buf);
    }
    Ok(hasher.finalize().into())
}

/// Verifies the blocks in `set` against an expected digest and block count.
pub fn verify_blocks(
    device: &BlockWriter,
    set: &BlockSet,
    expected: &[u8; 32],
    expected_blocks: u64,
) -> Result<()> {
    if set.block_count() != expected_blocks {
        return Err(UpdateError::InvalidRange {
            start: set.block_count(),
            end: expected_blocks,
        });
    }
    let actual = hash_blocks(device, set)?;
    if &actual != expected {
        return Err(UpdateError::HashMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}

/// In-memory variant used by the interpreter on buffers it already holds.
pub fn hash_buffer(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
