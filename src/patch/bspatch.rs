// SPDX-License-Identifier: Apache-2.0

//! BSDIFF40 patch application.

use crate::constants::BSDIFF_MAGIC;
use crate::error::{Result, UpdateError};
use crate::patch::{decode_off, ControlEntry};
use bzip2::read::BzDecoder;
use std::io::Read;

struct PatchHeader {
    control_len: usize,
    diff_len: usize,
    new_size: usize,
}

fn bad(msg: impl Into<String>) -> UpdateError {
    UpdateError::BadPatch(msg.into())
}

fn parse_header(patch: &[u8]) -> Result<PatchHeader> {
    if patch.len() < 32 {
        return Err(bad("patch shorter than header"));
    }
    if &patch[..8] != BSDIFF_MAGIC {
        return Err(bad("bad patch magic"));
    }
    let control_len = decode_off(patch[8..16].try_into().unwrap());
    let diff_len = decode_off(patch[16..24].try_into().unwrap());
    let new_size = decode_off(patch[24..32].try_into().unwrap());
    if control_len < 0 || diff_len < 0 || new_size < 0 {
        return Err(bad("negative length in patch header"));
    }
    let (control_len, diff_len, new_size) =
        (control_len as usize, diff_len as usize, new_size as usize);
    if 32 + control_len + diff_len > patch.len() {
        return Err(bad("patch streams exceed patch size"));
    }
    Ok(PatchHeader {
        control_len,
        diff_len,
        new_size,
    })
}

/// Reconstructs the new image from `old` and `patch`.
pub fn apply_patch(old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    let header = parse_header(patch)?;
    let mut control = BzDecoder::new(&patch[32..32 + header.control_len]);
    let mut diff = BzDecoder::new(&patch[32 + header.control_len..32 + header.control_len + header.diff_len]);
    let mut extra = BzDecoder::new(&patch[32 + header.control_len + header.diff_len..]);

    let mut new = vec![0u8; header.new_size];
    let mut new_pos = 0usize;
    let mut old_pos = 0i64;

    while new_pos < header.new_size {
        let ctrl = read_triple(&mut control)?
            .ok_or_else(|| bad("control stream ended before new image complete"))?;
        if ctrl.diff_len < 0 || ctrl.extra_len < 0 {
            return Err(bad("negative control length"));
        }
        let diff_len = ctrl.diff_len as usize;
        let extra_len = ctrl.extra_len as usize;

        if new_pos + diff_len > header.new_size {
            return Err(bad("diff span overruns new image"));
        }
        let span = &mut new[new_pos..new_pos + diff_len];
        diff.read_exact(span)
            .map_err(|_| bad("diff stream underrun"))?;
        for (i, byte) in span.iter_mut().enumerate() {
            let at = old_pos + i as i64;
            if at >= 0 && (at as usize) < old.len() {
                *byte = byte.wrapping_add(old[at as usize]);
            }
        }
        new_pos += diff_len;
        old_pos += ctrl.diff_len;

        if new_pos + extra_len > header.new_size {
            return Err(bad("extra span overruns new image"));
        }
        extra
            .read_exact(&mut new[new_pos..new_pos + extra_len])
            .map_err(|_| bad("extra stream underrun"))?;
        new_pos += extra_len;
        old_pos = old_pos
            .checked_add(ctrl.offset_delta)
            .ok_or_else(|| bad("old offset overflow"))?;
    }

    // all three members must end exactly where the new image does
    for (name, stream) in [
        ("control", &mut control as &mut dyn Read),
        ("diff", &mut diff),
        ("extra", &mut extra),
    ] {
        let mut probe = [0u8; 1];
        if stream.read(&mut probe).map_err(|_| bad("corrupt stream tail"))? != 0 {
            return Err(bad(format!("{} stream has trailing data", name)));
        }
    }

    Ok(new)
}

fn read_triple(control: &mut impl Read) -> Result<Option<ControlEntry>> {
    let mut raw = [0u8; 24];
    match control.read_exact(&mut raw) {
        Ok(()) => Ok(Some(ControlEntry {
            diff_len: decode_off(raw[0..8].try_into().unwrap()),
            extra_len: decode_off(raw[8..16].try_into().unwrap()),
            offset_delta: decode_off(raw[16..24].try_into().unwrap()),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(_) => Err(bad("control stream corrupt")),
    }
}

/// Decodes the full control stream; used by the diff CLI and tests to
/// inspect what a generator produced.
pub fn read_control_entries(patch: &[u8]) -> Result<Vec<ControlEntry>> {
    let header = parse_header(patch)?;
    let mut control = BzDecoder::new(&patch[32..32 + header.control_len]);
    let mut entries = Vec::new();
    while let Some(entry) = read_triple(&mut control)? {
        entries.push(entry);
    }
    Ok(entries)
}
