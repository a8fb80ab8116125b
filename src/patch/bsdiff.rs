// SPDX-License-Identifier: Apache-2.0

//! BSDIFF40 patch generation: suffix-array match scan over the new image,
//! then three bzip2 members (control, diff, extra) behind a fixed header.

use crate::constants::BSDIFF_MAGIC;
use crate::error::{Result, UpdateError};
use crate::patch::suffix_array::SuffixArray;
use crate::patch::{encode_off, ControlEntry};
use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::io::Write;
use tracing::debug;

// a match must beat the bytes the previous alignment already explains by
// this much before it is worth a new control entry
const SCORE_THRESHOLD: i64 = 8;

struct Region {
    ctrl: ControlEntry,
    diff_new: usize,
    diff_old: usize,
    extra_new: usize,
}

/// Generates a patch transforming `old` into `new`.
pub fn make_patch(old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
    let sa = SuffixArray::build(old);
    let regions = scan_regions(old, new, &sa);
    debug!(regions = regions.len(), old = old.len(), new = new.len(), "emitting patch");
    emit(old, new, &regions)
}

/// The greedy longest-common-substring scan. Mirrors the classic control
/// loop: extend the current region while the suffix match does not beat the
/// score of the previous alignment, then settle the boundary by maximizing
/// 2*match - distance on both sides and resolving any overlap.
fn scan_regions(old: &[u8], new: &[u8], sa: &SuffixArray) -> Vec<Region> {
    let old_size = old.len() as i64;
    let new_size = new.len() as i64;

    let mut regions = Vec::new();
    let mut scan = 0i64;
    let mut len = 0i64;
    let mut pos = 0i64;
    let mut last_scan = 0i64;
    let mut last_pos = 0i64;
    let mut last_offset = 0i64;

    while scan < new_size {
        let mut old_score = 0i64;
        scan += len;
        let mut scsc = scan;
        while scan < new_size {
            let (l, p) = sa.search(old, &new[scan as usize..]);
            len = l;
            pos = p;
            while scsc < scan + len {
                if scsc + last_offset < old_size
                    && old[(scsc + last_offset) as usize] == new[scsc as usize]
                {
                    old_score += 1;
                }
                scsc += 1;
            }
            if (len == old_score && len != 0) || len > old_score + SCORE_THRESHOLD {
                break;
            }
            if scan + last_offset < old_size
                && old[(scan + last_offset) as usize] == new[scan as usize]
            {
                old_score -= 1;
            }
            scan += 1;
        }

        if len != old_score || scan == new_size {
            // forward extension from the previous boundary
            let mut s = 0i64;
            let mut best = 0i64;
            let mut len_front = 0i64;
            let mut i = 0i64;
            while last_scan + i < scan && last_pos + i < old_size {
                if old[(last_pos + i) as usize] == new[(last_scan + i) as usize] {
                    s += 1;
                }
                i += 1;
                if s * 2 - i > best * 2 - len_front {
                    best = s;
                    len_front = i;
                }
            }

            // backward extension from the new match
            let mut len_back = 0i64;
            if scan < new_size {
                let mut s = 0i64;
                let mut best = 0i64;
                let mut i = 1i64;
                while scan >= last_scan + i && pos >= i {
                    if old[(pos - i) as usize] == new[(scan - i) as usize] {
                        s += 1;
                    }
                    if s * 2 - i > best * 2 - len_back {
                        best = s;
                        len_back = i;
                    }
                    i += 1;
                }
            }

            // the extensions may cross; pick the split with the best local
            // score inside the overlap
            if last_scan + len_front > scan - len_back {
                let overlap = (last_scan + len_front) - (scan - len_back);
                let mut s = 0i64;
                let mut best = 0i64;
                let mut lens = 0i64;
                for i in 0..overlap {
                    if new[(last_scan + len_front - overlap + i) as usize]
                        == old[(last_pos + len_front - overlap + i) as usize]
                    {
                        s += 1;
                    }
                    if new[(scan - len_back + i) as usize]
                        == old[(pos - len_back + i) as usize]
                    {
                        s -= 1;
                    }
                    if s > best {
                        best = s;
                        lens = i + 1;
                    }
                }
                len_front += lens - overlap;
                len_back -= lens;
            }

            regions.push(Region {
                ctrl: ControlEntry {
                    diff_len: len_front,
                    extra_len: (scan - len_back) - (last_scan + len_front),
                    offset_delta: (pos - len_back) - (last_pos + len_front),
                },
                diff_new: last_scan as usize,
                diff_old: last_pos as usize,
                extra_new: (last_scan + len_front) as usize,
            });
            last_scan = scan - len_back;
            last_pos = pos - len_back;
            last_offset = pos - scan;
        }
    }

    // the final entry ends the stream, so its seek is never taken
    if let Some(last) = regions.last_mut() {
        last.ctrl.offset_delta = 0;
    }
    regions
}

fn emit(old: &[u8], new: &[u8], regions: &[Region]) -> Result<Vec<u8>> {
    let mut control = BzEncoder::new(Vec::new(), Compression::best());
    for region in regions {
        control.write_all(&encode_off(region.ctrl.diff_len))?;
        control.write_all(&encode_off(region.ctrl.extra_len))?;
        control.write_all(&encode_off(region.ctrl.offset_delta))?;
    }
    let control = control.finish()?;

    let mut diff = BzEncoder::new(Vec::new(), Compression::best());
    for region in regions {
        let n = region.ctrl.diff_len as usize;
        let bytes: Vec<u8> = (0..n)
            .map(|i| new[region.diff_new + i].wrapping_sub(old[region.diff_old + i]))
            .collect();
        diff.write_all(&bytes)?;
    }
    let diff = diff.finish()?;

    let mut extra = BzEncoder::new(Vec::new(), Compression::best());
    for region in regions {
        let n = region.ctrl.extra_len as usize;
        extra.write_all(&new[region.extra_new..region.extra_new + n])?;
    }
    let extra = extra.finish()?;

    let mut patch = Vec::with_capacity(32 + control.len() + diff.len() + extra.len());
    patch.extend_from_slice(BSDIFF_MAGIC);
    patch.extend_from_slice(&encode_off(control.len() as i64));
    patch.extend_from_slice(&encode_off(diff.len() as i64));
    patch.extend_from_slice(&encode_off(new.len() as i64));
    patch.extend_from_slice(&control);
    patch.extend_from_slice(&diff);
    patch.extend_from_slice(&extra);

    if patch.len() != 32 + control.len() + diff.len() + extra.len() {
        return Err(UpdateError::BadPatch("patch output truncated".into()));
    }
    Ok(patch)
}
