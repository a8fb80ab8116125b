// SPDX-License-Identifier: Apache-2.0

//! Generator/applier properties over the block patch formats.

use ota_updater::patch::bspatch::read_control_entries;
use ota_updater::patch::{apply_image_diff, apply_patch, make_patch, ImageDiffBuilder};

#[test]
fn empty_patch_copies_old() {
    let patch = make_patch(b"abc", b"abc").unwrap();
    let entries = read_control_entries(&patch).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        (entries[0].diff_len, entries[0].extra_len, entries[0].offset_delta),
        (3, 0, 0)
    );
    assert_eq!(apply_patch(b"abc", &patch).unwrap(), b"abc");
}

#[test]
fn pure_insert_is_all_extra() {
    let patch = make_patch(b"", b"hello").unwrap();
    let entries = read_control_entries(&patch).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        (entries[0].diff_len, entries[0].extra_len, entries[0].offset_delta),
        (0, 5, 0)
    );
    assert_eq!(apply_patch(b"", &patch).unwrap(), b"hello");
}

#[test]
fn substitution_at_fixed_offset() {
    let mut old = vec![0u8; 4096];
    old[100..104].fill(0xAA);
    let mut new = old.clone();
    new[100..104].fill(0xBB);

    let patch = make_patch(&old, &new).unwrap();
    assert_eq!(apply_patch(&old, &patch).unwrap(), new);
}

#[test]
fn generated_patches_roundtrip_for_every_edit_shape() {
    let old: Vec<u8> = (0u8..=255).cycle().take(50_000).collect();

    // prepend, append, delete, scattered edits, truncation
    let mut cases: Vec<Vec<u8>> = Vec::new();
    let mut prepended = b"HDR!".to_vec();
    prepended.extend_from_slice(&old);
    cases.push(prepended);
    let mut appended = old.clone();
    appended.extend_from_slice(b"trailing-data");
    cases.push(appended);
    cases.push(old[1000..40_000].to_vec());
    let mut scattered = old.clone();
    for i in (0..scattered.len()).step_by(997) {
        scattered[i] ^= 0x5A;
    }
    cases.push(scattered);
    cases.push(old[..123].to_vec());
    cases.push(Vec::new());

    for (index, new) in cases.iter().enumerate() {
        let patch = make_patch(&old, new).unwrap();
        assert_eq!(&apply_patch(&old, &patch).unwrap(), new, "case {}", index);
    }
}

#[test]
fn apply_is_bit_for_bit_deterministic() {
    let old = vec![0x37u8; 30_000];
    let mut new = old.clone();
    new[10_000..10_500].fill(0x38);
    let patch = make_patch(&old, &new).unwrap();

    let a = apply_patch(&old, &patch).unwrap();
    let b = apply_patch(&old, &patch).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, new);

    let patch_again = make_patch(&old, &new).unwrap();
    assert_eq!(patch, patch_again, "generation is deterministic too");
}

#[test]
fn image_diff_mixes_chunk_types() {
    let old: Vec<u8> = (0u8..=255).cycle().take(16_384).collect();

    let region_old = &old[4096..8192];
    let mut region_new = region_old.to_vec();
    region_new[100..200].fill(0x01);
    let patch = make_patch(region_old, &region_new).unwrap();

    let diff = ImageDiffBuilder::new()
        .copy(0, 4096)
        .bsdiff(patch, 4096, 4096)
        .raw(b"fresh tail")
        .build();

    let out = apply_image_diff(&old, &diff).unwrap();
    assert_eq!(&out[..4096], &old[..4096]);
    assert_eq!(&out[4096..4096 + region_new.len()], &region_new[..]);
    assert_eq!(&out[out.len() - 10..], b"fresh tail");
}

#[test]
fn corrupt_patches_never_apply() {
    let old = b"some old content".repeat(100);
    let new = b"some new content".repeat(100);
    let patch = make_patch(&old, &new).unwrap();

    // flip a byte in each region of the patch
    for pos in [0usize, 9, 33, patch.len() / 2, patch.len() - 1] {
        let mut corrupt = patch.clone();
        corrupt[pos] ^= 0xFF;
        // either refuses outright or produces different bytes; silence
        // is the only unacceptable outcome
        if let Ok(result) = apply_patch(&old, &corrupt) {
            assert_ne!(result, new, "corruption at {} went unnoticed", pos);
        }
    }
}
