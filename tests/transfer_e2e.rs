// SPDX-License-Identifier: Apache-2.0

//! End-to-end transfer runs: the interpreter against scratch devices with
//! partition-record gating, and the real updater program driven over its
//! pipe protocol.

use ota_updater::blockset::BlockSet;
use ota_updater::constants::{
    BLOCK_SIZE, PARTITION_RECORD_AREA_LEN, PARTITION_RECORD_START,
};
use ota_updater::device::BlockWriter;
use ota_updater::misc::PartitionRecord;
use ota_updater::package::PackageBuilder;
use ota_updater::patch::make_patch;
use ota_updater::transfer::command::TRANSFER_LIST_VERSION;
use ota_updater::transfer::interpreter::NoProgress;
use ota_updater::transfer::{Command, Interpreter, StashStore, TransferList};
use ota_updater::verify::hash_buffer;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};

const BS: usize = BLOCK_SIZE as usize;

fn scratch(dir: &Path, name: &str, blocks: u64) -> PathBuf {
    let path = dir.join(name);
    File::create(&path)
        .unwrap()
        .set_len(blocks * BLOCK_SIZE)
        .unwrap();
    path
}

fn fill_block(path: &Path, block: u64, byte: u8) {
    let file = File::options().write(true).open(path).unwrap();
    file.write_all_at(&[byte; BS], block * BLOCK_SIZE).unwrap();
}

fn read_blk(path: &Path, block: u64) -> Vec<u8> {
    let file = File::open(path).unwrap();
    let mut buf = vec![0u8; BS];
    file.read_exact_at(&mut buf, block * BLOCK_SIZE).unwrap();
    buf
}

fn misc_image(dir: &Path) -> PathBuf {
    let path = dir.join("misc");
    File::create(&path)
        .unwrap()
        .set_len(PARTITION_RECORD_START + PARTITION_RECORD_AREA_LEN as u64)
        .unwrap();
    path
}

/// A transfer list for one partition: one new block, one patched block,
/// one moved block. Returns the list plus the blobs and expected contents.
struct PartitionPlan {
    list: TransferList,
    new_data: Vec<u8>,
    patch_blob: Vec<u8>,
    expected: Vec<(u64, Vec<u8>)>,
}

fn plan_for(seed: u8) -> PartitionPlan {
    let new_block = vec![seed; BS];
    let src_block = vec![seed.wrapping_add(1); BS];
    let mut patched = src_block.clone();
    patched[0..8].fill(seed.wrapping_add(2));
    let patch = make_patch(&src_block, &patched).unwrap();

    let commands = vec![
        Command::New {
            target: BlockSet::parse("2,0,1").unwrap(),
        },
        Command::Bsdiff {
            patch_start: 0,
            patch_len: patch.len() as u64,
            src_hash: hash_buffer(&src_block),
            dst_hash: hash_buffer(&patched),
            target: BlockSet::parse("2,1,2").unwrap(),
            source: BlockSet::parse("2,4,5").unwrap(),
        },
        Command::Move {
            hash: hash_buffer(&src_block),
            target: BlockSet::parse("2,2,3").unwrap(),
            source: BlockSet::parse("2,4,5").unwrap(),
        },
        Command::Zero {
            target: BlockSet::parse("2,3,4").unwrap(),
        },
    ];
    PartitionPlan {
        list: TransferList {
            version: TRANSFER_LIST_VERSION,
            total_blocks: 4,
            stash_max: 0,
            commands,
        },
        new_data: new_block.clone(),
        patch_blob: patch,
        expected: vec![
            (0, new_block),
            (1, patched),
            (2, src_block),
            (3, vec![0u8; BS]),
        ],
    }
}

fn run_partition(dir: &Path, device_path: &Path, plan: &PartitionPlan) {
    let device = BlockWriter::open_with_roots(device_path, &[dir]).unwrap();
    let stash = StashStore::open(dir.join("stash")).unwrap();
    let mut interp = Interpreter::new(&device, &device, &plan.patch_blob, &plan.new_data, stash);
    interp.execute(&plan.list, &mut NoProgress).unwrap();
}

#[test]
fn transfer_list_produces_annotated_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let device_path = scratch(dir.path(), "system", 8);
    let plan = plan_for(0x40);
    fill_block(&device_path, 4, 0x41);

    run_partition(dir.path(), &device_path, &plan);

    for (block, expected) in &plan.expected {
        assert_eq!(&read_blk(&device_path, *block), expected, "block {}", block);
    }
}

/// Spec scenario: mark "boot" done, update all three partitions, observe
/// that boot is skipped and everything ends up recorded as done.
#[test]
fn partition_record_skips_completed_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let misc = misc_image(dir.path());
    let record = PartitionRecord::new(&misc);

    let partitions = ["boot", "system", "vendor"];
    let mut devices = Vec::new();
    let mut plans = Vec::new();
    for (i, name) in partitions.iter().enumerate() {
        let plan = plan_for(0x10 * (i as u8 + 1));
        let path = scratch(dir.path(), name, 8);
        // block 4 holds what the plan's patch and move commands read
        fill_block(&path, 4, 0x10 * (i as u8 + 1) + 1);
        devices.push(path);
        plans.push(plan);
    }

    record.mark_done("boot", true).unwrap();

    // the updater pass over all three partitions
    let mut ran = Vec::new();
    for (i, name) in partitions.iter().enumerate() {
        if record.is_done(name) {
            continue;
        }
        run_partition(dir.path(), &devices[i], &plans[i]);
        record.mark_done(name, true).unwrap();
        ran.push(*name);
    }

    assert_eq!(ran, vec!["system", "vendor"]);
    // boot was never touched: its new-block slot is still zero
    assert_eq!(read_blk(&devices[0], 0), vec![0u8; BS]);
    for name in partitions {
        assert!(record.is_done(name), "{} should be recorded done", name);
    }
}

/// Drives the real updater program binary over a pipe, end to end: package
/// with a transfer list, mount table, misc image, scratch device.
#[test]
fn update_bin_runs_a_package() {
    let dir = tempfile::tempdir().unwrap();
    let device_path = scratch(dir.path(), "system", 8);
    fill_block(&device_path, 4, 0x41);
    let boot_path = scratch(dir.path(), "boot", 4);
    let boot_image = vec![0x77u8; 2 * BS];
    let misc = misc_image(dir.path());

    let plan = plan_for(0x40);
    let package = PackageBuilder::new("9.0", "bench")
        .partition_payload(
            "system",
            &plan.list.encode(),
            plan.new_data.clone(),
            plan.patch_blob.clone(),
        )
        .raw_image("boot.img", boot_image.clone())
        .build_unsigned()
        .unwrap();
    let pkg_path = dir.path().join("update.zip");
    std::fs::write(&pkg_path, package).unwrap();

    let table_path = dir.path().join("fstab");
    std::fs::write(
        &table_path,
        format!(
            "{} /system none defaults\n{} /boot none defaults\n{} /misc none defaults\n",
            device_path.display(),
            boot_path.display(),
            misc.display()
        ),
    )
    .unwrap();

    // hand the child the write end of a pipe, as the driver would
    let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();
    let write_fd = {
        use std::os::fd::AsRawFd;
        pipe_write.as_raw_fd()
    };
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_update_bin"))
        .arg(&pkg_path)
        .arg(write_fd.to_string())
        .arg("retry=0")
        .env("OTA_MOUNT_TABLE", &table_path)
        .env("OTA_DEVICE_ROOT", dir.path())
        .env("OTA_STASH_DIR", dir.path().join("stash"))
        .status()
        .unwrap();
    drop(pipe_write);

    let mut lines = String::new();
    File::from(pipe_read).read_to_string(&mut lines).unwrap();

    assert!(status.success(), "updater program failed: {}", lines);
    for (block, expected) in &plan.expected {
        assert_eq!(&read_blk(&device_path, *block), expected, "block {}", block);
    }
    // the full image was flashed wholesale onto the boot device
    assert_eq!(read_blk(&boot_path, 0), &boot_image[..BS]);
    assert_eq!(read_blk(&boot_path, 1), &boot_image[BS..]);
    let record = PartitionRecord::new(&misc);
    assert!(record.is_done("system"));
    assert!(record.is_done("boot"));
    assert!(lines.lines().any(|l| l.starts_with("set_progress:")));
    assert!(lines.lines().any(|l| l.starts_with("show_progress:")));
    assert!(lines.contains("image boot.img flashed"), "{}", lines);

    // a second run skips the partition entirely and still succeeds
    let (pipe_read2, pipe_write2) = nix::unistd::pipe().unwrap();
    let write_fd2 = {
        use std::os::fd::AsRawFd;
        pipe_write2.as_raw_fd()
    };
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_update_bin"))
        .arg(&pkg_path)
        .arg(write_fd2.to_string())
        .arg("retry=1")
        .env("OTA_MOUNT_TABLE", &table_path)
        .env("OTA_DEVICE_ROOT", dir.path())
        .env("OTA_STASH_DIR", dir.path().join("stash"))
        .status()
        .unwrap();
    drop(pipe_write2);
    let mut lines = String::new();
    File::from(pipe_read2).read_to_string(&mut lines).unwrap();
    assert!(status.success());
    assert!(
        lines.contains("already updated"),
        "second pass should skip: {}",
        lines
    );
}

/// Executable check for the fake-updater helper used in the driver tests:
/// the file-permission dance has to survive on the test host.
#[test]
fn scripts_are_spawnable_from_tempdirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("probe.sh");
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    assert!(std::process::Command::new(&path).status().unwrap().success());
}
