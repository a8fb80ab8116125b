// SPDX-License-Identifier: Apache-2.0

//! The updater program the driver spawns. Receives
//! `[package, pipe_fd, retry=0|1]` on argv, rewrites every partition the
//! package names through the transfer-list interpreter, reports progress
//! over the inherited pipe, and exits zero on success. I/O faults ask the
//! driver for a reboot-and-retry; verification faults fail hard.

use anyhow::{anyhow, Context, Result};
use ota_updater::constants::{
    DEFAULT_MOUNT_TABLE_PATH, DEFAULT_STASH_DIR, ENV_DEVICE_ROOT, ENV_MOUNT_TABLE, ENV_STASH_DIR,
    NEW_DATA_SUFFIX, PATCH_DATA_SUFFIX, TRANSFER_LIST_SUFFIX,
};
use ota_updater::device::{BlockWriter, DataWriter, WriteMode};
use ota_updater::driver::ProgressWriter;
use ota_updater::error::UpdateError;
use ota_updater::misc::PartitionRecord;
use ota_updater::mount::MountTable;
use ota_updater::package::manifest::ComponentType;
use ota_updater::package::{FilePkgIO, PkgReader};
use ota_updater::transfer::{Interpreter, ProgressSink, StashStore, TransferList};
use std::fs::File;
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

struct PipeSink<'a> {
    writer: &'a mut ProgressWriter<File>,
    done: u64,
    total: u64,
}

impl ProgressSink for PipeSink<'_> {
    fn advance(&mut self, blocks: u64) {
        self.done += blocks;
        if self.total > 0 {
            let _ = self
                .writer
                .set_progress(self.done as f32 / self.total as f32);
        }
    }
}

struct PartitionJob {
    name: String,
    transfer: TransferList,
    new_data: Vec<u8>,
    patch_blob: Vec<u8>,
}

struct ImageJob {
    name: String,
    entry: String,
    blocks: u64,
}

fn mount_table() -> Result<MountTable> {
    let path = std::env::var(ENV_MOUNT_TABLE)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_MOUNT_TABLE_PATH));
    if path.exists() {
        Ok(MountTable::load(&path)?)
    } else {
        warn!(path = %path.display(), "no mount table, relying on fallbacks");
        Ok(MountTable::new())
    }
}

fn device_roots() -> Vec<PathBuf> {
    match std::env::var(ENV_DEVICE_ROOT) {
        Ok(root) => vec![PathBuf::from(root)],
        Err(_) => vec![PathBuf::from("/dev")],
    }
}

fn stash_root() -> PathBuf {
    std::env::var(ENV_STASH_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STASH_DIR))
}

fn device_for<'a>(table: &'a MountTable, name: &str) -> Result<&'a Path> {
    let mount_point = format!("/{}", name);
    table
        .device_for(&mount_point)
        .ok_or_else(|| anyhow!("no device mapped for partition {}", name))
}

fn open_device(table: &MountTable, name: &str) -> Result<BlockWriter> {
    let device = device_for(table, name)?;
    let roots = device_roots();
    let roots: Vec<&Path> = roots.iter().map(|p| p.as_path()).collect();
    BlockWriter::open_with_roots(device, &roots)
        .with_context(|| format!("opening device for {}", name))
}

/// Whole-image flashing goes through the writer dispatch: partitions are
/// block targets here, raw mode stays for file output.
fn open_flash_writer(table: &MountTable, name: &str) -> Result<DataWriter> {
    let device = device_for(table, name)?;
    let roots = device_roots();
    let roots: Vec<&Path> = roots.iter().map(|p| p.as_path()).collect();
    DataWriter::create_with_roots(WriteMode::Block, device, 0, &roots)
        .with_context(|| format!("opening flash target for {}", name))
}

async fn collect_jobs(
    reader: &PkgReader<FilePkgIO>,
) -> Result<(Vec<PartitionJob>, Vec<ImageJob>)> {
    let mut partitions = Vec::new();
    let transfer_entries: Vec<String> = reader
        .manifest()
        .components_of(ComponentType::TransferList)
        .map(|e| e.identity.clone())
        .collect();

    for identity in transfer_entries {
        let name = identity
            .strip_suffix(TRANSFER_LIST_SUFFIX)
            .unwrap_or(&identity)
            .to_string();
        let text = String::from_utf8(reader.read_entry(&identity).await?)
            .map_err(|_| anyhow!("transfer list {} is not utf-8", identity))?;
        let transfer = TransferList::parse(&text)?;

        let new_name = format!("{}{}", name, NEW_DATA_SUFFIX);
        let new_data = match reader.entry(&new_name) {
            Some(_) => reader.read_entry(&new_name).await?,
            None => Vec::new(),
        };
        let patch_name = format!("{}{}", name, PATCH_DATA_SUFFIX);
        let patch_blob = match reader.entry(&patch_name) {
            Some(_) => reader.read_entry(&patch_name).await?,
            None => Vec::new(),
        };
        partitions.push(PartitionJob {
            name,
            transfer,
            new_data,
            patch_blob,
        });
    }

    // full images are flashed wholesale when no transfer list covers them
    let mut images = Vec::new();
    for entry in reader.manifest().components_of(ComponentType::RawImage) {
        let name = entry
            .identity
            .strip_suffix(".img")
            .unwrap_or(&entry.identity)
            .to_string();
        if partitions.iter().any(|p| p.name == name) {
            continue;
        }
        images.push(ImageJob {
            name,
            entry: entry.identity.clone(),
            blocks: entry.unpacked_size.div_ceil(ota_updater::constants::BLOCK_SIZE),
        });
    }

    Ok((partitions, images))
}

async fn run(pkg_path: &Path, progress: &mut ProgressWriter<File>, retry: bool) -> Result<i32> {
    info!(package = %pkg_path.display(), retry, "updater program starting");
    let table = mount_table()?;
    let record = PartitionRecord::new(table.misc_device());
    let reader = PkgReader::load(FilePkgIO::open(pkg_path).await?).await?;

    let (partitions, images) = collect_jobs(&reader).await?;
    let total_blocks: u64 = partitions
        .iter()
        .map(|p| p.transfer.commands.iter().map(|c| c.written_blocks()).sum::<u64>())
        .sum::<u64>()
        + images.iter().map(|i| i.blocks).sum::<u64>();

    for job in &partitions {
        let weight = if total_blocks > 0 {
            job.transfer
                .commands
                .iter()
                .map(|c| c.written_blocks())
                .sum::<u64>() as f32
                / total_blocks as f32
        } else {
            0.0
        };
        progress.show_progress(weight)?;

        if record.is_done(&job.name) {
            progress
                .write_log(&format!("partition {} already updated, skipping", job.name))?;
            progress.set_progress(1.0)?;
            continue;
        }

        let device = open_device(&table, &job.name)?;
        let stash = StashStore::open(stash_root().join(&job.name))?;
        let partition_blocks: u64 = job
            .transfer
            .commands
            .iter()
            .map(|c| c.written_blocks())
            .sum();
        let mut sink = PipeSink {
            writer: &mut *progress,
            done: 0,
            total: partition_blocks,
        };

        let mut interpreter =
            Interpreter::new(&device, &device, &job.patch_blob, &job.new_data, stash);
        interpreter.execute(&job.transfer, &mut sink)?;

        record.mark_done(&job.name, true)?;
        progress.write_log(&format!("partition {} updated", job.name))?;
    }

    for job in &images {
        let weight = if total_blocks > 0 {
            job.blocks as f32 / total_blocks as f32
        } else {
            0.0
        };
        progress.show_progress(weight)?;
        if record.is_done(&job.name) {
            progress
                .write_log(&format!("partition {} already updated, skipping", job.name))?;
            continue;
        }

        let mut writer = open_flash_writer(&table, &job.name)?;
        let data = reader.read_entry(&job.entry).await?;
        writer.write_at(0, &data)?;
        writer.sync()?;
        record.mark_done(&job.name, true)?;
        progress.set_progress(1.0)?;
        progress.write_log(&format!("image {} flashed", job.entry))?;
    }

    progress.set_progress(1.0)?;
    Ok(0)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("usage: update_bin <package> <pipe_fd> retry=0|1");
        std::process::exit(1);
    }
    let pkg_path = PathBuf::from(&args[1]);
    let fd: i32 = match args[2].parse() {
        Ok(fd) => fd,
        Err(_) => {
            eprintln!("bad pipe fd {:?}", args[2]);
            std::process::exit(1);
        }
    };
    let retry = args[3] == "retry=1";

    // the driver handed us this fd over exec
    let pipe = unsafe { File::from_raw_fd(fd) };
    let mut progress = ProgressWriter::new(pipe);

    match run(&pkg_path, &mut progress, retry).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let retryable = e
                .downcast_ref::<UpdateError>()
                .map(|u| u.is_retryable())
                .unwrap_or(false);
            let _ = progress.write_log(&format!("update failed: {:#}", e));
            if retryable {
                // ask the driver for a reboot-and-retry and exit clean so
                // the failure is not double-counted
                let _ = progress.retry_update();
                std::process::exit(0);
            }
            std::process::exit(2);
        }
    }
}
