// SPDX-License-Identifier: Apache-2.0

use crate::cli::args::{Args, CliCommand};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ota_updater::constants::{EXIT_ERROR, EXIT_OK, FALLBACK_UPDATER_BINARY};
use ota_updater::device::{BlockDevice, DataWriter, WriteMode};
use ota_updater::driver::{run_update, UpdaterConfig};
use ota_updater::misc::{BootMessage, PartitionRecord, UpdateOptions};
use ota_updater::mount::MountTable;
use ota_updater::package::{FilePkgIO, PackageBuilder, PkgReader};
use ota_updater::patch::{apply_patch, make_patch};
use ota_updater::utils::format_size;
use std::path::{Path, PathBuf};

pub async fn run() -> Result<i32> {
    let args = Args::parse();
    match args.command {
        CliCommand::Update {
            packages,
            cert,
            mount_table,
            work_dir,
            fallback_updater,
            expected_version,
            sdcard,
        } => {
            cmd_update(
                packages,
                &cert,
                mount_table.as_deref(),
                &work_dir,
                fallback_updater,
                expected_version,
                sdcard,
            )
            .await
        }
        CliCommand::Diff { old, new, patch } => cmd_diff(&old, &new, &patch),
        CliCommand::Patch { old, patch, out } => cmd_patch(&old, &patch, &out),
        CliCommand::Verify {
            package,
            cert,
            expected_version,
        } => cmd_verify(&package, &cert, expected_version).await,
        CliCommand::List { package, json } => cmd_list(&package, json).await,
        CliCommand::Devices { sys_block, json } => cmd_devices(&sys_block, json),
        CliCommand::Record {
            misc,
            mount_table,
            check,
            mark,
            clear,
        } => cmd_record(misc, mount_table.as_deref(), check, mark, clear),
        CliCommand::Bootmsg {
            misc,
            mount_table,
            write_command,
            update_args,
        } => cmd_bootmsg(misc, mount_table.as_deref(), write_command, update_args),
        CliCommand::Pack {
            out,
            version,
            product,
            signing_key,
            cert,
            images,
            updater,
        } => cmd_pack(&out, &version, &product, &signing_key, &cert, &images, updater),
    }
}

fn load_mount_table(path: Option<&Path>) -> Result<MountTable> {
    match path {
        Some(path) => MountTable::load(path)
            .with_context(|| format!("loading mount table {}", path.display())),
        None => Ok(MountTable::new()),
    }
}

fn misc_path(misc: Option<PathBuf>, table: &MountTable) -> PathBuf {
    misc.unwrap_or_else(|| table.misc_device())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_update(
    packages: Vec<PathBuf>,
    cert: &Path,
    mount_table: Option<&Path>,
    work_dir: &Path,
    fallback_updater: Option<PathBuf>,
    expected_version: Option<String>,
    sdcard: bool,
) -> Result<i32> {
    let table = load_mount_table(mount_table)?;
    let cert_pem = std::fs::read_to_string(cert)
        .with_context(|| format!("reading certificate {}", cert.display()))?;
    tokio::fs::create_dir_all(work_dir).await.ok();

    // explicit packages win; otherwise the boot message names them
    let options = if packages.is_empty() {
        let msg = BootMessage::read_misc(&table).context("reading boot message")?;
        msg.options()
    } else {
        UpdateOptions {
            update_packages: packages
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            sdcard_update: sdcard,
            ..Default::default()
        }
    };

    let config = UpdaterConfig {
        mount_table: table,
        cert_pem,
        work_dir: work_dir.to_path_buf(),
        fallback_updater: fallback_updater
            .unwrap_or_else(|| PathBuf::from(FALLBACK_UPDATER_BINARY)),
        expected_version,
    };

    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.green} {percent:>3}% {msg}")
            .unwrap(),
    );
    let outcome = run_update(&config, &options, |p| {
        bar.set_position((p * 1000.0) as u64);
    })
    .await?;
    bar.finish_with_message(format!("{:?}", outcome));

    Ok(outcome.exit_code())
}

fn cmd_diff(old: &Path, new: &Path, patch_path: &Path) -> Result<i32> {
    let old_data = std::fs::read(old)?;
    let new_data = std::fs::read(new)?;
    let patch = make_patch(&old_data, &new_data)?;
    std::fs::write(patch_path, &patch)?;
    println!(
        "{} -> {}: patch {} ({} of new size)",
        format_size(old_data.len() as u64),
        format_size(new_data.len() as u64),
        format_size(patch.len() as u64),
        if new_data.is_empty() {
            "n/a".to_string()
        } else {
            format!("{:.1}%", 100.0 * patch.len() as f64 / new_data.len() as f64)
        }
    );
    Ok(EXIT_OK)
}

fn cmd_patch(old: &Path, patch_path: &Path, out: &Path) -> Result<i32> {
    let old_data = std::fs::read(old)?;
    let patch = std::fs::read(patch_path)?;
    let new_data = apply_patch(&old_data, &patch)?;
    let mut writer = DataWriter::create(WriteMode::Raw, out, 0)?;
    writer.write_at(0, &new_data)?;
    writer.sync()?;
    println!("wrote {} ({})", out.display(), format_size(new_data.len() as u64));
    Ok(EXIT_OK)
}

async fn cmd_verify(package: &Path, cert: &Path, expected_version: Option<String>) -> Result<i32> {
    use ota_updater::package::signature::{package_digest, SignatureTrailer, SignatureVerifier};

    let cert_pem = std::fs::read_to_string(cert)?;
    let data = std::fs::read(package)?;
    let reader = PkgReader::load(FilePkgIO::open(package).await?).await?;
    let digest_alg = reader.manifest().digest_alg;

    let trailer = SignatureTrailer::parse(&data)?;
    let digest = package_digest(&data, trailer.offset, digest_alg);
    SignatureVerifier {
        cert_pem: &cert_pem,
        expected_version: expected_version.as_deref(),
    }
    .verify(&trailer, digest_alg, &digest)?;
    println!("signature: ok");

    // every entry decompresses and matches its crc and hash-tree digest
    let names: Vec<String> = reader
        .manifest()
        .entries
        .iter()
        .map(|e| e.identity.clone())
        .collect();
    for name in names {
        reader
            .read_entry(&name)
            .await
            .with_context(|| format!("entry {}", name))?;
        println!("entry {}: ok", name);
    }
    Ok(EXIT_OK)
}

async fn cmd_list(package: &Path, json: bool) -> Result<i32> {
    let reader = PkgReader::load(FilePkgIO::open(package).await?).await?;
    let manifest = reader.manifest();
    if json {
        println!("{}", serde_json::to_string_pretty(manifest)?);
        return Ok(EXIT_OK);
    }
    println!(
        "{} for {} ({} entries)",
        manifest.software_version,
        manifest.product_id,
        manifest.entries.len()
    );
    for entry in &manifest.entries {
        println!(
            "  {:<32} {:>12} -> {:>12}  {:?}",
            entry.identity,
            format_size(entry.packed_size),
            format_size(entry.unpacked_size),
            entry.component_type,
        );
    }
    Ok(EXIT_OK)
}

fn cmd_devices(sys_block: &Path, json: bool) -> Result<i32> {
    let devices = BlockDevice::scan(sys_block)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(EXIT_OK);
    }
    for dev in devices {
        println!(
            "{:<24} {:>12}  sectors {}/{}{}",
            dev.path.display(),
            format_size(dev.size_bytes),
            dev.logical_sector_size,
            dev.physical_sector_size,
            if dev.read_only { "  ro" } else { "" }
        );
    }
    Ok(EXIT_OK)
}

fn cmd_record(
    misc: Option<PathBuf>,
    mount_table: Option<&Path>,
    check: Option<String>,
    mark: Option<String>,
    clear: bool,
) -> Result<i32> {
    let table = load_mount_table(mount_table)?;
    let record = PartitionRecord::new(misc_path(misc, &table));
    if clear {
        record.clear()?;
        println!("record cleared");
    }
    if let Some(name) = mark {
        record.mark_done(&name, true)?;
        println!("{}: marked updated", name);
    }
    if let Some(name) = check {
        let done = record.is_done(&name);
        println!("{}: {}", name, if done { "updated" } else { "pending" });
        return Ok(if done { EXIT_OK } else { EXIT_ERROR });
    }
    Ok(EXIT_OK)
}

fn cmd_bootmsg(
    misc: Option<PathBuf>,
    mount_table: Option<&Path>,
    write_command: Option<String>,
    update_args: Option<String>,
) -> Result<i32> {
    let table = load_mount_table(mount_table)?;
    let path = misc_path(misc, &table);
    let mut msg = BootMessage::read(&path)?;

    if write_command.is_none() && update_args.is_none() {
        println!("command: {:?}", msg.command_str());
        println!("status:  {:?}", msg.status_str());
        for token in msg.update_str().lines() {
            println!("update:  {}", token);
        }
        return Ok(EXIT_OK);
    }
    if let Some(command) = write_command {
        msg.set_command(&command);
    }
    if let Some(update) = update_args {
        msg.set_update(&update);
    }
    msg.write(&path)?;
    println!("boot message written");
    Ok(EXIT_OK)
}

fn cmd_pack(
    out: &Path,
    version: &str,
    product: &str,
    signing_key: &Path,
    cert: &Path,
    images: &[String],
    updater: Option<PathBuf>,
) -> Result<i32> {
    let mut builder = PackageBuilder::new(version, product);
    for spec in images {
        let (name, path) = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("--image wants NAME=PATH, got {:?}", spec))?;
        let data = std::fs::read(path).with_context(|| format!("reading image {}", path))?;
        builder = builder.raw_image(name, data);
    }
    if let Some(updater) = updater {
        builder = builder.updater_program(std::fs::read(&updater)?);
    }

    let key_pem = std::fs::read_to_string(signing_key)?;
    let cert_pem = std::fs::read_to_string(cert)?;
    let package = builder.build_signed(&key_pem, &cert_pem)?;
    std::fs::write(out, &package)?;
    println!("wrote {} ({})", out.display(), format_size(package.len() as u64));
    Ok(EXIT_OK)
}
