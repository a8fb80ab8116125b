// SPDX-License-Identifier: Apache-2.0

//! The update pipeline: verify the package signature, extract the embedded
//! updater program, spawn it with a progress pipe, forward its records, and
//! finalize through the boot message so a crash at any point resumes from
//! persisted state.

use crate::constants::{
    EXIT_ERROR, EXIT_OK, EXIT_RETRY, EXIT_SKIPPED, EXIT_SPACE_INSUFFICIENT, EXIT_VERIFY_FAILED,
    MAX_RETRY_COUNT, UPDATER_BINARY_ENTRY,
};
use crate::error::{Result, UpdateError};
use crate::misc::boot_message::BootMessage;
use crate::misc::UpdateOptions;
use crate::mount::MountTable;
use crate::package::manifest::DigestAlg;
use crate::package::signature::{SignatureTrailer, SignatureVerifier};
use crate::package::{FilePkgIO, PkgReader};
use crate::driver::progress::{ProgressMsg, ProgressPlan};
use sha2::{Digest, Sha256, Sha384};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub struct UpdaterConfig {
    pub mount_table: MountTable,
    /// PEM public key provisioned on the device.
    pub cert_pem: String,
    /// Scratch directory for the extracted updater program.
    pub work_dir: PathBuf,
    /// Program used when a package carries no updater entry.
    pub fallback_updater: PathBuf,
    /// When set, the signer-bound version must match.
    pub expected_version: Option<String>,
}

/// What the driver decided; the single translation point from component
/// errors to user-visible results and boot-message state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success,
    Retry { next_count: u32 },
    VerifyFailed,
    SpaceInsufficient,
    Skipped,
    Fatal,
}

impl UpdateOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            UpdateOutcome::Success => EXIT_OK,
            UpdateOutcome::Retry { .. } => EXIT_RETRY,
            UpdateOutcome::VerifyFailed => EXIT_VERIFY_FAILED,
            UpdateOutcome::SpaceInsufficient => EXIT_SPACE_INSUFFICIENT,
            UpdateOutcome::Skipped => EXIT_SKIPPED,
            UpdateOutcome::Fatal => EXIT_ERROR,
        }
    }
}

/// Runs the full pipeline over the packages named in `options`, starting at
/// `upgraded_pkg_num`. `on_progress` receives the overall 0..1 curve.
pub async fn run_update(
    config: &UpdaterConfig,
    options: &UpdateOptions,
    mut on_progress: impl FnMut(f32),
) -> Result<UpdateOutcome> {
    if options.retry_count >= MAX_RETRY_COUNT {
        error!(
            retry_count = options.retry_count,
            "retry budget exhausted, refusing to run"
        );
        clear_boot_message(config)?;
        return Ok(UpdateOutcome::Fatal);
    }
    if options.update_packages.is_empty() {
        warn!("no update packages in boot message");
        return Ok(UpdateOutcome::Skipped);
    }
    if options.sdcard_update {
        info!("sdcard update mode");
    }

    let packed_sizes: Vec<u64> = options
        .update_packages
        .iter()
        .map(|p| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0))
        .collect();
    let mut plan = ProgressPlan::new(&packed_sizes);
    on_progress(0.0);

    // every package is signature-checked before anything is written
    for path in &options.update_packages {
        if let Err(e) = verify_package(config, Path::new(path)).await {
            error!(package = %path, error = %e, "package verification failed");
            clear_boot_message(config)?;
            return Ok(UpdateOutcome::VerifyFailed);
        }
    }
    plan.verify_complete();
    on_progress(plan.overall(0, 0.0));

    for (index, path) in options
        .update_packages
        .iter()
        .enumerate()
        .skip(options.upgraded_pkg_num)
    {
        let started = Instant::now();
        info!(package = %path, index, "installing");

        let outcome = install_package(config, options, index, Path::new(path), |inner| {
            on_progress(plan.overall(index, inner));
        })
        .await?;
        match outcome {
            PackageOutcome::Done => {
                info!(
                    package = %path,
                    elapsed = %crate::utils::format_elapsed_time(started.elapsed()),
                    "package installed"
                );
                advance_package_counter(config, options, index + 1)?;
            }
            PackageOutcome::RetryRequested => {
                let next_count = options.retry_count + 1;
                write_retry_message(config, options, index, next_count)?;
                return Ok(UpdateOutcome::Retry { next_count });
            }
            PackageOutcome::SpaceInsufficient => {
                clear_boot_message(config)?;
                return Ok(UpdateOutcome::SpaceInsufficient);
            }
            PackageOutcome::Failed => {
                clear_boot_message(config)?;
                return Ok(UpdateOutcome::Fatal);
            }
        }
    }

    run_wipes(config, options);
    clear_boot_message(config)?;
    on_progress(1.0);
    Ok(UpdateOutcome::Success)
}

enum PackageOutcome {
    Done,
    RetryRequested,
    SpaceInsufficient,
    Failed,
}

async fn verify_package(config: &UpdaterConfig, path: &Path) -> Result<()> {
    let reader = PkgReader::load(FilePkgIO::open(path).await?).await?;
    let digest_alg = reader.manifest().digest_alg;

    let (trailer, digest) = {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(SignatureTrailer, Vec<u8>)> {
            let (trailer, offset) = parse_file_trailer(&path)?;
            let digest = digest_file_until(&path, offset, digest_alg)?;
            Ok((trailer, digest))
        })
        .await
        .map_err(|e| UpdateError::Io(std::io::Error::other(e)))??
    };

    SignatureVerifier {
        cert_pem: &config.cert_pem,
        expected_version: config.expected_version.as_deref(),
    }
    .verify(&trailer, digest_alg, &digest)
}

/// Reads the file tail, locates the trailer magic and returns the trailer
/// with its absolute offset.
fn parse_file_trailer(path: &Path) -> Result<(SignatureTrailer, u64)> {
    const TAIL_WINDOW: u64 = 64 * 1024;
    let len = std::fs::metadata(path)?.len();
    let window = TAIL_WINDOW.min(len);
    let mut tail = vec![0u8; window as usize];
    {
        use std::os::unix::fs::FileExt;
        std::fs::File::open(path)?.read_exact_at(&mut tail, len - window)?;
    }
    let trailer = SignatureTrailer::parse(&tail)?;
    let absolute = len - window + trailer.offset;
    Ok((trailer, absolute))
}

fn digest_file_until(path: &Path, end: u64, alg: DigestAlg) -> Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut remaining = end;
    let mut buf = vec![0u8; 1 << 20];
    match alg {
        DigestAlg::Sha256 => {
            let mut hasher = Sha256::new();
            while remaining > 0 {
                let take = buf.len().min(remaining as usize);
                let n = file.read(&mut buf[..take])?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                remaining -= n as u64;
            }
            Ok(hasher.finalize().to_vec())
        }
        DigestAlg::Sha384 => {
            let mut hasher = Sha384::new();
            while remaining > 0 {
                let take = buf.len().min(remaining as usize);
                let n = file.read(&mut buf[..take])?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                remaining -= n as u64;
            }
            Ok(hasher.finalize().to_vec())
        }
    }
}

async fn install_package(
    config: &UpdaterConfig,
    options: &UpdateOptions,
    index: usize,
    path: &Path,
    mut on_inner_progress: impl FnMut(f32),
) -> Result<PackageOutcome> {
    let reader = PkgReader::load(FilePkgIO::open(path).await?).await?;

    let program = match reader.manifest().find(UPDATER_BINARY_ENTRY) {
        Some(entry) => {
            if let Err(e) = check_space(&config.work_dir, entry.unpacked_size) {
                warn!(error = %e, "not enough space for the updater program");
                return Ok(PackageOutcome::SpaceInsufficient);
            }
            let target = config.work_dir.join(format!("updater_binary.{}", index));
            let data = reader.read_entry(UPDATER_BINARY_ENTRY).await?;
            tokio::fs::write(&target, &data).await?;
            let mut perms = tokio::fs::metadata(&target).await?.permissions();
            perms.set_mode(0o755);
            tokio::fs::set_permissions(&target, perms).await?;
            target
        }
        None => {
            info!(
                fallback = %config.fallback_updater.display(),
                "package has no updater program, using fallback"
            );
            config.fallback_updater.clone()
        }
    };

    spawn_and_pump(&program, path, options, &mut on_inner_progress).await
}

/// Spawns the updater program with the write end of a pipe inherited, and
/// pumps its progress lines until exit. Cancellation kills the child and
/// leaves all persisted state untouched.
async fn spawn_and_pump(
    program: &Path,
    package: &Path,
    options: &UpdateOptions,
    on_inner_progress: &mut impl FnMut(f32),
) -> Result<PackageOutcome> {
    let (pipe_read, pipe_write) = nix::unistd::pipe()
        .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?;
    let write_fd = {
        use std::os::fd::AsRawFd;
        pipe_write.as_raw_fd()
    };

    let mut child = tokio::process::Command::new(program)
        .arg(package)
        .arg(write_fd.to_string())
        .arg(format!("retry={}", if options.retry_count > 0 { 1 } else { 0 }))
        .spawn()?;
    // the child owns its inherited copy now
    drop(pipe_write);

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let pump = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::from(pipe_read);
        for line in BufReader::new(file).lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut retry_requested = false;
    // without any show_progress the child's set_progress spans the package
    let mut inner_now = 0.0f32;
    let mut phase_base = 0.0f32;
    let mut phase_weight = 1.0f32;

    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else { break };
                match ProgressMsg::parse(&line) {
                    Ok(ProgressMsg::SetProgress(value)) => {
                        inner_now = phase_base + phase_weight * value;
                        on_inner_progress(inner_now);
                    }
                    Ok(ProgressMsg::ShowProgress(frac)) => {
                        // the next sub-phase starts wherever progress is now
                        phase_base = inner_now;
                        phase_weight = frac.min(1.0 - phase_base);
                    }
                    Ok(ProgressMsg::WriteLog(msg)) => info!(target: "updater_bin", "{}", msg),
                    Ok(ProgressMsg::UiLog(msg)) => info!(target: "ui", "{}", msg),
                    Ok(ProgressMsg::RetryUpdate) => retry_requested = true,
                    Err(e) => warn!(error = %e, line = %line, "ignoring malformed progress line"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("cancel requested, stopping the updater program");
                if let Some(pid) = child.id() {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
                let _ = child.wait().await;
                let _ = pump.await;
                return Err(UpdateError::Cancelled);
            }
        }
    }

    let status = child.wait().await?;
    let _ = pump.await;

    if retry_requested {
        info!("updater program requested a retry");
        return Ok(PackageOutcome::RetryRequested);
    }
    if !status.success() {
        error!(?status, "updater program failed");
        return Ok(PackageOutcome::Failed);
    }
    on_inner_progress(1.0);
    Ok(PackageOutcome::Done)
}

fn check_space(dir: &Path, needed: u64) -> Result<()> {
    let stat = nix::sys::statvfs::statvfs(dir)
        .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    if available < needed {
        return Err(UpdateError::SpaceInsufficient { needed, available });
    }
    Ok(())
}

/// Persists the boot message so a crash resumes at the next package.
fn advance_package_counter(
    config: &UpdaterConfig,
    options: &UpdateOptions,
    next_index: usize,
) -> Result<()> {
    let mut resumed = options.clone();
    resumed.upgraded_pkg_num = next_index;
    let mut msg = BootMessage::read(&config.mount_table.misc_device()).unwrap_or_default();
    msg.set_command(crate::constants::BOOT_CMD_UPDATER);
    msg.set_update(&resumed.to_update_block());
    msg.write_misc(&config.mount_table)
}

fn write_retry_message(
    config: &UpdaterConfig,
    options: &UpdateOptions,
    index: usize,
    next_count: u32,
) -> Result<()> {
    let mut retried = options.clone();
    retried.retry_count = next_count;
    retried.upgraded_pkg_num = index;
    let mut msg = BootMessage::read(&config.mount_table.misc_device()).unwrap_or_default();
    msg.set_command(crate::constants::BOOT_CMD_UPDATER);
    msg.set_update(&retried.to_update_block());
    msg.write_misc(&config.mount_table)
}

fn clear_boot_message(config: &UpdaterConfig) -> Result<()> {
    let mut msg = BootMessage::read(&config.mount_table.misc_device()).unwrap_or_default();
    msg.set_command("");
    msg.set_status("");
    msg.set_update("");
    msg.write_misc(&config.mount_table)
}

fn run_wipes(config: &UpdaterConfig, options: &UpdateOptions) {
    if options.factory_wipe_data {
        for mount_point in ["/data", "/cache"] {
            if let Err(e) = config.mount_table.format(mount_point) {
                warn!(mount_point, error = %e, "factory wipe failed");
            }
        }
    } else if options.user_wipe_data {
        if let Err(e) = config.mount_table.format("/data") {
            warn!(mount_point = "/data", error = %e, "user wipe failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{BOOT_CMD_UPDATER, PARTITION_RECORD_AREA_LEN, PARTITION_RECORD_START};
    use crate::package::PackageBuilder;
    use std::io::Write;

    fn misc_image(dir: &Path) -> PathBuf {
        let path = dir.join("misc");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(PARTITION_RECORD_START + PARTITION_RECORD_AREA_LEN as u64)
            .unwrap();
        path
    }

    /// A stand-in updater program: a shell script that copies a sibling
    /// lines file onto the inherited pipe fd, then exits.
    fn fake_updater(dir: &Path, name: &str, lines: &str, exit_code: i32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(dir.join(format!("{}.lines", name)), lines).unwrap();
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        // /proc-based write: plain >&N redirection caps the fd at one digit
        writeln!(file, "cat \"$0.lines\" > \"/proc/self/fd/$2\"").unwrap();
        writeln!(file, "exit {}", exit_code).unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn signed_package(dir: &Path, key: &rsa::RsaPrivateKey, cert_pem: &str) -> PathBuf {
        use rsa::pkcs8::EncodePrivateKey;
        let key_pem = key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        let package = PackageBuilder::new("1.0", "p")
            .build_signed(&key_pem, cert_pem)
            .unwrap();
        let path = dir.join("update.zip");
        std::fs::write(&path, package).unwrap();
        path
    }

    fn test_config(dir: &Path, cert_pem: String) -> UpdaterConfig {
        let mut mount_table = MountTable::new();
        mount_table.insert("/misc", misc_image(dir), "none");
        UpdaterConfig {
            mount_table,
            cert_pem,
            work_dir: dir.to_path_buf(),
            fallback_updater: dir.join("missing"),
            expected_version: None,
        }
    }

    fn keypair() -> (rsa::RsaPrivateKey, String) {
        use rsa::pkcs8::EncodePublicKey;
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        (key, pem)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_budget_cap_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (_key, cert) = keypair();
        let config = test_config(dir.path(), cert);
        let options = UpdateOptions {
            update_packages: vec!["/nonexistent.zip".into()],
            retry_count: MAX_RETRY_COUNT,
            ..Default::default()
        };
        let outcome = run_update(&config, &options, |_| {}).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Fatal);
        // misc cleared: next boot is normal
        let msg = BootMessage::read(&config.mount_table.misc_device()).unwrap();
        assert_eq!(msg.command_str(), "");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_signature_is_verify_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (_device_key, device_cert) = keypair();
        let (signer_key, signer_cert) = keypair();
        // the device trusts a different key than the one that signed
        let config = test_config(dir.path(), device_cert);
        let path = signed_package(dir.path(), &signer_key, &signer_cert);

        let options = UpdateOptions {
            update_packages: vec![path.to_string_lossy().into_owned()],
            ..Default::default()
        };
        let outcome = run_update(&config, &options, |_| {}).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::VerifyFailed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_signal_increments_boot_message() {
        let dir = tempfile::tempdir().unwrap();
        let (key, cert) = keypair();
        let mut config = test_config(dir.path(), cert.clone());
        let pkg = signed_package(dir.path(), &key, &cert);
        config.fallback_updater = fake_updater(
            dir.path(),
            "updater.sh",
            "set_progress:0.5\nretry_update:\n",
            0,
        );

        // retry_count starts at 2; the child signals retry
        let options = UpdateOptions {
            update_packages: vec![pkg.to_string_lossy().into_owned()],
            retry_count: 2,
            ..Default::default()
        };
        let outcome = run_update(&config, &options, |_| {}).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Retry { next_count: 3 });

        let msg = BootMessage::read(&config.mount_table.misc_device()).unwrap();
        assert_eq!(msg.command_str(), BOOT_CMD_UPDATER);
        assert_eq!(msg.options().retry_count, 3);

        // next boot: the cap is reached and the driver surfaces fatal
        let outcome = run_update(&config, &msg.options(), |_| {}).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Fatal);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_child_clears_boot_message() {
        let dir = tempfile::tempdir().unwrap();
        let (key, cert) = keypair();
        let mut config = test_config(dir.path(), cert.clone());
        let pkg = signed_package(dir.path(), &key, &cert);
        config.fallback_updater = fake_updater(
            dir.path(),
            "updater-ok.sh",
            "set_progress:1.0\nwrite_log:done\n",
            0,
        );

        let options = UpdateOptions {
            update_packages: vec![pkg.to_string_lossy().into_owned()],
            ..Default::default()
        };
        let mut last = 0.0f32;
        let outcome = run_update(&config, &options, |p| last = p).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Success);
        assert!((last - 1.0).abs() < 1e-6);

        let msg = BootMessage::read(&config.mount_table.misc_device()).unwrap();
        assert_eq!(msg.command_str(), "");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_child_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (key, cert) = keypair();
        let mut config = test_config(dir.path(), cert.clone());
        let pkg = signed_package(dir.path(), &key, &cert);
        config.fallback_updater = fake_updater(dir.path(), "updater-bad.sh", "", 7);

        let options = UpdateOptions {
            update_packages: vec![pkg.to_string_lossy().into_owned()],
            ..Default::default()
        };
        let outcome = run_update(&config, &options, |_| {}).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Fatal);
    }
}
