// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "A crash-resilient OTA block updater")]
pub struct Args {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand)]
pub enum CliCommand {
    /// Run the update pipeline over one or more signed packages
    Update {
        /// Packages to install; when empty, taken from the boot message
        packages: Vec<PathBuf>,

        /// PEM public key the package signature must open under
        #[arg(long)]
        cert: PathBuf,

        /// fstab-style mount table (device, mount point, fs type)
        #[arg(long)]
        mount_table: Option<PathBuf>,

        /// Scratch directory for the extracted updater program
        #[arg(long, default_value = "/tmp/ota_updater")]
        work_dir: PathBuf,

        /// Updater program used when the package embeds none
        #[arg(long)]
        fallback_updater: Option<PathBuf>,

        /// Require the signer-bound version to equal this
        #[arg(long)]
        expected_version: Option<String>,

        /// Treat the packages as an sdcard update (hash failures surface
        /// immediately instead of burning a retry)
        #[arg(long)]
        sdcard: bool,
    },

    /// Generate a block patch transforming OLD into NEW
    Diff {
        old: PathBuf,
        new: PathBuf,
        patch: PathBuf,
    },

    /// Apply a block patch to OLD, writing the result to OUT
    Patch {
        old: PathBuf,
        patch: PathBuf,
        out: PathBuf,
    },

    /// Verify a package signature, entry CRCs and the hash tree
    Verify {
        package: PathBuf,

        #[arg(long)]
        cert: PathBuf,

        #[arg(long)]
        expected_version: Option<String>,
    },

    /// List package entries
    List {
        package: PathBuf,

        /// Emit the manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inventory the block devices on this system
    Devices {
        #[arg(long, default_value = "/sys/block")]
        sys_block: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Inspect or modify the partition record in the misc region
    Record {
        /// Misc device path; defaults to the mount-table resolution
        #[arg(long)]
        misc: Option<PathBuf>,

        #[arg(long)]
        mount_table: Option<PathBuf>,

        /// Report whether this partition is recorded as updated
        #[arg(long)]
        check: Option<String>,

        /// Record this partition as updated
        #[arg(long)]
        mark: Option<String>,

        /// Reset the whole record area
        #[arg(long)]
        clear: bool,
    },

    /// Read or write the boot message
    Bootmsg {
        #[arg(long)]
        misc: Option<PathBuf>,

        #[arg(long)]
        mount_table: Option<PathBuf>,

        /// Set the command field (empty string clears it)
        #[arg(long)]
        write_command: Option<String>,

        /// Set the update argument block (newline-separated tokens)
        #[arg(long)]
        update_args: Option<String>,
    },

    /// Assemble and sign an update package
    Pack {
        out: PathBuf,

        #[arg(long)]
        version: String,

        #[arg(long)]
        product: String,

        /// PEM pkcs8 private key used to sign the package
        #[arg(long)]
        signing_key: PathBuf,

        /// PEM public key embedded as the certificate chain
        #[arg(long)]
        cert: PathBuf,

        /// Full images as name=path pairs, repeatable
        #[arg(long = "image", value_name = "NAME=PATH")]
        images: Vec<String>,

        /// Updater program to embed
        #[arg(long)]
        updater: Option<PathBuf>,
    },
}
