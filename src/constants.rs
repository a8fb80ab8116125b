// SPDX-License-Identifier: Apache-2.0

// Package / patch magics
pub const PKG_MAGIC: [u8; 2] = [0x50, 0x4B];

pub const LOCAL_FILE_HEADER_SIGNATURE: [u8; 4] = [PKG_MAGIC[0], PKG_MAGIC[1], 0x03, 0x04];
pub const CENTRAL_DIR_HEADER_SIGNATURE: [u8; 4] = [PKG_MAGIC[0], PKG_MAGIC[1], 0x01, 0x02];
pub const EOCD_SIGNATURE: [u8; 4] = [PKG_MAGIC[0], PKG_MAGIC[1], 0x05, 0x06];
pub const ZIP64_EOCD_SIGNATURE: [u8; 4] = [PKG_MAGIC[0], PKG_MAGIC[1], 0x06, 0x06];
pub const ZIP64_EOCD_LOCATOR_SIGNATURE: [u8; 4] = [PKG_MAGIC[0], PKG_MAGIC[1], 0x06, 0x07];

pub const BSDIFF_MAGIC: &[u8; 8] = b"BSDIFF40";
pub const PKGDIFF_MAGIC: &[u8; 8] = b"PKGDIFF0";
pub const MANIFEST_MAGIC: &[u8; 4] = b"UPKG";
pub const SIGN_TRAILER_MAGIC: &[u8; 8] = b"UPKGSIGN";

// Entry compression methods (zip method codes; 97/98 are OEM extensions)
pub const METHOD_STORE: u16 = 0;
pub const METHOD_DEFLATE: u16 = 8;
pub const METHOD_LZ4: u16 = 97;
pub const METHOD_GZIP: u16 = 98;

// Well-known package entry names
pub const MANIFEST_ENTRY: &str = "update.manifest";
pub const HASHTREE_ENTRY: &str = "hashtree.bin";
pub const UPDATER_BINARY_ENTRY: &str = "updater_binary";
pub const TRANSFER_LIST_SUFFIX: &str = ".transfer.list";
pub const NEW_DATA_SUFFIX: &str = ".new.dat";
pub const PATCH_DATA_SUFFIX: &str = ".patch.dat";

// Block geometry
pub const BLOCK_SIZE: u64 = 4096;

// Misc partition layout. The boot message sits at offset 0; the partition
// record header (an i64 LE write offset) follows at a fixed gap, then the
// record array. Everything else in misc is reserved and must survive our
// writes untouched.
pub const BOOT_MESSAGE_OFFSET: u64 = 0;
pub const BOOT_MESSAGE_SIZE: usize = 32 + 32 + 768 + 224;
pub const PARTITION_RECORD_OFFSET: u64 = 2048;
pub const PARTITION_RECORD_START: u64 = 2056;
pub const PARTITION_NAME_LEN: usize = 64;
pub const PARTITION_RECORD_INFO_LEN: usize = PARTITION_NAME_LEN + 1;
pub const PARTITION_RECORD_MAX: usize = 128;
pub const PARTITION_RECORD_AREA_LEN: usize = PARTITION_RECORD_MAX * PARTITION_RECORD_INFO_LEN;

// Boot message commands
pub const BOOT_CMD_UPDATER: &str = "boot_updater";
pub const BOOT_CMD_FLASH: &str = "boot_flash";

// Update tokens carried in the boot message argument block
pub const TOKEN_UPDATE_PACKAGE: &str = "--update_package";
pub const TOKEN_RETRY_COUNT: &str = "--retry_count";
pub const TOKEN_SDCARD_UPDATE: &str = "--sdcard_update";
pub const TOKEN_UPGRADED_PKG_NUM: &str = "--upgraded_pkg_num";
pub const TOKEN_USER_WIPE_DATA: &str = "--user_wipe_data";
pub const TOKEN_FACTORY_WIPE_DATA: &str = "--factory_wipe_data";

pub const MAX_RETRY_COUNT: u32 = 3;

// Compiled-in fallback when the mount table has no misc entry
pub const DEFAULT_MISC_DEVICE: &str = "/dev/block/by-name/misc";

// Fallback updater program when the package does not embed one
pub const FALLBACK_UPDATER_BINARY: &str = "/bin/update_bin";

// Updater-program environment: the mount table and stash directory have
// compiled-in locations, overridable for bench setups and tests
pub const DEFAULT_MOUNT_TABLE_PATH: &str = "/etc/ota/fstab";
pub const DEFAULT_STASH_DIR: &str = "/data/ota_stash";
pub const ENV_MOUNT_TABLE: &str = "OTA_MOUNT_TABLE";
pub const ENV_STASH_DIR: &str = "OTA_STASH_DIR";
pub const ENV_DEVICE_ROOT: &str = "OTA_DEVICE_ROOT";

// Driver exit codes
pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_VERIFY_FAILED: i32 = 2;
pub const EXIT_SPACE_INSUFFICIENT: i32 = 3;
pub const EXIT_RETRY: i32 = 4;
pub const EXIT_SKIPPED: i32 = 5;

// Fraction of the progress bar reserved for package verification
pub const VERIFY_PROGRESS_FRACTION: f32 = 0.05;
