// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Tagged failure taxonomy shared by every update component. The driver is
/// the single place that maps these onto user-visible outcomes and boot
/// message state; components only ever return them up the stack.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("invalid block range [{start}, {end})")]
    InvalidRange { start: u64, end: u64 },

    #[error("hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad patch: {0}")]
    BadPatch(String),

    #[error("bad package: {0}")]
    BadPackage(String),

    #[error("unsupported entry compression method {0}")]
    UnsupportedEntry(u16),

    #[error("verification failed: {0}")]
    VerifyFailed(String),

    #[error("unknown digest or signature algorithm {0}")]
    UnknownAlgorithm(u8),

    #[error("certificate parse error: {0}")]
    CertParseError(String),

    #[error("misc device unavailable: {0}")]
    MiscUnavailable(String),

    #[error("misc partition record area full at offset {0}")]
    MiscFull(i64),

    #[error("stash {0} missing")]
    StashMissing(String),

    #[error("invalid transfer program: {0}")]
    ProgramInvalid(String),

    #[error("insufficient space: need {needed} bytes, have {available}")]
    SpaceInsufficient { needed: u64, available: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("retry budget exhausted after {0} attempts")]
    RetryExceeded(u32),
}

pub type Result<T, E = UpdateError> = std::result::Result<T, E>;

impl UpdateError {
    /// Errors that abort the package without any reboot-and-retry: bad
    /// signatures, hashes and patches never get better on a second pass.
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            UpdateError::HashMismatch { .. }
                | UpdateError::VerifyFailed(_)
                | UpdateError::BadPatch(_)
                | UpdateError::BadPackage(_)
        )
    }

    /// Hardware-style faults where a reboot into the updater with an
    /// incremented retry count is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpdateError::Io(_))
    }
}
