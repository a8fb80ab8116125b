// SPDX-License-Identifier: Apache-2.0

pub mod blockset;
pub mod constants;
pub mod device;
pub mod driver;
pub mod error;
pub mod misc;
pub mod mount;
pub mod package;
pub mod patch;
pub mod transfer;
pub mod utils;
pub mod verify;

pub use blockset::BlockSet;
pub use error::{Result, UpdateError};
