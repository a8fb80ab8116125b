// SPDX-License-Identifier: Apache-2.0

pub mod blockdev;
pub mod writer;

pub use blockdev::BlockDevice;
pub use writer::{BlockWriter, DataWriter, RawWriter, WriteMode};
