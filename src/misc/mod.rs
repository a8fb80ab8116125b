// SPDX-License-Identifier: Apache-2.0

pub mod boot_message;
pub mod partition_record;

pub use boot_message::{BootMessage, UpdateOptions};
pub use partition_record::PartitionRecord;
