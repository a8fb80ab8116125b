// SPDX-License-Identifier: Apache-2.0

pub mod command;
pub mod interpreter;
pub mod stash;

pub use command::{Command, TransferList};
pub use interpreter::{Interpreter, ProgressSink};
pub use stash::StashStore;
