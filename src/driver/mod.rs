// SPDX-License-Identifier: Apache-2.0

pub mod progress;
pub mod updater;

pub use progress::{ProgressMsg, ProgressPlan, ProgressWriter};
pub use updater::{run_update, UpdateOutcome, UpdaterConfig};
