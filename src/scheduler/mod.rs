//! Scheduling pipeline: submission, commit, cancellation and recovery.

mod manifest;
mod recovery;
mod scheduler;

pub use manifest::{JobManifest, ALGORITHM_LABEL, REQUEST_LABEL, VERSION_LABEL};
pub use recovery::RecoveryWatcher;
pub use scheduler::{RequestScheduler, SchedulerError, SchedulerStageConfig};
