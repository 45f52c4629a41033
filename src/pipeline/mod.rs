//! Rate-limited, retrying worker-pool stages.
//!
//! Every processing step of the scheduler (submit, late-resubmit, commit)
//! is an instance of [`PipelineStage`], chained through [`StageInlet`]
//! handles.

mod limiter;
mod stage;

pub use limiter::AdmissionGate;
pub use stage::{
    PipelineStage, StageConfig, StageError, StageHandler, StageInlet, StageKey, StageSender,
    StageStats,
};
