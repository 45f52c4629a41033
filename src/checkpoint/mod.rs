//! Checkpointed request model and the durable buffer over it.

mod buffer;
mod model;

pub use buffer::{BufferConfig, BufferError, CheckpointBuffer};
pub use model::{
    BufferOutput, CheckpointedRequest, LateSubmission, LifecycleStage, SubmissionBufferEntry,
};
