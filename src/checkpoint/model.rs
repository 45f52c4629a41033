//! Checkpoint data model.
//!
//! A `CheckpointedRequest` is the durable record of one accepted
//! algorithm-execution request and the unit the scheduling pipeline moves
//! around. Its lifecycle stage is the single source of truth for what has
//! happened to the request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::StageKey;
use crate::resources::WorkgroupSpec;
use crate::scheduler::JobManifest;

/// Lifecycle stage of a checkpointed request.
///
/// Transitions:
/// `Buffered -> Running -> {Completed, Failed, DeadlineExceeded}`,
/// `Buffered -> Cancelled`, `Running -> Cancelled`, and
/// `{Buffered, Running} -> SchedulingFailed` when a submission is rejected
/// as non-retryable. Everything except `Buffered` and `Running` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStage {
    Buffered,
    Running,
    Completed,
    Failed,
    Cancelled,
    SchedulingFailed,
    DeadlineExceeded,
}

impl LifecycleStage {
    /// Whether this stage admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LifecycleStage::Buffered | LifecycleStage::Running)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: LifecycleStage) -> bool {
        use LifecycleStage::*;
        match (self, next) {
            (Buffered, Running) => true,
            (Buffered, Cancelled) | (Running, Cancelled) => true,
            (Buffered, SchedulingFailed) | (Running, SchedulingFailed) => true,
            (Running, Completed) | (Running, Failed) | (Running, DeadlineExceeded) => true,
            _ => false,
        }
    }

    /// Stable string form, matching the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStage::Buffered => "BUFFERED",
            LifecycleStage::Running => "RUNNING",
            LifecycleStage::Completed => "COMPLETED",
            LifecycleStage::Failed => "FAILED",
            LifecycleStage::Cancelled => "CANCELLED",
            LifecycleStage::SchedulingFailed => "SCHEDULING_FAILED",
            LifecycleStage::DeadlineExceeded => "DEADLINE_EXCEEDED",
        }
    }

    /// Parses the stored string form.
    pub fn parse(value: &str) -> Option<LifecycleStage> {
        match value {
            "BUFFERED" => Some(LifecycleStage::Buffered),
            "RUNNING" => Some(LifecycleStage::Running),
            "COMPLETED" => Some(LifecycleStage::Completed),
            "FAILED" => Some(LifecycleStage::Failed),
            "CANCELLED" => Some(LifecycleStage::Cancelled),
            "SCHEDULING_FAILED" => Some(LifecycleStage::SchedulingFailed),
            "DEADLINE_EXCEEDED" => Some(LifecycleStage::DeadlineExceeded),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one accepted request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointedRequest {
    /// Request identifier, client-supplied or generated at acceptance.
    pub id: String,
    /// Algorithm name the request targets.
    pub algorithm: String,
    /// Current lifecycle stage.
    pub lifecycle_stage: LifecycleStage,
    /// Scheduler instance that accepted the request. Immutable once set.
    pub received_by_host: String,
    /// Execution cluster the resolved workgroup pins this request to.
    pub cluster: String,
    /// Client grouping key.
    #[serde(default)]
    pub tag: Option<String>,
    /// Parent request, for runs spawned by other runs.
    #[serde(default)]
    pub parent_request_id: Option<String>,
    /// Cluster-assigned submission identifier. Set iff the request reached
    /// `Running` (or a post-`Running` terminal stage).
    #[serde(default)]
    pub job_uid: Option<String>,
    /// Inline request payload, present when it fit under the inline
    /// threshold.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// External location of the payload when it was too large to inline.
    #[serde(default)]
    pub payload_uri: Option<String>,
    /// External location of produced output, set by the result path.
    #[serde(default)]
    pub result_uri: Option<String>,
    /// Failure cause reported by the algorithm or the cancellation path.
    #[serde(default)]
    pub algorithm_failure_cause: Option<String>,
    /// Free-form failure details.
    #[serde(default)]
    pub algorithm_failure_details: Option<String>,
    /// Machine-readable failure code.
    #[serde(default)]
    pub algorithm_failure_code: Option<String>,
    /// Acceptance time.
    pub created_at: DateTime<Utc>,
    /// Time the submission was committed (`Running` transition).
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

impl CheckpointedRequest {
    /// Creates a freshly buffered checkpoint.
    pub fn buffered(
        id: impl Into<String>,
        algorithm: impl Into<String>,
        received_by_host: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            algorithm: algorithm.into(),
            lifecycle_stage: LifecycleStage::Buffered,
            received_by_host: received_by_host.into(),
            cluster: cluster.into(),
            tag: None,
            parent_request_id: None,
            job_uid: None,
            payload: None,
            payload_uri: None,
            result_uri: None,
            algorithm_failure_cause: None,
            algorithm_failure_details: None,
            algorithm_failure_code: None,
            created_at: Utc::now(),
            sent_at: None,
        }
    }

    /// Sets the client grouping tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Sets the parent request reference.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_request_id = Some(parent.into());
        self
    }

    /// Composite key used by stores and retry tracking.
    pub fn composite_key(&self) -> String {
        format!("{}/{}", self.algorithm, self.id)
    }
}

impl StageKey for CheckpointedRequest {
    fn stage_key(&self) -> String {
        self.composite_key()
    }
}

/// Reconstructable description of the unit that would be submitted for a
/// still-buffered checkpoint. Allows late resubmission without replaying
/// client input. Deleted once the checkpoint leaves `Buffered`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionBufferEntry {
    /// Request this entry belongs to.
    pub request_id: String,
    /// Algorithm of the owning request.
    pub algorithm: String,
    /// Target execution cluster.
    pub cluster: String,
    /// Fully built submission manifest.
    pub manifest: JobManifest,
}

/// Ephemeral pairing of a checkpoint with its resolved workgroup, produced
/// once per accepted request and consumed exactly once by the submit stage.
#[derive(Debug, Clone)]
pub struct BufferOutput {
    pub checkpoint: CheckpointedRequest,
    pub workgroup: WorkgroupSpec,
}

impl StageKey for BufferOutput {
    fn stage_key(&self) -> String {
        self.checkpoint.composite_key()
    }
}

/// Recovery-path pairing of a stranded checkpoint and its persisted
/// submission description.
#[derive(Debug, Clone)]
pub struct LateSubmission {
    pub checkpoint: CheckpointedRequest,
    pub entry: SubmissionBufferEntry,
}

impl StageKey for LateSubmission {
    fn stage_key(&self) -> String {
        self.checkpoint.composite_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_stages() {
        assert!(!LifecycleStage::Buffered.is_terminal());
        assert!(!LifecycleStage::Running.is_terminal());
        assert!(LifecycleStage::Completed.is_terminal());
        assert!(LifecycleStage::Failed.is_terminal());
        assert!(LifecycleStage::Cancelled.is_terminal());
        assert!(LifecycleStage::SchedulingFailed.is_terminal());
        assert!(LifecycleStage::DeadlineExceeded.is_terminal());
    }

    #[test]
    fn test_allowed_transitions() {
        use LifecycleStage::*;

        assert!(Buffered.can_transition_to(Running));
        assert!(Buffered.can_transition_to(Cancelled));
        assert!(Buffered.can_transition_to(SchedulingFailed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(DeadlineExceeded));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(SchedulingFailed));
    }

    #[test]
    fn test_forbidden_transitions() {
        use LifecycleStage::*;

        assert!(!Buffered.can_transition_to(Completed));
        assert!(!Buffered.can_transition_to(Failed));
        assert!(!Buffered.can_transition_to(DeadlineExceeded));
        assert!(!Running.can_transition_to(Buffered));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!SchedulingFailed.can_transition_to(Running));
    }

    #[test]
    fn test_stage_string_roundtrip() {
        for stage in [
            LifecycleStage::Buffered,
            LifecycleStage::Running,
            LifecycleStage::Completed,
            LifecycleStage::Failed,
            LifecycleStage::Cancelled,
            LifecycleStage::SchedulingFailed,
            LifecycleStage::DeadlineExceeded,
        ] {
            assert_eq!(LifecycleStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(LifecycleStage::parse("UNKNOWN"), None);
    }

    #[test]
    fn test_buffered_checkpoint_defaults() {
        let checkpoint =
            CheckpointedRequest::buffered("req-1", "forecaster", "scheduler-0", "shard-east")
                .with_tag("nightly");

        assert_eq!(checkpoint.lifecycle_stage, LifecycleStage::Buffered);
        assert!(checkpoint.job_uid.is_none());
        assert!(checkpoint.sent_at.is_none());
        assert_eq!(checkpoint.tag.as_deref(), Some("nightly"));
        assert_eq!(checkpoint.composite_key(), "forecaster/req-1");
    }

    #[test]
    fn test_checkpoint_serde_roundtrip() {
        let checkpoint =
            CheckpointedRequest::buffered("req-2", "forecaster", "scheduler-0", "shard-east")
                .with_parent("req-1");

        let json = serde_json::to_string(&checkpoint).unwrap();
        assert!(json.contains("\"BUFFERED\""));

        let parsed: CheckpointedRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, checkpoint.id);
        assert_eq!(parsed.parent_request_id.as_deref(), Some("req-1"));
        assert_eq!(parsed.lifecycle_stage, LifecycleStage::Buffered);
    }
}
