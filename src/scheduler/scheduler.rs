//! Request scheduler.
//!
//! Composes three pipeline stages over the checkpoint buffer:
//!
//! - submit: resolves the target shard and sends the persisted manifest
//! - late-resubmit: same outcome, fed by the recovery watcher from
//!   persisted submission entries instead of fresh buffer output
//! - commit: records the `Running` transition after a successful
//!   submission
//!
//! The commit transition is a conditional update expecting `Buffered`, so
//! duplicate submissions and racing cancellations resolve to exactly one
//! winner on the durable store.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use crate::checkpoint::{
    BufferError, BufferOutput, CheckpointBuffer, CheckpointedRequest, LateSubmission,
    LifecycleStage,
};
use crate::pipeline::{PipelineStage, StageConfig, StageError, StageHandler, StageSender};
use crate::shards::{DeleteOutcome, PropagationPolicy, ShardClient, ShardDirectory, ShardError};

/// Errors surfaced by caller-facing scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cancellation carried a propagation policy we refuse to forward.
    #[error("Invalid propagation policy: {0}")]
    InvalidPolicy(String),

    /// No shard is configured for the checkpoint's cluster.
    #[error("No shard configured for cluster '{0}'")]
    UnknownCluster(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("Shard call failed: {0}")]
    Shard(#[from] ShardError),
}

/// Per-stage tuning for the scheduling pipeline.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStageConfig {
    pub submit: StageConfig,
    pub late_submit: StageConfig,
    pub commit: StageConfig,
}

fn resolve_shard(
    shards: &ShardDirectory,
    cluster: &str,
) -> Result<Arc<ShardClient>, SchedulerError> {
    shards
        .resolve(cluster)
        .ok_or_else(|| SchedulerError::UnknownCluster(cluster.to_string()))
}

/// Marks a checkpoint `SchedulingFailed` with the given cause and drops
/// its submission entry. The transition is conditional on the row still
/// being pre-terminal; a lost race just means someone else already decided
/// the outcome. The removal always runs, so a retried recording cleans up
/// after a prior attempt that died between the two writes.
async fn record_scheduling_failure(
    buffer: &CheckpointBuffer,
    checkpoint: &CheckpointedRequest,
    cause: &str,
) -> Result<(), BufferError> {
    let mut failed = checkpoint.clone();
    failed.lifecycle_stage = LifecycleStage::SchedulingFailed;
    failed.algorithm_failure_cause = Some(cause.to_string());

    let expected = [LifecycleStage::Buffered, LifecycleStage::Running];
    let outcome = buffer.update_if_stage(&failed, &expected).await?;
    if outcome == crate::storage::UpdateOutcome::StaleTransition {
        debug!(
            request = %checkpoint.composite_key(),
            "scheduling failure not recorded, lifecycle stage moved concurrently"
        );
    }

    buffer
        .remove_buffered_entry(&checkpoint.id, &checkpoint.algorithm)
        .await
}

/// Sends a persisted manifest to its shard, classifying the outcome for
/// the retry loop.
async fn submit_manifest(
    buffer: &CheckpointBuffer,
    shards: &ShardDirectory,
    mut checkpoint: CheckpointedRequest,
    manifest: &crate::scheduler::JobManifest,
) -> Result<CheckpointedRequest, StageError> {
    let shard = match resolve_shard(shards, &checkpoint.cluster) {
        Ok(shard) => shard,
        Err(e) => {
            record_scheduling_failure(buffer, &checkpoint, &e.to_string())
                .await
                .map_err(StageError::transient)?;
            return Err(StageError::terminal(e));
        }
    };

    match shard.send_job(manifest).await {
        Ok(uid) => {
            info!(
                request = %checkpoint.composite_key(),
                shard = %shard.name(),
                uid = %uid,
                "job submitted"
            );
            checkpoint.job_uid = Some(uid);
            Ok(checkpoint)
        }
        // Client-side rejections will not succeed on retry.
        Err(err @ ShardError::Rejected { status, .. }) if (400..500).contains(&status) => {
            record_scheduling_failure(buffer, &checkpoint, &err.to_string())
                .await
                .map_err(StageError::transient)?;
            Err(StageError::terminal(err))
        }
        Err(err) => Err(StageError::transient(err)),
    }
}

/// Submit stage handler: fresh buffer output to a submitted checkpoint.
struct SubmitHandler {
    buffer: Arc<CheckpointBuffer>,
    shards: Arc<ShardDirectory>,
}

#[async_trait]
impl StageHandler<BufferOutput> for SubmitHandler {
    type Output = CheckpointedRequest;

    async fn handle(&self, item: BufferOutput) -> Result<CheckpointedRequest, StageError> {
        let entry = self
            .buffer
            .get_buffered_entry(&item.checkpoint)
            .await
            .map_err(StageError::transient)?;

        let Some(entry) = entry else {
            // The entry is deleted when a checkpoint leaves Buffered, so
            // its absence means another path already advanced this request.
            return Err(StageError::terminal(format!(
                "no submission entry for {}, already advanced",
                item.checkpoint.composite_key()
            )));
        };

        submit_manifest(&self.buffer, &self.shards, item.checkpoint, &entry.manifest).await
    }
}

/// Late-resubmit stage handler: recovers stranded checkpoints from their
/// persisted submission entries.
struct LateSubmitHandler {
    buffer: Arc<CheckpointBuffer>,
    shards: Arc<ShardDirectory>,
}

#[async_trait]
impl StageHandler<LateSubmission> for LateSubmitHandler {
    type Output = CheckpointedRequest;

    async fn handle(&self, item: LateSubmission) -> Result<CheckpointedRequest, StageError> {
        // Re-read the row: a duplicate recovery enqueue, or a submission
        // that did land before the original scheduler died, must not be
        // submitted a second time.
        let current = self
            .buffer
            .get(&item.checkpoint.id, &item.checkpoint.algorithm)
            .await
            .map_err(StageError::transient)?;

        match current {
            Some(current) if current.lifecycle_stage == LifecycleStage::Buffered => {
                submit_manifest(&self.buffer, &self.shards, current, &item.entry.manifest).await
            }
            Some(current) => Err(StageError::terminal(format!(
                "checkpoint {} is {}, late submission skipped",
                current.composite_key(),
                current.lifecycle_stage
            ))),
            None => Err(StageError::terminal(format!(
                "checkpoint {} no longer exists",
                item.checkpoint.composite_key()
            ))),
        }
    }
}

/// Commit stage handler: persists the `Running` transition.
struct CommitHandler {
    buffer: Arc<CheckpointBuffer>,
}

#[async_trait]
impl StageHandler<CheckpointedRequest> for CommitHandler {
    type Output = String;

    async fn handle(&self, mut checkpoint: CheckpointedRequest) -> Result<String, StageError> {
        checkpoint.lifecycle_stage = LifecycleStage::Running;
        checkpoint.sent_at = Some(Utc::now());

        let outcome = self
            .buffer
            .update_if_stage(&checkpoint, &[LifecycleStage::Buffered])
            .await
            .map_err(StageError::transient)?;

        match outcome {
            crate::storage::UpdateOutcome::Applied => {
                self.buffer
                    .remove_buffered_entry(&checkpoint.id, &checkpoint.algorithm)
                    .await
                    .map_err(StageError::transient)?;
                info!(request = %checkpoint.composite_key(), "commit applied");
                Ok(checkpoint.id)
            }
            crate::storage::UpdateOutcome::StaleTransition => {
                // Cancelled, a duplicate commit, or a prior attempt that
                // applied the transition but lost the entry removal. The
                // row already reflects the winning outcome; removal is
                // idempotent, so run it here too.
                self.buffer
                    .remove_buffered_entry(&checkpoint.id, &checkpoint.algorithm)
                    .await
                    .map_err(StageError::transient)?;
                debug!(
                    request = %checkpoint.composite_key(),
                    "commit skipped, lifecycle stage moved concurrently"
                );
                Ok(checkpoint.id)
            }
        }
    }
}

/// Scheduling pipeline and caller-facing run control.
pub struct RequestScheduler {
    buffer: Arc<CheckpointBuffer>,
    shards: Arc<ShardDirectory>,
    submit: Arc<PipelineStage<BufferOutput, CheckpointedRequest>>,
    late_submit: Arc<PipelineStage<LateSubmission, CheckpointedRequest>>,
    commit: Arc<PipelineStage<CheckpointedRequest, String>>,
}

impl RequestScheduler {
    /// Builds the three stages and wires submit and late-resubmit into
    /// commit. Nothing runs until [`RequestScheduler::start`].
    pub fn new(
        buffer: Arc<CheckpointBuffer>,
        shards: Arc<ShardDirectory>,
        config: SchedulerStageConfig,
    ) -> Self {
        let commit = Arc::new(PipelineStage::new(
            "commit",
            config.commit,
            Arc::new(CommitHandler {
                buffer: Arc::clone(&buffer),
            }) as Arc<dyn StageHandler<CheckpointedRequest, Output = String>>,
            None,
        ));

        let commit_inlet: Arc<dyn crate::pipeline::StageInlet<CheckpointedRequest>> =
            Arc::new(commit.sender());

        let submit = Arc::new(PipelineStage::new(
            "submit",
            config.submit,
            Arc::new(SubmitHandler {
                buffer: Arc::clone(&buffer),
                shards: Arc::clone(&shards),
            })
                as Arc<dyn StageHandler<BufferOutput, Output = CheckpointedRequest>>,
            Some(Arc::clone(&commit_inlet)),
        ));

        let late_submit = Arc::new(PipelineStage::new(
            "late-submit",
            config.late_submit,
            Arc::new(LateSubmitHandler {
                buffer: Arc::clone(&buffer),
                shards: Arc::clone(&shards),
            })
                as Arc<dyn StageHandler<LateSubmission, Output = CheckpointedRequest>>,
            Some(commit_inlet),
        ));

        Self {
            buffer,
            shards,
            submit,
            late_submit,
            commit,
        }
    }

    /// Starts all stage workers and attaches the buffer to the submit
    /// stage.
    pub fn start(&self) {
        self.commit.start();
        self.submit.start();
        self.late_submit.start();
        self.buffer.start(Arc::new(self.submit.sender()));
        info!("request scheduler started");
    }

    /// Stops all stages, letting in-flight attempts finish.
    pub async fn shutdown(&self) {
        self.submit.shutdown().await;
        self.late_submit.shutdown().await;
        self.commit.shutdown().await;
        info!("request scheduler stopped");
    }

    /// Intake for recovered submissions; handed to the recovery watcher.
    pub fn late_submission_inlet(&self) -> StageSender<LateSubmission> {
        self.late_submit.sender()
    }

    /// The buffer this scheduler drains.
    pub fn buffer(&self) -> &Arc<CheckpointBuffer> {
        &self.buffer
    }

    /// Cancels a run: deletes the remote job (if one was submitted) and
    /// records the `Cancelled` transition with the initiator and reason.
    ///
    /// Returns `Ok(false)` when no checkpoint exists for the id. A job
    /// already gone from the remote cluster is not an error; it may have
    /// finished on its own.
    pub async fn cancel_run(
        &self,
        id: &str,
        algorithm: &str,
        initiator: &str,
        reason: &str,
        propagation_policy: &str,
    ) -> Result<bool, SchedulerError> {
        let policy =
            PropagationPolicy::from_str(propagation_policy).map_err(SchedulerError::InvalidPolicy)?;

        let Some(checkpoint) = self.buffer.get(id, algorithm).await? else {
            return Ok(false);
        };

        if let Some(job_uid) = &checkpoint.job_uid {
            let shard = resolve_shard(&self.shards, &checkpoint.cluster)?;
            match shard.delete_job(job_uid, policy).await? {
                DeleteOutcome::Deleted => {
                    info!(request = %checkpoint.composite_key(), uid = %job_uid, "remote job deleted");
                }
                DeleteOutcome::NotFound => {
                    debug!(
                        request = %checkpoint.composite_key(),
                        uid = %job_uid,
                        "remote job already gone"
                    );
                }
            }
        }

        let mut cancelled = checkpoint.clone();
        cancelled.lifecycle_stage = LifecycleStage::Cancelled;
        cancelled.algorithm_failure_cause = Some(format!("Cancelled by '{initiator}'"));
        cancelled.algorithm_failure_details = Some(format!("Run cancelled, reason: '{reason}'"));

        let expected = [LifecycleStage::Buffered, LifecycleStage::Running];
        match self.buffer.update_if_stage(&cancelled, &expected).await? {
            crate::storage::UpdateOutcome::Applied => {
                self.buffer.remove_buffered_entry(id, algorithm).await?;
                info!(
                    request = %checkpoint.composite_key(),
                    initiator,
                    "run cancelled"
                );
            }
            crate::storage::UpdateOutcome::StaleTransition => {
                debug!(
                    request = %checkpoint.composite_key(),
                    stage = %checkpoint.lifecycle_stage,
                    "cancellation skipped, run already terminal"
                );
            }
        }

        Ok(true)
    }
}
