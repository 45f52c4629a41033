//! Dead-instance recovery.
//!
//! A scheduler replica that dies between accepting a request and
//! submitting it leaves the checkpoint stranded in `Buffered`. The
//! watcher listens for cluster lifecycle events, and when a peer
//! scheduler instance terminates abnormally it re-enqueues everything
//! that instance had buffered into the late-resubmit stage.
//!
//! Recovery is event-driven only. A missed terminal event means a missed
//! sweep; there is no periodic reconciliation backstop.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointBuffer, LateSubmission};
use crate::cluster::{ClusterEvent, EventSource, InstanceDirectory};
use crate::pipeline::StageInlet;

/// Event reasons treated as abnormal termination of an instance.
const RECOVERY_REASONS: [&str; 4] = ["Killing", "Failed", "Terminated", "Evicted"];

/// Watches cluster events for dead peer schedulers and recovers their
/// buffered requests.
pub struct RecoveryWatcher {
    host_id: String,
    buffer: Arc<CheckpointBuffer>,
    instances: Arc<dyn InstanceDirectory>,
    late_submit: Arc<dyn StageInlet<LateSubmission>>,
}

impl RecoveryWatcher {
    pub fn new(
        host_id: impl Into<String>,
        buffer: Arc<CheckpointBuffer>,
        instances: Arc<dyn InstanceDirectory>,
        late_submit: Arc<dyn StageInlet<LateSubmission>>,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            buffer,
            instances,
            late_submit,
        }
    }

    /// Subscribes to the event source and runs until shutdown. The event
    /// callback only enqueues work; submissions happen on the pipeline's
    /// workers.
    pub fn start(
        self: Arc<Self>,
        events: &dyn EventSource,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        info!(host = %self.host_id, "recovery watcher started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = rx.recv() => match event {
                        Ok(event) => self.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "recovery watcher lagged behind event stream");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            info!(host = %self.host_id, "recovery watcher stopped");
        })
    }

    async fn handle_event(&self, event: ClusterEvent) {
        if event.involved_kind != "Pod" {
            return;
        }
        if event.involved_name == self.host_id {
            return;
        }

        let instance = match self.instances.lookup(&event.involved_name).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                debug!(instance = %event.involved_name, "event for unknown instance, skipping");
                return;
            }
            Err(e) => {
                error!(
                    instance = %event.involved_name,
                    error = %e,
                    "instance lookup failed, event skipped"
                );
                return;
            }
        };

        if !instance.is_scheduler() || instance.is_alive() {
            return;
        }

        if !RECOVERY_REASONS.contains(&event.reason.as_str()) {
            info!(
                instance = %instance.name,
                reason = %event.reason,
                "terminal scheduler event with non-recovery reason, ignoring"
            );
            return;
        }

        info!(
            instance = %instance.name,
            reason = %event.reason,
            message = %event.message,
            "peer scheduler terminated abnormally, recovering buffered requests"
        );
        self.recover_host(&instance.name).await;
    }

    /// One-shot sweep over everything the dead host still had buffered.
    async fn recover_host(&self, host: &str) {
        let stranded = match self.buffer.get_buffered(host).await {
            Ok(stranded) => stranded,
            Err(e) => {
                error!(host, error = %e, "failed to query buffered requests for dead host");
                return;
            }
        };

        if stranded.is_empty() {
            info!(host, "no buffered requests to recover");
            return;
        }

        let mut recovered = 0usize;
        for checkpoint in stranded {
            match self.buffer.get_buffered_entry(&checkpoint).await {
                Ok(Some(entry)) => {
                    self.late_submit.receive(LateSubmission { checkpoint, entry });
                    recovered += 1;
                }
                Ok(None) => {
                    warn!(
                        request = %checkpoint.composite_key(),
                        "buffered checkpoint has no submission entry, cannot recover"
                    );
                }
                Err(e) => {
                    error!(
                        request = %checkpoint.composite_key(),
                        error = %e,
                        "failed to load submission entry"
                    );
                }
            }
        }

        info!(host, recovered, "recovery sweep enqueued");
    }
}
