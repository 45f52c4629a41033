//! Control-plane observation for the cluster the scheduler itself runs in.
//!
//! Dead-instance recovery needs two things from the environment: a stream
//! of lifecycle events and the ability to look up a named instance. Both
//! are traits so the watcher can be driven by an in-process channel in
//! tests and by the platform's event feed in production.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Label carried by every scheduler instance; recovery only reacts to
/// events about instances wearing it.
pub const COMPONENT_LABEL: &str = "runforge.io/component";

/// Label value identifying scheduler instances.
pub const SCHEDULER_COMPONENT: &str = "scheduler";

/// Errors from cluster lookups.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Instance lookup failed: {0}")]
    LookupFailed(String),
}

/// Coarse run state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// What the directory knows about one instance.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub name: String,
    pub phase: InstancePhase,
    pub labels: HashMap<String, String>,
}

impl InstanceInfo {
    /// Whether this instance is a scheduler replica.
    pub fn is_scheduler(&self) -> bool {
        self.labels.get(COMPONENT_LABEL).map(String::as_str) == Some(SCHEDULER_COMPONENT)
    }

    /// An instance still pending or running is not a recovery candidate.
    pub fn is_alive(&self) -> bool {
        matches!(self.phase, InstancePhase::Pending | InstancePhase::Running)
    }
}

/// One lifecycle event observed in the cluster.
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    /// Kind of the involved object, e.g. `Pod`.
    pub involved_kind: String,
    /// Name of the involved object.
    pub involved_name: String,
    /// Machine-readable reason, e.g. `Evicted`.
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
}

/// Source of cluster lifecycle events.
pub trait EventSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}

/// Lookup of instances by name.
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// `None` when no instance by that name exists (it may already be
    /// garbage collected).
    async fn lookup(&self, name: &str) -> Result<Option<InstanceInfo>, ClusterError>;
}

/// Broadcast-channel event source. Production wiring pumps the platform
/// event feed into `publish`; tests publish directly.
pub struct ChannelEventSource {
    tx: broadcast::Sender<ClusterEvent>,
}

impl ChannelEventSource {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fans the event out to all subscribers. Dropped when nobody
    /// listens, which is fine before the watcher starts.
    pub fn publish(&self, event: ClusterEvent) {
        if self.tx.send(event).is_err() {
            warn!("cluster event dropped, no subscribers");
        }
    }
}

impl EventSource for ChannelEventSource {
    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler_labels() -> HashMap<String, String> {
        HashMap::from([(COMPONENT_LABEL.to_string(), SCHEDULER_COMPONENT.to_string())])
    }

    #[test]
    fn test_scheduler_label_detection() {
        let info = InstanceInfo {
            name: "scheduler-1".to_string(),
            phase: InstancePhase::Failed,
            labels: scheduler_labels(),
        };
        assert!(info.is_scheduler());

        let other = InstanceInfo {
            name: "worker-1".to_string(),
            phase: InstancePhase::Failed,
            labels: HashMap::new(),
        };
        assert!(!other.is_scheduler());
    }

    #[test]
    fn test_alive_phases() {
        for (phase, alive) in [
            (InstancePhase::Pending, true),
            (InstancePhase::Running, true),
            (InstancePhase::Succeeded, false),
            (InstancePhase::Failed, false),
            (InstancePhase::Unknown, false),
        ] {
            let info = InstanceInfo {
                name: "x".to_string(),
                phase,
                labels: HashMap::new(),
            };
            assert_eq!(info.is_alive(), alive, "{phase:?}");
        }
    }

    #[tokio::test]
    async fn test_channel_source_fans_out() {
        let source = ChannelEventSource::new(8);
        let mut a = source.subscribe();
        let mut b = source.subscribe();

        source.publish(ClusterEvent {
            involved_kind: "Pod".to_string(),
            involved_name: "scheduler-1".to_string(),
            reason: "Evicted".to_string(),
            message: "node drained".to_string(),
        });

        assert_eq!(a.recv().await.unwrap().reason, "Evicted");
        assert_eq!(b.recv().await.unwrap().involved_name, "scheduler-1");
    }
}
