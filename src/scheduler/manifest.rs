//! Submission manifest building.
//!
//! Translates a checkpointed request plus its resolved algorithm template
//! and workgroup into the concrete job description a shard accepts. The
//! manifest is also persisted inside the submission buffer entry so the
//! late-resubmit path can replay it without re-deriving anything.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointedRequest;
use crate::resources::{AlgorithmSpec, ResourceLimits, WorkgroupSpec};

/// Label carrying the scheduler version that built the manifest.
pub const VERSION_LABEL: &str = "runforge.io/scheduler-version";
/// Label carrying the originating request id.
pub const REQUEST_LABEL: &str = "runforge.io/request-id";
/// Label carrying the algorithm name.
pub const ALGORITHM_LABEL: &str = "runforge.io/algorithm";

/// A cluster job submission unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobManifest {
    /// Job name, unique per request.
    pub name: String,
    /// Labels attached to the job object.
    pub labels: HashMap<String, String>,
    /// Container image to run.
    pub image: String,
    /// Entrypoint override.
    #[serde(default)]
    pub command: Option<String>,
    /// Container arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment injected into the container.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Resource caps from the workgroup.
    pub limits: ResourceLimits,
    /// Hard run deadline in seconds, if the template sets one.
    #[serde(default)]
    pub deadline_seconds: Option<u64>,
}

impl JobManifest {
    /// Builds the submission unit for a checkpoint.
    ///
    /// `version` identifies the scheduler build that produced the manifest
    /// and ends up as a job label for traceability.
    pub fn build(
        checkpoint: &CheckpointedRequest,
        algorithm: &AlgorithmSpec,
        workgroup: &WorkgroupSpec,
        version: &str,
    ) -> Self {
        let mut labels = HashMap::new();
        labels.insert(VERSION_LABEL.to_string(), version.to_string());
        labels.insert(REQUEST_LABEL.to_string(), checkpoint.id.clone());
        labels.insert(ALGORITHM_LABEL.to_string(), checkpoint.algorithm.clone());

        let mut env = algorithm.env.clone();
        env.insert("RUNFORGE_REQUEST_ID".to_string(), checkpoint.id.clone());
        env.insert(
            "RUNFORGE_ALGORITHM".to_string(),
            checkpoint.algorithm.clone(),
        );
        if let Some(uri) = &checkpoint.payload_uri {
            env.insert("RUNFORGE_PAYLOAD_URI".to_string(), uri.clone());
        }

        Self {
            name: format!("{}-{}", checkpoint.algorithm, checkpoint.id),
            labels,
            image: algorithm.container.image.clone(),
            command: algorithm.container.command.clone(),
            args: algorithm.container.args.clone(),
            env,
            limits: workgroup.limits.clone(),
            deadline_seconds: algorithm.deadline_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ContainerSpec;

    fn fixtures() -> (CheckpointedRequest, AlgorithmSpec, WorkgroupSpec) {
        let checkpoint =
            CheckpointedRequest::buffered("req-9", "forecaster", "scheduler-0", "shard-west");

        let algorithm = AlgorithmSpec {
            name: "forecaster".to_string(),
            workgroup: "heavy".to_string(),
            container: ContainerSpec {
                image: "registry.local/forecaster:2.0".to_string(),
                command: Some("python".to_string()),
                args: vec!["run.py".to_string()],
            },
            deadline_seconds: Some(7200),
            env: HashMap::from([("MODE".to_string(), "daily".to_string())]),
        };

        let workgroup = WorkgroupSpec {
            name: "heavy".to_string(),
            cluster: "shard-west".to_string(),
            limits: ResourceLimits {
                cpu: 8.0,
                memory: "32Gi".to_string(),
            },
        };

        (checkpoint, algorithm, workgroup)
    }

    #[test]
    fn test_manifest_carries_identity_labels() {
        let (checkpoint, algorithm, workgroup) = fixtures();
        let manifest = JobManifest::build(&checkpoint, &algorithm, &workgroup, "0.1.0-test");

        assert_eq!(manifest.name, "forecaster-req-9");
        assert_eq!(manifest.labels[VERSION_LABEL], "0.1.0-test");
        assert_eq!(manifest.labels[REQUEST_LABEL], "req-9");
        assert_eq!(manifest.labels[ALGORITHM_LABEL], "forecaster");
    }

    #[test]
    fn test_manifest_merges_env() {
        let (mut checkpoint, algorithm, workgroup) = fixtures();
        checkpoint.payload_uri = Some("file:///payloads/forecaster/req-9".to_string());

        let manifest = JobManifest::build(&checkpoint, &algorithm, &workgroup, "0.1.0");

        assert_eq!(manifest.env["MODE"], "daily");
        assert_eq!(manifest.env["RUNFORGE_REQUEST_ID"], "req-9");
        assert_eq!(
            manifest.env["RUNFORGE_PAYLOAD_URI"],
            "file:///payloads/forecaster/req-9"
        );
    }

    #[test]
    fn test_manifest_takes_workgroup_limits_and_template_deadline() {
        let (checkpoint, algorithm, workgroup) = fixtures();
        let manifest = JobManifest::build(&checkpoint, &algorithm, &workgroup, "0.1.0");

        assert_eq!(manifest.limits.cpu, 8.0);
        assert_eq!(manifest.limits.memory, "32Gi");
        assert_eq!(manifest.deadline_seconds, Some(7200));
        assert_eq!(manifest.command.as_deref(), Some("python"));
    }

    #[test]
    fn test_manifest_serde_roundtrip() {
        let (checkpoint, algorithm, workgroup) = fixtures();
        let manifest = JobManifest::build(&checkpoint, &algorithm, &workgroup, "0.1.0");

        let json = serde_json::to_string(&manifest).unwrap();
        let parsed: JobManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, manifest);
    }
}
