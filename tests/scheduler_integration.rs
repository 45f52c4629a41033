//! End-to-end tests over the assembled application.
//!
//! Runs the full stack (buffer, pipeline, shard routing, recovery) with
//! in-memory collaborators: a memory checkpoint store, a temp-dir payload
//! store, an inserted resource cache and a recording shard API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use runforge::app::{AppError, Application, ApplicationServices};
use runforge::checkpoint::{CheckpointedRequest, LifecycleStage, SubmissionBufferEntry};
use runforge::cluster::{
    ChannelEventSource, ClusterError, ClusterEvent, InstanceDirectory, InstanceInfo,
    InstancePhase, COMPONENT_LABEL, SCHEDULER_COMPONENT,
};
use runforge::config::SchedulerConfig;
use runforge::resources::{
    AlgorithmSpec, ContainerSpec, ResourceCache, ResourceLimits, WorkgroupSpec,
};
use runforge::scheduler::JobManifest;
use runforge::shards::{
    DeleteOutcome, PropagationPolicy, ShardApi, ShardClient, ShardDirectory, ShardError,
};
use runforge::storage::{
    CheckpointStore, FilesystemPayloadStore, MemoryCheckpointStore, PayloadStore,
};

/// Shard API recording submissions and deletions, with optional induced
/// transient failures.
struct RecordingApi {
    submissions: Mutex<Vec<(String, tokio::time::Instant)>>,
    deletions: Mutex<Vec<(String, PropagationPolicy)>>,
    failures_before_success: AtomicUsize,
}

impl RecordingApi {
    fn new(failures_before_success: usize) -> Arc<Self> {
        Arc::new(Self {
            submissions: Mutex::new(Vec::new()),
            deletions: Mutex::new(Vec::new()),
            failures_before_success: AtomicUsize::new(failures_before_success),
        })
    }

    fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    fn submissions_before(&self, deadline: tokio::time::Instant) -> usize {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| *t < deadline)
            .count()
    }
}

#[async_trait]
impl ShardApi for RecordingApi {
    async fn submit_job(
        &self,
        _namespace: &str,
        manifest: &JobManifest,
    ) -> Result<String, ShardError> {
        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_before_success
                .store(remaining - 1, Ordering::SeqCst);
            return Err(ShardError::RequestFailed("induced outage".to_string()));
        }

        self.submissions
            .lock()
            .unwrap()
            .push((manifest.name.clone(), tokio::time::Instant::now()));
        Ok(format!("uid-{}", manifest.name))
    }

    async fn delete_job(
        &self,
        _namespace: &str,
        job_uid: &str,
        policy: PropagationPolicy,
    ) -> Result<DeleteOutcome, ShardError> {
        self.deletions
            .lock()
            .unwrap()
            .push((job_uid.to_string(), policy));
        Ok(DeleteOutcome::Deleted)
    }
}

struct StaticDirectory {
    instances: HashMap<String, InstanceInfo>,
}

#[async_trait]
impl InstanceDirectory for StaticDirectory {
    async fn lookup(&self, name: &str) -> Result<Option<InstanceInfo>, ClusterError> {
        Ok(self.instances.get(name).cloned())
    }
}

fn dead_scheduler(name: &str) -> InstanceInfo {
    InstanceInfo {
        name: name.to_string(),
        phase: InstancePhase::Failed,
        labels: HashMap::from([(
            COMPONENT_LABEL.to_string(),
            SCHEDULER_COMPONENT.to_string(),
        )]),
    }
}

fn algorithm() -> AlgorithmSpec {
    AlgorithmSpec {
        name: "forecaster".to_string(),
        workgroup: "standard".to_string(),
        container: ContainerSpec {
            image: "registry.local/forecaster:2.0".to_string(),
            command: None,
            args: vec![],
        },
        deadline_seconds: Some(3600),
        env: HashMap::new(),
    }
}

fn workgroup() -> WorkgroupSpec {
    WorkgroupSpec {
        name: "standard".to_string(),
        cluster: "shard-east".to_string(),
        limits: ResourceLimits {
            cpu: 1.0,
            memory: "2Gi".to_string(),
        },
    }
}

struct Harness {
    app: Application,
    store: Arc<MemoryCheckpointStore>,
    api: Arc<RecordingApi>,
    _dir: tempfile::TempDir,
}

async fn harness_with(config: SchedulerConfig, api: Arc<RecordingApi>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());

    let resources = Arc::new(ResourceCache::new(dir.path()));
    resources.insert_algorithm(algorithm());
    resources.insert_workgroup(workgroup());

    let shards = Arc::new(ShardDirectory::new(vec![Arc::new(ShardClient::new(
        "shard-east",
        "runs",
        api.clone() as Arc<dyn ShardApi>,
    ))]));

    let app = ApplicationServices::new(config)
        .with_checkpoint_store(store.clone() as Arc<dyn CheckpointStore>)
        .with_payload_store(
            Arc::new(FilesystemPayloadStore::new(dir.path())) as Arc<dyn PayloadStore>
        )
        .with_resource_cache(resources)
        .with_shard_directory(shards)
        .build()
        .await
        .unwrap();
    app.start();

    Harness {
        app,
        store,
        api,
        _dir: dir,
    }
}

fn fast_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default()
        .with_host_id("scheduler-self")
        .with_database_url("postgres://unused/in-tests");
    for tuning in [&mut config.submit, &mut config.late_submit, &mut config.commit] {
        tuning.failure_base_delay_ms = 50;
        tuning.failure_max_delay_ms = 2_000;
        tuning.rate_per_second = 1_000;
        tuning.burst = 1_000;
    }
    config
}

async fn harness() -> Harness {
    harness_with(fast_config(), RecordingApi::new(0)).await
}

async fn wait_for_stage(app: &Application, id: &str, stage: LifecycleStage) -> CheckpointedRequest {
    for _ in 0..300 {
        if let Some(cp) = app.get_run(id, "forecaster").await.unwrap() {
            if cp.lifecycle_stage == stage {
                return cp;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {id} never reached {stage}");
}

#[tokio::test(start_paused = true)]
async fn test_accepted_run_is_buffered_before_submission() {
    let h = harness().await;

    // Dry run never enters the pipeline, so the row stays exactly as
    // acceptance left it.
    let id = h
        .app
        .submit_run("forecaster", None, br#"{"horizon": 30}"#, None, None, true)
        .await
        .unwrap();

    let cp = h.app.get_run(&id, "forecaster").await.unwrap().unwrap();
    assert_eq!(cp.lifecycle_stage, LifecycleStage::Buffered);
    assert!(cp.job_uid.is_none());
    h.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_submitted_run_reaches_running() {
    let h = harness().await;

    let id = h
        .app
        .submit_run(
            "forecaster",
            Some("req-1".to_string()),
            br#"{"horizon": 30}"#,
            Some("nightly".to_string()),
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(id, "req-1");

    let cp = wait_for_stage(&h.app, "req-1", LifecycleStage::Running).await;
    assert_eq!(cp.job_uid.as_deref(), Some("uid-forecaster-req-1"));
    assert!(cp.sent_at.unwrap() >= cp.created_at);
    assert_eq!(h.api.submission_count(), 1);

    let tagged = h.app.get_tagged_runs("nightly").await.unwrap();
    assert_eq!(tagged.len(), 1);
    h.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_algorithm_is_rejected_at_acceptance() {
    let h = harness().await;

    let err = h
        .app
        .submit_run("mystery", None, br#"{}"#, None, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UnknownResource { .. }));
    h.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_payload_survives_roundtrip() {
    let h = harness().await;

    let body = br#"{"series": [1, 2, 3]}"#;
    let id = h
        .app
        .submit_run("forecaster", None, body, None, None, true)
        .await
        .unwrap();

    let payload = h
        .app
        .get_run_payload(&id, "forecaster")
        .await
        .unwrap()
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(parsed["series"][2], 3);
    h.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_unknown_run_reports_not_found() {
    let h = harness().await;

    let exists = h
        .app
        .cancel_run("ghost", "forecaster", "ops", "cleanup", "Background")
        .await
        .unwrap();
    assert!(!exists);
    assert!(h.api.deletions.lock().unwrap().is_empty());
    h.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_with_invalid_policy_never_reaches_the_shard() {
    let h = harness().await;
    h.app
        .submit_run(
            "forecaster",
            Some("req-1".to_string()),
            br#"{}"#,
            None,
            None,
            false,
        )
        .await
        .unwrap();
    wait_for_stage(&h.app, "req-1", LifecycleStage::Running).await;

    let result = h
        .app
        .cancel_run("req-1", "forecaster", "ops", "oops", "Everything")
        .await;
    assert!(result.is_err());
    assert!(h.api.deletions.lock().unwrap().is_empty());
    h.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_run_records_initiator_and_reason() {
    let h = harness().await;
    h.app
        .submit_run(
            "forecaster",
            Some("req-1".to_string()),
            br#"{}"#,
            None,
            None,
            false,
        )
        .await
        .unwrap();
    wait_for_stage(&h.app, "req-1", LifecycleStage::Running).await;

    let exists = h
        .app
        .cancel_run("req-1", "forecaster", "ops", "bad input", "Background")
        .await
        .unwrap();
    assert!(exists);

    let cp = h.app.get_run("req-1", "forecaster").await.unwrap().unwrap();
    assert_eq!(cp.lifecycle_stage, LifecycleStage::Cancelled);
    assert_eq!(
        cp.algorithm_failure_cause.as_deref(),
        Some("Cancelled by 'ops'")
    );
    assert_eq!(
        cp.algorithm_failure_details.as_deref(),
        Some("Run cancelled, reason: 'bad input'")
    );
    assert_eq!(h.api.deletions.lock().unwrap().len(), 1);
    h.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_admission_rate_bounds_first_second_submissions() {
    let mut config = fast_config();
    config.submit.rate_per_second = 3;
    config.submit.burst = 2;
    config.submit.workers = 4;
    let h = harness_with(config, RecordingApi::new(0)).await;

    let start = tokio::time::Instant::now();
    for i in 0..6 {
        h.app
            .submit_run(
                "forecaster",
                Some(format!("req-{i}")),
                br#"{}"#,
                None,
                None,
                false,
            )
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(990)).await;
    // burst(2) + rate(3)/s: at most 5 submissions dispatched in the
    // first second.
    let first_second = h.api.submissions_before(start + Duration::from_secs(1));
    assert!(first_second <= 5, "saw {first_second} submissions");

    // The rest drain shortly after.
    for i in 0..6 {
        wait_for_stage(&h.app, &format!("req-{i}"), LifecycleStage::Running).await;
    }
    h.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_shard_outage_is_retried_until_running() {
    let h = harness_with(fast_config(), RecordingApi::new(2)).await;

    h.app
        .submit_run(
            "forecaster",
            Some("req-1".to_string()),
            br#"{}"#,
            None,
            None,
            false,
        )
        .await
        .unwrap();

    let cp = wait_for_stage(&h.app, "req-1", LifecycleStage::Running).await;
    assert!(cp.job_uid.is_some());
    // Two induced failures, then exactly one accepted submission.
    assert_eq!(h.api.submission_count(), 1);
    h.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_resource_documents_are_picked_up_while_running() {
    let mut config = fast_config();
    config.resource_refresh_seconds = 5;
    let h = harness_with(config, RecordingApi::new(0)).await;

    let err = h
        .app
        .submit_run("tuner", None, br#"{}"#, None, None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UnknownResource { .. }));

    // Deploy a new algorithm document after the application started. The
    // reload replaces the cache wholesale, so the file carries the
    // workgroup too.
    std::fs::write(
        h._dir.path().join("tuner.yaml"),
        r#"kind: Workgroup
name: standard
cluster: shard-east
limits:
  cpu: 1.0
  memory: 2Gi
---
kind: Algorithm
name: tuner
workgroup: standard
container:
  image: registry.local/tuner:1.0
"#,
    )
    .unwrap();

    for _ in 0..100 {
        if h.app.resources().get_algorithm("tuner").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let id = h
        .app
        .submit_run("tuner", None, br#"{}"#, None, None, true)
        .await
        .unwrap();
    assert!(h.app.get_run(&id, "tuner").await.unwrap().is_some());
    h.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dead_scheduler_recovery_resubmits_stranded_run() {
    let h = harness().await;

    // A peer accepted this request and died before submitting it.
    let checkpoint = {
        let mut cp = CheckpointedRequest::buffered(
            "req-stranded",
            "forecaster",
            "scheduler-dead",
            "shard-east",
        );
        cp.payload = Some(serde_json::json!({"horizon": 30}));
        cp
    };
    h.store.upsert(&checkpoint).await.unwrap();
    h.store
        .put_entry(&SubmissionBufferEntry {
            request_id: "req-stranded".to_string(),
            algorithm: "forecaster".to_string(),
            cluster: "shard-east".to_string(),
            manifest: JobManifest::build(&checkpoint, &algorithm(), &workgroup(), "test"),
        })
        .await
        .unwrap();

    let events = ChannelEventSource::new(16);
    let directory = Arc::new(StaticDirectory {
        instances: HashMap::from([(
            "scheduler-dead".to_string(),
            dead_scheduler("scheduler-dead"),
        )]),
    });
    let watcher = h.app.start_recovery(&events, directory);

    events.publish(ClusterEvent {
        involved_kind: "Pod".to_string(),
        involved_name: "scheduler-dead".to_string(),
        reason: "Evicted".to_string(),
        message: "node drained".to_string(),
    });

    let cp = wait_for_stage(&h.app, "req-stranded", LifecycleStage::Running).await;
    assert!(cp.job_uid.is_some());
    assert_eq!(h.api.submission_count(), 1);

    // A duplicate event for the same host must not submit again.
    events.publish(ClusterEvent {
        involved_kind: "Pod".to_string(),
        involved_name: "scheduler-dead".to_string(),
        reason: "Evicted".to_string(),
        message: "node drained".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.api.submission_count(), 1);

    h.app.shutdown().await;
    watcher.await.unwrap();
}
