//! Application assembly.
//!
//! Wires configuration, stores, resource cache, shard directory and the
//! scheduling pipeline into one running service. Collaborators default to
//! their production implementations but can be swapped for in-memory ones
//! before `build`, which is how the integration tests run the whole stack
//! without Postgres or a live cluster.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use crate::checkpoint::{BufferError, CheckpointBuffer, CheckpointedRequest};
use crate::cluster::{EventSource, InstanceDirectory};
use crate::config::SchedulerConfig;
use crate::resources::{ResourceCache, ResourceError};
use crate::scheduler::{RecoveryWatcher, RequestScheduler, SchedulerError};
use crate::shards::{ShardClient, ShardDirectory};
use crate::storage::{
    CheckpointStore, FilesystemPayloadStore, PayloadStore, PostgresCheckpointStore, StoreError,
};

/// Errors raised while assembling or operating the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A run referenced an algorithm or workgroup with no resource
    /// document.
    #[error("Unknown {kind} '{name}'")]
    UnknownResource { kind: &'static str, name: String },
}

/// Builder over [`SchedulerConfig`] with overridable collaborators.
pub struct ApplicationServices {
    config: SchedulerConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    payloads: Option<Arc<dyn PayloadStore>>,
    resources: Option<Arc<ResourceCache>>,
    shards: Option<Arc<ShardDirectory>>,
}

impl ApplicationServices {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            store: None,
            payloads: None,
            resources: None,
            shards: None,
        }
    }

    /// Overrides the checkpoint store (default: Postgres from
    /// `database_url`).
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Overrides the payload store (default: filesystem at
    /// `payload_root`).
    pub fn with_payload_store(mut self, payloads: Arc<dyn PayloadStore>) -> Self {
        self.payloads = Some(payloads);
        self
    }

    /// Overrides the resource cache (default: loaded from
    /// `resource_dir`).
    pub fn with_resource_cache(mut self, resources: Arc<ResourceCache>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Overrides the shard directory (default: HTTP clients from the
    /// configured shard list).
    pub fn with_shard_directory(mut self, shards: Arc<ShardDirectory>) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Assembles the application. Connects to Postgres and loads resource
    /// documents unless overrides were provided.
    pub async fn build(self) -> Result<Application, AppError> {
        let store = match self.store {
            Some(store) => store,
            None => {
                let store = PostgresCheckpointStore::connect(&self.config.database_url).await?;
                Arc::new(store) as Arc<dyn CheckpointStore>
            }
        };

        let payloads = self.payloads.unwrap_or_else(|| {
            Arc::new(FilesystemPayloadStore::new(self.config.payload_root.clone()))
                as Arc<dyn PayloadStore>
        });

        let resources = match self.resources {
            Some(resources) => resources,
            None => {
                let cache = ResourceCache::new(self.config.resource_dir.clone());
                cache.refresh().await?;
                Arc::new(cache)
            }
        };

        let shards = self.shards.unwrap_or_else(|| {
            Arc::new(ShardDirectory::new(
                self.config
                    .shards
                    .iter()
                    .map(|s| {
                        Arc::new(ShardClient::http(
                            s.name.clone(),
                            s.namespace.clone(),
                            s.endpoint.clone(),
                        ))
                    })
                    .collect(),
            ))
        });

        let buffer = Arc::new(CheckpointBuffer::new(
            self.config.buffer_config(),
            self.config.host_id.clone(),
            store,
            payloads,
        ));

        let scheduler = Arc::new(RequestScheduler::new(
            Arc::clone(&buffer),
            shards,
            self.config.stage_config(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Application {
            config: self.config,
            buffer,
            resources,
            scheduler,
            shutdown_tx,
        })
    }
}

/// The assembled scheduler service.
pub struct Application {
    config: SchedulerConfig,
    buffer: Arc<CheckpointBuffer>,
    resources: Arc<ResourceCache>,
    scheduler: Arc<RequestScheduler>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Application {
    /// Starts the scheduling pipeline and the periodic resource refresh.
    pub fn start(&self) {
        self.scheduler.start();
        self.spawn_resource_refresh();
        info!(host = %self.config.host_id, "application started");
    }

    /// Keeps the resource cache in sync with the documents on disk. A
    /// failed reload keeps the previous snapshot and is retried on the
    /// next tick.
    fn spawn_resource_refresh(&self) {
        let resources = Arc::clone(&self.resources);
        let period = Duration::from_secs(self.config.resource_refresh_seconds);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; build already loaded
            // the initial snapshot.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = resources.refresh().await {
                            warn!(error = %e, "resource refresh failed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Starts the dead-instance recovery watcher against the given event
    /// source and instance directory.
    pub fn start_recovery(
        &self,
        events: &dyn EventSource,
        instances: Arc<dyn InstanceDirectory>,
    ) -> tokio::task::JoinHandle<()> {
        let watcher = Arc::new(RecoveryWatcher::new(
            self.config.host_id.clone(),
            Arc::clone(&self.buffer),
            instances,
            Arc::new(self.scheduler.late_submission_inlet()),
        ));
        watcher.start(events, self.shutdown_tx.subscribe())
    }

    /// Accepts a new run. Resolves the algorithm and its workgroup from
    /// the resource cache, generates an id when the caller did not supply
    /// one, and hands the request to the buffer. Returns the run id.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_run(
        &self,
        algorithm_name: &str,
        id: Option<String>,
        payload: &[u8],
        tag: Option<String>,
        parent_request_id: Option<String>,
        dry_run: bool,
    ) -> Result<String, AppError> {
        let algorithm =
            self.resources
                .get_algorithm(algorithm_name)
                .ok_or_else(|| AppError::UnknownResource {
                    kind: "algorithm",
                    name: algorithm_name.to_string(),
                })?;
        let workgroup = self
            .resources
            .get_workgroup(&algorithm.workgroup)
            .ok_or_else(|| AppError::UnknownResource {
                kind: "workgroup",
                name: algorithm.workgroup.clone(),
            })?;

        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.buffer
            .add(
                &id,
                &algorithm,
                &workgroup,
                payload,
                tag,
                parent_request_id,
                dry_run,
            )
            .await?;
        Ok(id)
    }

    /// Point lookup of a run.
    pub async fn get_run(
        &self,
        id: &str,
        algorithm: &str,
    ) -> Result<Option<CheckpointedRequest>, AppError> {
        Ok(self.buffer.get(id, algorithm).await?)
    }

    /// All runs sharing a client tag.
    pub async fn get_tagged_runs(&self, tag: &str) -> Result<Vec<CheckpointedRequest>, AppError> {
        Ok(self.buffer.get_tagged(tag).await?)
    }

    /// Original request payload of a run.
    pub async fn get_run_payload(
        &self,
        id: &str,
        algorithm: &str,
    ) -> Result<Option<Vec<u8>>, AppError> {
        Ok(self.buffer.get_payload(id, algorithm).await?)
    }

    /// Cancels a run; see [`RequestScheduler::cancel_run`].
    pub async fn cancel_run(
        &self,
        id: &str,
        algorithm: &str,
        initiator: &str,
        reason: &str,
        propagation_policy: &str,
    ) -> Result<bool, AppError> {
        Ok(self
            .scheduler
            .cancel_run(id, algorithm, initiator, reason, propagation_policy)
            .await?)
    }

    /// The underlying buffer, for collaborators that record terminal
    /// outcomes.
    pub fn buffer(&self) -> &Arc<CheckpointBuffer> {
        &self.buffer
    }

    /// The resource cache backing run resolution.
    pub fn resources(&self) -> &Arc<ResourceCache> {
        &self.resources
    }

    /// Stops the pipeline and the recovery watcher.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.scheduler.shutdown().await;
        info!(host = %self.config.host_id, "application stopped");
    }
}
