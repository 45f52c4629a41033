//! Durable request buffer.
//!
//! Single entry point for accepting new requests and the system of record
//! for their lifecycle. `add` validates and persists a request, then hands
//! it to the scheduling pipeline; everything downstream works off the
//! persisted checkpoint.

use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, info};

use crate::pipeline::StageInlet;
use crate::resources::{AlgorithmSpec, WorkgroupSpec};
use crate::scheduler::JobManifest;
use crate::storage::{CheckpointStore, PayloadStore, StoreError, UpdateOutcome};

use super::{BufferOutput, CheckpointedRequest, LifecycleStage, SubmissionBufferEntry};

/// Errors surfaced by buffer operations.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The request payload is not valid JSON.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The request payload exceeds the configured maximum.
    #[error("Payload of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// The durable store failed; nothing was enqueued.
    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    /// `add` was called before the scheduling pipeline was attached.
    #[error("Scheduling pipeline is not started")]
    PipelineNotStarted,
}

/// Sizing knobs for accepted payloads.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Hard cap on the request body size.
    pub max_payload_size_bytes: usize,
    /// Bodies above this size are externalized to the payload store;
    /// smaller ones stay inline on the checkpoint row.
    pub inline_payload_threshold_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_payload_size_bytes: 8 * 1024 * 1024,
            inline_payload_threshold_bytes: 32 * 1024,
        }
    }
}

/// Durable staging buffer over a checkpoint store and a payload store.
pub struct CheckpointBuffer {
    config: BufferConfig,
    host_id: String,
    store: Arc<dyn CheckpointStore>,
    payloads: Arc<dyn PayloadStore>,
    submit_inlet: OnceLock<Arc<dyn StageInlet<BufferOutput>>>,
}

impl CheckpointBuffer {
    /// Creates a buffer identified as `host_id`; every accepted request is
    /// stamped with this identity for crash recovery.
    pub fn new(
        config: BufferConfig,
        host_id: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
        payloads: Arc<dyn PayloadStore>,
    ) -> Self {
        Self {
            config,
            host_id: host_id.into(),
            store,
            payloads,
            submit_inlet: OnceLock::new(),
        }
    }

    /// Attaches the submit stage. Until this is called, `add` rejects
    /// non-dry-run requests.
    pub fn start(&self, inlet: Arc<dyn StageInlet<BufferOutput>>) {
        if self.submit_inlet.set(inlet).is_err() {
            debug!("buffer already started, ignoring repeated start");
        } else {
            info!(host = %self.host_id, "checkpoint buffer started");
        }
    }

    /// Scheduler instance identity used for `received_by_host`.
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Accepts a request: validates the payload, persists the checkpoint
    /// and its submission buffer entry, and (unless `dry_run`) enqueues the
    /// result into the scheduling pipeline.
    #[allow(clippy::too_many_arguments)]
    pub async fn add(
        &self,
        id: &str,
        algorithm: &AlgorithmSpec,
        workgroup: &WorkgroupSpec,
        payload: &[u8],
        tag: Option<String>,
        parent_request_id: Option<String>,
        dry_run: bool,
    ) -> Result<(), BufferError> {
        if payload.len() > self.config.max_payload_size_bytes {
            return Err(BufferError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size_bytes,
            });
        }

        let parsed: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| BufferError::InvalidPayload(e.to_string()))?;

        let inlet = if dry_run {
            None
        } else {
            Some(
                self.submit_inlet
                    .get()
                    .ok_or(BufferError::PipelineNotStarted)?,
            )
        };

        let mut checkpoint = CheckpointedRequest::buffered(
            id,
            &algorithm.name,
            &self.host_id,
            &workgroup.cluster,
        );
        checkpoint.tag = tag;
        checkpoint.parent_request_id = parent_request_id;

        if payload.len() > self.config.inline_payload_threshold_bytes {
            let uri = self.payloads.save(&algorithm.name, id, payload).await?;
            checkpoint.payload_uri = Some(uri);
        } else {
            checkpoint.payload = Some(parsed);
        }

        let manifest = JobManifest::build(
            &checkpoint,
            algorithm,
            workgroup,
            env!("CARGO_PKG_VERSION"),
        );
        let entry = SubmissionBufferEntry {
            request_id: checkpoint.id.clone(),
            algorithm: checkpoint.algorithm.clone(),
            cluster: workgroup.cluster.clone(),
            manifest,
        };

        self.store.upsert(&checkpoint).await?;
        self.store.put_entry(&entry).await?;

        info!(
            request = %checkpoint.composite_key(),
            cluster = %workgroup.cluster,
            externalized = checkpoint.payload_uri.is_some(),
            dry_run,
            "request buffered"
        );

        if let Some(inlet) = inlet {
            inlet.receive(BufferOutput {
                checkpoint,
                workgroup: workgroup.clone(),
            });
        }

        Ok(())
    }

    /// Point lookup; `None` when the request is unknown.
    pub async fn get(
        &self,
        id: &str,
        algorithm: &str,
    ) -> Result<Option<CheckpointedRequest>, BufferError> {
        Ok(self.store.get(id, algorithm).await?)
    }

    /// All requests sharing a client tag; order unspecified.
    pub async fn get_tagged(&self, tag: &str) -> Result<Vec<CheckpointedRequest>, BufferError> {
        Ok(self.store.get_by_tag(tag).await?)
    }

    /// Still-buffered requests accepted by the given host. Recovery path.
    pub async fn get_buffered(
        &self,
        host: &str,
    ) -> Result<Vec<CheckpointedRequest>, BufferError> {
        Ok(self.store.get_buffered_by_host(host).await?)
    }

    /// Reconstructable submission description for a still-buffered
    /// checkpoint.
    pub async fn get_buffered_entry(
        &self,
        checkpoint: &CheckpointedRequest,
    ) -> Result<Option<SubmissionBufferEntry>, BufferError> {
        Ok(self
            .store
            .get_entry(&checkpoint.id, &checkpoint.algorithm)
            .await?)
    }

    /// Full-record upsert; the caller supplies the complete desired state.
    pub async fn update(&self, checkpoint: &CheckpointedRequest) -> Result<(), BufferError> {
        Ok(self.store.upsert(checkpoint).await?)
    }

    /// Conditional full-record update, applied only when the stored
    /// lifecycle stage is in `expected`.
    pub async fn update_if_stage(
        &self,
        checkpoint: &CheckpointedRequest,
        expected: &[LifecycleStage],
    ) -> Result<UpdateOutcome, BufferError> {
        Ok(self.store.update_if_stage(checkpoint, expected).await?)
    }

    /// Drops the submission buffer entry once a checkpoint has been
    /// submitted.
    pub async fn remove_buffered_entry(
        &self,
        id: &str,
        algorithm: &str,
    ) -> Result<(), BufferError> {
        Ok(self.store.remove_entry(id, algorithm).await?)
    }

    /// Reads back the original request payload, inline or external.
    pub async fn get_payload(
        &self,
        id: &str,
        algorithm: &str,
    ) -> Result<Option<Vec<u8>>, BufferError> {
        let Some(checkpoint) = self.store.get(id, algorithm).await? else {
            return Ok(None);
        };

        if let Some(inline) = &checkpoint.payload {
            return Ok(Some(serde_json::to_vec(inline).map_err(StoreError::from)?));
        }
        if let Some(uri) = &checkpoint.payload_uri {
            return Ok(Some(self.payloads.load(uri).await?));
        }
        Ok(None)
    }
}
