//! In-memory checkpoint store.
//!
//! Same contract as the Postgres store, held in process memory. Used by
//! tests and single-node local runs where durability across restarts is
//! not required.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::checkpoint::{CheckpointedRequest, LifecycleStage, SubmissionBufferEntry};

use super::{CheckpointStore, StoreError, UpdateOutcome};

/// RwLock-map implementation of [`CheckpointStore`].
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, CheckpointedRequest>>,
    entries: RwLock<HashMap<String, SubmissionBufferEntry>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(algorithm: &str, id: &str) -> String {
        format!("{algorithm}/{id}")
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn upsert(&self, checkpoint: &CheckpointedRequest) -> Result<(), StoreError> {
        self.checkpoints
            .write()
            .expect("checkpoint map poisoned")
            .insert(
                Self::key(&checkpoint.algorithm, &checkpoint.id),
                checkpoint.clone(),
            );
        Ok(())
    }

    async fn update_if_stage(
        &self,
        checkpoint: &CheckpointedRequest,
        expected: &[LifecycleStage],
    ) -> Result<UpdateOutcome, StoreError> {
        let mut checkpoints = self.checkpoints.write().expect("checkpoint map poisoned");
        let key = Self::key(&checkpoint.algorithm, &checkpoint.id);

        match checkpoints.get(&key) {
            Some(current) if expected.contains(&current.lifecycle_stage) => {
                checkpoints.insert(key, checkpoint.clone());
                Ok(UpdateOutcome::Applied)
            }
            _ => Ok(UpdateOutcome::StaleTransition),
        }
    }

    async fn get(
        &self,
        id: &str,
        algorithm: &str,
    ) -> Result<Option<CheckpointedRequest>, StoreError> {
        Ok(self
            .checkpoints
            .read()
            .expect("checkpoint map poisoned")
            .get(&Self::key(algorithm, id))
            .cloned())
    }

    async fn get_by_tag(&self, tag: &str) -> Result<Vec<CheckpointedRequest>, StoreError> {
        Ok(self
            .checkpoints
            .read()
            .expect("checkpoint map poisoned")
            .values()
            .filter(|c| c.tag.as_deref() == Some(tag))
            .cloned()
            .collect())
    }

    async fn get_buffered_by_host(
        &self,
        host: &str,
    ) -> Result<Vec<CheckpointedRequest>, StoreError> {
        Ok(self
            .checkpoints
            .read()
            .expect("checkpoint map poisoned")
            .values()
            .filter(|c| {
                c.received_by_host == host && c.lifecycle_stage == LifecycleStage::Buffered
            })
            .cloned()
            .collect())
    }

    async fn put_entry(&self, entry: &SubmissionBufferEntry) -> Result<(), StoreError> {
        self.entries.write().expect("entry map poisoned").insert(
            Self::key(&entry.algorithm, &entry.request_id),
            entry.clone(),
        );
        Ok(())
    }

    async fn get_entry(
        &self,
        id: &str,
        algorithm: &str,
    ) -> Result<Option<SubmissionBufferEntry>, StoreError> {
        Ok(self
            .entries
            .read()
            .expect("entry map poisoned")
            .get(&Self::key(algorithm, id))
            .cloned())
    }

    async fn remove_entry(&self, id: &str, algorithm: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .expect("entry map poisoned")
            .remove(&Self::key(algorithm, id));
        Ok(())
    }
}
