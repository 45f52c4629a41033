//! Durable stores backing the checkpoint buffer.
//!
//! Two concerns live here: the checkpoint row store (system of record for
//! request lifecycle, plus the submission buffer entries) and the payload
//! store (externalized request bodies that exceed the inline threshold).
//! Both are traits so tests and local runs can swap the Postgres/filesystem
//! implementations for in-memory ones.

mod database;
mod memory;
mod payloads;

pub use database::PostgresCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use payloads::FilesystemPayloadStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::checkpoint::{CheckpointedRequest, LifecycleStage, SubmissionBufferEntry};

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to reach the backing store.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Stored record could not be decoded.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Serialization of a record field failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error from the payload store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URI does not belong to this payload store.
    #[error("Unsupported payload URI: {0}")]
    UnsupportedUri(String),
}

/// Result of a conditional lifecycle update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The record matched the expected stage and was written.
    Applied,
    /// The record's current stage was not in the expected set; nothing was
    /// written. Benign: another handler advanced the record first.
    StaleTransition,
}

/// Row store for checkpoints and submission buffer entries.
///
/// All writes are full-record upserts keyed by `(algorithm, id)`;
/// the store never merges partial updates. Reads are read-after-write
/// consistent for the same key.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Inserts or fully replaces a checkpoint record.
    async fn upsert(&self, checkpoint: &CheckpointedRequest) -> Result<(), StoreError>;

    /// Replaces a checkpoint record only if its current lifecycle stage is
    /// in `expected`. Compare-and-swap guard for commit and cancellation.
    async fn update_if_stage(
        &self,
        checkpoint: &CheckpointedRequest,
        expected: &[LifecycleStage],
    ) -> Result<UpdateOutcome, StoreError>;

    /// Point lookup; `None` when absent.
    async fn get(&self, id: &str, algorithm: &str)
        -> Result<Option<CheckpointedRequest>, StoreError>;

    /// All checkpoints sharing a client tag, in unspecified order.
    async fn get_by_tag(&self, tag: &str) -> Result<Vec<CheckpointedRequest>, StoreError>;

    /// All still-buffered checkpoints accepted by the given host.
    async fn get_buffered_by_host(
        &self,
        host: &str,
    ) -> Result<Vec<CheckpointedRequest>, StoreError>;

    /// Persists the submission buffer entry for an unsubmitted checkpoint.
    async fn put_entry(&self, entry: &SubmissionBufferEntry) -> Result<(), StoreError>;

    /// Reads the submission buffer entry for a checkpoint; `None` when the
    /// checkpoint already left `Buffered`.
    async fn get_entry(
        &self,
        id: &str,
        algorithm: &str,
    ) -> Result<Option<SubmissionBufferEntry>, StoreError>;

    /// Deletes the submission buffer entry once the checkpoint is
    /// submitted. Deleting a missing entry is not an error.
    async fn remove_entry(&self, id: &str, algorithm: &str) -> Result<(), StoreError>;
}

/// Blob store for oversized request payloads and run results.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Writes the payload and returns its URI.
    async fn save(&self, algorithm: &str, id: &str, payload: &[u8]) -> Result<String, StoreError>;

    /// Reads a payload back by URI.
    async fn load(&self, uri: &str) -> Result<Vec<u8>, StoreError>;
}
