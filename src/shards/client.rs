//! Shard submission clients.
//!
//! A shard is one independently managed execution cluster. Each shard is
//! reachable through a [`ShardApi`]: submit a job manifest, delete a job
//! by its cluster-assigned uid. The HTTP implementation talks to the
//! shard's job-execution endpoint; tests substitute recording mocks.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::scheduler::JobManifest;

/// Errors from shard submission endpoints.
#[derive(Debug, Error)]
pub enum ShardError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("Shard request failed: {0}")]
    RequestFailed(String),

    /// The shard rejected the call.
    #[error("Shard rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The shard answered with a body we cannot decode.
    #[error("Invalid shard response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ShardError {
    fn from(err: reqwest::Error) -> Self {
        ShardError::RequestFailed(err.to_string())
    }
}

/// Deletion cascade policy forwarded to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationPolicy {
    Background,
    Foreground,
    Orphan,
}

impl PropagationPolicy {
    /// Wire form of the policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            PropagationPolicy::Background => "Background",
            PropagationPolicy::Foreground => "Foreground",
            PropagationPolicy::Orphan => "Orphan",
        }
    }
}

impl FromStr for PropagationPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Background" => Ok(PropagationPolicy::Background),
            "Foreground" => Ok(PropagationPolicy::Foreground),
            "Orphan" => Ok(PropagationPolicy::Orphan),
            other => Err(format!(
                "invalid propagation policy '{other}', expected Background, Foreground or Orphan"
            )),
        }
    }
}

impl std::fmt::Display for PropagationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a remote job deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The job existed and the delete was accepted.
    Deleted,
    /// The job was already gone. Benign: it may have finished on its own.
    NotFound,
}

/// Remote job-execution endpoint of one shard.
#[async_trait]
pub trait ShardApi: Send + Sync {
    /// Submits a job manifest and returns the cluster-assigned uid.
    async fn submit_job(&self, namespace: &str, manifest: &JobManifest)
        -> Result<String, ShardError>;

    /// Deletes a job by uid with the given cascade policy.
    async fn delete_job(
        &self,
        namespace: &str,
        job_uid: &str,
        policy: PropagationPolicy,
    ) -> Result<DeleteOutcome, ShardError>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    uid: String,
}

/// HTTP implementation of [`ShardApi`].
pub struct HttpShardApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpShardApi {
    /// Creates a client for a shard endpoint, e.g. `https://shard-east.internal:6443`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ShardApi for HttpShardApi {
    async fn submit_job(
        &self,
        namespace: &str,
        manifest: &JobManifest,
    ) -> Result<String, ShardError> {
        let url = format!("{}/namespaces/{namespace}/jobs", self.base_url);
        let response = self.client.post(&url).json(manifest).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ShardError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ShardError::InvalidResponse(e.to_string()))?;

        debug!(job = %manifest.name, uid = %body.uid, "job submitted");
        Ok(body.uid)
    }

    async fn delete_job(
        &self,
        namespace: &str,
        job_uid: &str,
        policy: PropagationPolicy,
    ) -> Result<DeleteOutcome, ShardError> {
        let url = format!(
            "{}/namespaces/{namespace}/jobs/{job_uid}?propagationPolicy={policy}",
            self.base_url
        );
        let response = self.client.delete(&url).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ShardError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(DeleteOutcome::Deleted)
    }
}

/// Named handle to one shard: submission endpoint plus target namespace.
/// Immutable after startup.
pub struct ShardClient {
    name: String,
    namespace: String,
    api: Arc<dyn ShardApi>,
}

impl ShardClient {
    /// Wraps an API implementation under a shard name and namespace.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, api: Arc<dyn ShardApi>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            api,
        }
    }

    /// Creates an HTTP-backed shard client.
    pub fn http(
        name: impl Into<String>,
        namespace: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let endpoint = endpoint.into();
        info!(shard = %name, endpoint = %endpoint, "shard client configured");
        Self::new(name, namespace, Arc::new(HttpShardApi::new(endpoint)))
    }

    /// Cluster name this client serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace jobs are submitted into.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Submits a manifest into the shard's namespace.
    pub async fn send_job(&self, manifest: &JobManifest) -> Result<String, ShardError> {
        self.api.submit_job(&self.namespace, manifest).await
    }

    /// Deletes a job in the shard's namespace.
    pub async fn delete_job(
        &self,
        job_uid: &str,
        policy: PropagationPolicy,
    ) -> Result<DeleteOutcome, ShardError> {
        self.api.delete_job(&self.namespace, job_uid, policy).await
    }
}
