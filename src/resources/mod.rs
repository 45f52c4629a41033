//! Algorithm and workgroup configuration resources.
//!
//! Requests reference an algorithm by name; the algorithm template names a
//! workgroup, and the workgroup decides which shard the run lands on and
//! what resources it may use. Both kinds of resources are deployed as YAML
//! documents and served from a read-through cache that can be refreshed
//! while the scheduler is running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while loading or resolving resources.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse resource file '{path}': {message}")]
    ParseError { path: String, message: String },
}

/// Container settings of an algorithm template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerSpec {
    /// Container image reference.
    pub image: String,
    /// Entrypoint override, if any.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments appended after the scheduler-injected ones.
    #[serde(default)]
    pub args: Vec<String>,
}

/// An algorithm template: how to run one algorithm and where.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlgorithmSpec {
    /// Algorithm name, matched against the request path.
    pub name: String,
    /// Workgroup this algorithm is assigned to.
    pub workgroup: String,
    /// Container configuration.
    pub container: ContainerSpec,
    /// Hard deadline for a single run, in seconds.
    #[serde(default)]
    pub deadline_seconds: Option<u64>,
    /// Environment variables injected into every run.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Compute resource caps applied to a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// CPU limit, in cores.
    pub cpu: f64,
    /// Memory limit, e.g. "4Gi".
    pub memory: String,
}

/// A workgroup: routing and resource policy for a set of algorithms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkgroupSpec {
    /// Workgroup name, referenced by algorithm templates.
    pub name: String,
    /// Execution cluster (shard) this workgroup is pinned to.
    pub cluster: String,
    /// Resource caps for runs in this workgroup.
    pub limits: ResourceLimits,
}

/// A single resource document as it appears on disk.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
enum ResourceDocument {
    Algorithm(AlgorithmSpec),
    Workgroup(WorkgroupSpec),
}

/// Read-through cache of algorithm templates and workgroups.
///
/// The cache is eventually consistent with the files on disk: `refresh`
/// reloads everything, lookups are served from memory in between.
pub struct ResourceCache {
    root: PathBuf,
    algorithms: RwLock<HashMap<String, AlgorithmSpec>>,
    workgroups: RwLock<HashMap<String, WorkgroupSpec>>,
}

impl ResourceCache {
    /// Creates an empty cache rooted at a directory of YAML documents.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            algorithms: RwLock::new(HashMap::new()),
            workgroups: RwLock::new(HashMap::new()),
        }
    }

    /// Loads every `.yaml`/`.yml` file under the root directory.
    ///
    /// Replaces the cache contents wholesale; a failed parse aborts the
    /// refresh and keeps the previous snapshot.
    pub async fn refresh(&self) -> Result<(), ResourceError> {
        let mut algorithms = HashMap::new();
        let mut workgroups = HashMap::new();

        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            let raw = tokio::fs::read_to_string(&path).await?;
            for document in parse_documents(&path, &raw)? {
                match document {
                    ResourceDocument::Algorithm(spec) => {
                        debug!(algorithm = %spec.name, "algorithm template loaded");
                        algorithms.insert(spec.name.clone(), spec);
                    }
                    ResourceDocument::Workgroup(spec) => {
                        debug!(workgroup = %spec.name, "workgroup loaded");
                        workgroups.insert(spec.name.clone(), spec);
                    }
                }
            }
        }

        info!(
            algorithms = algorithms.len(),
            workgroups = workgroups.len(),
            "resource cache refreshed"
        );

        *self.algorithms.write().expect("algorithm cache poisoned") = algorithms;
        *self.workgroups.write().expect("workgroup cache poisoned") = workgroups;
        Ok(())
    }

    /// Resolves an algorithm template by name.
    pub fn get_algorithm(&self, name: &str) -> Option<AlgorithmSpec> {
        self.algorithms
            .read()
            .expect("algorithm cache poisoned")
            .get(name)
            .cloned()
    }

    /// Resolves a workgroup by name.
    pub fn get_workgroup(&self, name: &str) -> Option<WorkgroupSpec> {
        self.workgroups
            .read()
            .expect("workgroup cache poisoned")
            .get(name)
            .cloned()
    }

    /// Inserts resources directly, bypassing the filesystem. Used by tests
    /// and embedded setups.
    pub fn insert_algorithm(&self, spec: AlgorithmSpec) {
        self.algorithms
            .write()
            .expect("algorithm cache poisoned")
            .insert(spec.name.clone(), spec);
    }

    /// See [`ResourceCache::insert_algorithm`].
    pub fn insert_workgroup(&self, spec: WorkgroupSpec) {
        self.workgroups
            .write()
            .expect("workgroup cache poisoned")
            .insert(spec.name.clone(), spec);
    }
}

/// Parses one file into its `---`-separated resource documents.
fn parse_documents(path: &Path, raw: &str) -> Result<Vec<ResourceDocument>, ResourceError> {
    let mut documents = Vec::new();
    for chunk in raw.split("\n---") {
        if chunk.trim().is_empty() {
            continue;
        }
        let document: ResourceDocument =
            serde_yaml::from_str(chunk).map_err(|e| ResourceError::ParseError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        documents.push(document);
    }
    Ok(documents)
}
