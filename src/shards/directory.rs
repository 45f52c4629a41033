//! Shard directory.
//!
//! Immutable cluster-name to shard-client mapping, built once at startup
//! from configuration. The list is small (tens of entries), so resolve is
//! a linear scan. An unresolved name is a configuration error, never a
//! transient one.

use std::sync::Arc;

use super::ShardClient;

/// Startup snapshot of all configured shards.
pub struct ShardDirectory {
    shards: Vec<Arc<ShardClient>>,
}

impl ShardDirectory {
    /// Builds the directory from configured clients.
    pub fn new(shards: Vec<Arc<ShardClient>>) -> Self {
        Self { shards }
    }

    /// Looks up a shard by cluster name.
    pub fn resolve(&self, cluster: &str) -> Option<Arc<ShardClient>> {
        self.shards
            .iter()
            .find(|shard| shard.name() == cluster)
            .cloned()
    }

    /// Number of configured shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether no shards are configured.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobManifest;
    use crate::shards::{DeleteOutcome, PropagationPolicy, ShardApi, ShardError};
    use async_trait::async_trait;

    struct NullApi;

    #[async_trait]
    impl ShardApi for NullApi {
        async fn submit_job(
            &self,
            _namespace: &str,
            _manifest: &JobManifest,
        ) -> Result<String, ShardError> {
            Ok("uid".to_string())
        }

        async fn delete_job(
            &self,
            _namespace: &str,
            _job_uid: &str,
            _policy: PropagationPolicy,
        ) -> Result<DeleteOutcome, ShardError> {
            Ok(DeleteOutcome::Deleted)
        }
    }

    fn shard(name: &str) -> Arc<ShardClient> {
        Arc::new(ShardClient::new(name, "runs", Arc::new(NullApi)))
    }

    #[test]
    fn test_resolve_finds_configured_shard() {
        let directory = ShardDirectory::new(vec![shard("shard-east"), shard("shard-west")]);

        let found = directory.resolve("shard-west").unwrap();
        assert_eq!(found.name(), "shard-west");
        assert_eq!(found.namespace(), "runs");
    }

    #[test]
    fn test_resolve_unknown_cluster_is_none() {
        let directory = ShardDirectory::new(vec![shard("shard-east")]);
        assert!(directory.resolve("shard-north").is_none());
    }

    #[test]
    fn test_empty_directory() {
        let directory = ShardDirectory::new(vec![]);
        assert!(directory.is_empty());
        assert_eq!(directory.len(), 0);
        assert!(directory.resolve("anything").is_none());
    }
}
