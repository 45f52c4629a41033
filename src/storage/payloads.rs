//! Filesystem payload store.
//!
//! Request bodies above the inline threshold are written here and the
//! checkpoint keeps only the returned `file://` URI. Layout is one file
//! per request: `{root}/{algorithm}/{id}/payload.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{PayloadStore, StoreError};

const URI_SCHEME: &str = "file://";

/// Payload store rooted at a local directory.
pub struct FilesystemPayloadStore {
    root: PathBuf,
}

impl FilesystemPayloadStore {
    /// Creates a store rooted at `root`. The directory is created lazily
    /// on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn payload_path(&self, algorithm: &str, id: &str) -> PathBuf {
        self.root.join(algorithm).join(id).join("payload.json")
    }
}

#[async_trait]
impl PayloadStore for FilesystemPayloadStore {
    async fn save(&self, algorithm: &str, id: &str, payload: &[u8]) -> Result<String, StoreError> {
        let path = self.payload_path(algorithm, id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(payload).await?;
        file.flush().await?;

        debug!(algorithm, id, bytes = payload.len(), "payload externalized");
        Ok(format!("{URI_SCHEME}{}", path.display()))
    }

    async fn load(&self, uri: &str) -> Result<Vec<u8>, StoreError> {
        let path = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| StoreError::UnsupportedUri(uri.to_string()))?;

        Ok(tokio::fs::read(Path::new(path)).await?)
    }
}
