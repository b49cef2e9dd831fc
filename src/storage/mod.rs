// Storage collaborators: the object store that policies synchronize
// against and the durable queue behind the socket relay.

pub mod fetch;
pub mod object_store;
pub mod queue;
pub mod s3;

#[cfg(test)]
pub(crate) mod testing;

pub use fetch::fetch_verified;
pub use object_store::{FsObjectStore, ObjectBody, ObjectInfo, ObjectStore};
pub use queue::{DurableQueue, MemoryQueue, RedisQueue};
pub use s3::S3ObjectStore;

use anyhow::Result;
use std::sync::Arc;

use crate::agent::{ObjectStoreConfig, QueueConfig};

/// Build the object store client described by the configuration
pub fn build_object_store(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.kind.as_str() {
        "fs" => {
            let root = config
                .root
                .clone()
                .ok_or_else(|| anyhow::anyhow!("object_store.root is required for kind 'fs'"))?;
            tracing::debug!(root = %root.display(), "using filesystem object store");
            Ok(Arc::new(FsObjectStore::new(root)))
        }
        "s3" => {
            tracing::debug!(
                region = config.region.as_deref().unwrap_or("default"),
                "using S3 object store"
            );
            Ok(Arc::new(S3ObjectStore::new(config)?))
        }
        other => anyhow::bail!("Unsupported object store kind: {}", other),
    }
}

/// Build the durable queue described by the configuration
pub async fn build_queue(config: &QueueConfig) -> Result<Arc<dyn DurableQueue>> {
    match config.url.as_deref() {
        Some(url) => Ok(Arc::new(RedisQueue::connect(url).await?)),
        None => {
            tracing::warn!("No queue URL configured; relay items are kept in memory only");
            Ok(Arc::new(MemoryQueue::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_configured_store_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ObjectStoreConfig {
            root: Some(dir.path().to_path_buf()),
            ..ObjectStoreConfig::default()
        };
        assert!(build_object_store(&config).is_ok());

        config.kind = "s3".to_string();
        config.credentials = Some(json!({"access_key_id": "AKIA1", "secret_access_key": "s"}));
        assert!(build_object_store(&config).is_ok());

        config.credentials = Some(json!("not an object"));
        assert!(build_object_store(&config).is_err());

        config.kind = "ftp".to_string();
        assert!(build_object_store(&config).is_err());
    }
}
