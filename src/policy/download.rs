//! Download handler: mirror a fixed set of object keys into a directory.
//!
//! Files in the target directory that no configured key maps to are removed
//! after the run. A fetched object only appears under its final name once
//! the number of bytes written equals the declared content length.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use super::{CompiledPolicy, PolicyHandler, PolicyReport};
use crate::storage::{ObjectStore, fetch_verified};

#[derive(Debug, Default)]
pub struct DownloadHandler {
    last_timestamps: HashMap<String, DateTime<Utc>>,
}

impl DownloadHandler {
    pub fn new() -> Self {
        Self::default()
    }

    async fn download_one(
        &mut self,
        key: &str,
        name: &str,
        directory: &Path,
        bucket: &str,
        store: &dyn ObjectStore,
        report: &mut PolicyReport,
    ) -> Result<()> {
        let info = store
            .head_object(bucket, key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Object not found: {}", key))?;

        let target = directory.join(name);
        let local_size = tokio::fs::metadata(&target)
            .await
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len());
        let previous = self.last_timestamps.get(key).copied();

        if previous == Some(info.modified) && local_size == Some(info.size) {
            report.unchanged += 1;
            return Ok(());
        }

        let written = fetch_verified(store, bucket, key, &target).await?;

        self.last_timestamps.insert(key.to_string(), info.modified);
        tracing::info!(key = %key, path = %target.display(), bytes = written, "Downloaded");

        if previous.is_some() {
            report.updated += 1;
        } else {
            report.added += 1;
        }
        Ok(())
    }
}

/// Regular files currently in `directory`
async fn snapshot(directory: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    let mut entries = tokio::fs::read_dir(directory)
        .await
        .with_context(|| format!("Failed to read directory: {}", directory.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

fn basename(key: &str) -> Option<&str> {
    key.rsplit('/').next().filter(|name| !name.is_empty())
}

#[async_trait]
impl PolicyHandler for DownloadHandler {
    fn reset(&mut self) {
        self.last_timestamps.clear();
    }

    async fn apply(
        &mut self,
        policy: &CompiledPolicy,
        store: Arc<dyn ObjectStore>,
    ) -> Result<PolicyReport> {
        let settings = &policy.settings;
        let directory = settings
            .directory
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Download policy '{}' has no directory", settings.name))?;

        tokio::fs::create_dir_all(directory)
            .await
            .with_context(|| format!("Failed to create directory: {}", directory.display()))?;

        let mut candidates = snapshot(directory).await?;
        let mut report = PolicyReport::default();

        for key in &settings.keys {
            let Some(name) = basename(key) else {
                report.fail(format!("Key has no file name: {}", key));
                continue;
            };
            candidates.remove(name);

            if let Err(e) = self
                .download_one(key, name, directory, &settings.bucket, store.as_ref(), &mut report)
                .await
            {
                report.fail(format!("{}: {:#}", key, e));
            }
        }

        for name in candidates {
            let path = directory.join(&name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Removed file with no configured key");
                    report.deleted += 1;
                }
                Err(e) => report.fail(format!("Failed to remove {}: {}", path.display(), e)),
            }
        }

        tracing::info!(
            policy = policy.name(),
            added = report.added,
            updated = report.updated,
            unchanged = report.unchanged,
            deleted = report.deleted,
            failed = report.failed,
            "Download finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyDefaults, PolicySpec};
    use crate::storage::FsObjectStore;
    use crate::storage::testing::{CountingStore, TruncatingStore};
    use assert_fs::prelude::*;
    use predicates::prelude::*;

    fn policy(dir: &Path, keys: &[&str]) -> CompiledPolicy {
        let spec = PolicySpec {
            directory: Some(dir.to_path_buf()),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            ..serde_yaml::from_str::<PolicySpec>("handler: download\nbucket: site\n").unwrap()
        };
        CompiledPolicy::compile(&spec, 0, &PolicyDefaults::default()).unwrap()
    }

    async fn seeded_store(root: &Path) -> Arc<dyn ObjectStore> {
        let store = FsObjectStore::new(root);
        store
            .put_object("site", "config/site.json", b"{\"a\": 1}\n".to_vec())
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn first_download_is_added() {
        let remote = tempfile::tempdir().unwrap();
        let local = assert_fs::TempDir::new().unwrap();
        let store = seeded_store(remote.path()).await;

        let mut handler = DownloadHandler::new();
        let report = handler
            .apply(&policy(local.path(), &["config/site.json"]), store)
            .await
            .unwrap();

        assert_eq!(report.added, 1);
        assert_eq!(report.failed, 0);
        let file = local.child("site.json");
        file.assert("{\"a\": 1}\n");
        assert_eq!(std::fs::metadata(file.path()).unwrap().len(), 9);
    }

    #[tokio::test]
    async fn unchanged_object_is_not_fetched_again() {
        let remote = tempfile::tempdir().unwrap();
        let local = assert_fs::TempDir::new().unwrap();
        let store = Arc::new(CountingStore::new(seeded_store(remote.path()).await));
        let policy = policy(local.path(), &["config/site.json"]);

        let mut handler = DownloadHandler::new();
        handler.apply(&policy, store.clone()).await.unwrap();

        let before = store.calls();
        let report = handler.apply(&policy, store.clone()).await.unwrap();
        assert_eq!(report.unchanged, 1);
        // head only
        assert_eq!(store.calls(), before + 1);
    }

    #[tokio::test]
    async fn short_body_never_reaches_final_name() {
        let remote = tempfile::tempdir().unwrap();
        let local = assert_fs::TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(TruncatingStore::new(seeded_store(remote.path()).await, 4));

        let mut handler = DownloadHandler::new();
        let report = handler
            .apply(&policy(local.path(), &["config/site.json"]), store)
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert!(report.errors[0].contains("Short read"));
        local.child("site.json").assert(predicate::path::missing());
        assert_eq!(std::fs::read_dir(local.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_key_keeps_existing_copy() {
        let remote = tempfile::tempdir().unwrap();
        let local = assert_fs::TempDir::new().unwrap();
        local.child("missing.json").write_str("old").unwrap();
        let store = seeded_store(remote.path()).await;

        let mut handler = DownloadHandler::new();
        let report = handler
            .apply(&policy(local.path(), &["config/missing.json", "config/site.json"]), store)
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.added, 1);
        local.child("missing.json").assert("old");
    }

    #[tokio::test]
    async fn unlisted_files_are_removed() {
        let remote = tempfile::tempdir().unwrap();
        let local = assert_fs::TempDir::new().unwrap();
        local.child("stale.json").write_str("old").unwrap();
        let store = seeded_store(remote.path()).await;

        let mut handler = DownloadHandler::new();
        let report = handler
            .apply(&policy(local.path(), &["config/site.json"]), store)
            .await
            .unwrap();

        assert_eq!(report.deleted, 1);
        local.child("stale.json").assert(predicate::path::missing());
    }

    #[tokio::test]
    async fn changed_object_is_updated() {
        let remote = tempfile::tempdir().unwrap();
        let local = assert_fs::TempDir::new().unwrap();
        let store = seeded_store(remote.path()).await;
        let policy = policy(local.path(), &["config/site.json"]);

        let mut handler = DownloadHandler::new();
        handler.apply(&policy, store.clone()).await.unwrap();

        store
            .put_object("site", "config/site.json", b"{\"a\": 22}\n".to_vec())
            .await
            .unwrap();
        let report = handler.apply(&policy, store).await.unwrap();
        assert_eq!(report.updated, 1);
        local.child("site.json").assert("{\"a\": 22}\n");
    }
}
