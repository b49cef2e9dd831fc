//! Upload handler: push matching local files into the object store

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::spec::strip_prefix;
use super::{CompiledPolicy, PolicyHandler, PolicyReport};
use crate::storage::ObjectStore;

/// Size and modification time of a local file as last synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    size: u64,
    modified: DateTime<Utc>,
}

impl FileStamp {
    fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            size: metadata.len(),
            modified: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        }
    }
}

#[derive(Debug, Default)]
pub struct UploadHandler {
    last_seen: HashMap<PathBuf, FileStamp>,
    moves_disabled: bool,
}

impl UploadHandler {
    pub fn new() -> Self {
        Self::default()
    }

    async fn upload_one(
        &mut self,
        path: &Path,
        policy: &CompiledPolicy,
        store: &dyn ObjectStore,
        report: &mut PolicyReport,
    ) -> Result<()> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        if metadata.is_dir() {
            return Ok(());
        }

        let settings = &policy.settings;
        let path_text = path.to_string_lossy();
        let suffix = strip_prefix(&path_text, &settings.strip);
        let Some(key) = policy.key_for(suffix) else {
            tracing::debug!(path = %path.display(), "Rejected by key transform");
            report.ignored += 1;
            return Ok(());
        };

        let stamp = FileStamp::from_metadata(&metadata);
        if self.last_seen.get(path) == Some(&stamp) {
            report.unchanged += 1;
            return Ok(());
        }

        let remote = store.head_object(&settings.bucket, &key).await?;
        match &remote {
            Some(remote) if remote.size == stamp.size && stamp.modified <= remote.modified => {
                tracing::debug!(key = %key, "Remote copy is current");
                report.skipped += 1;
            }
            _ => {
                store
                    .upload_file(&settings.bucket, &key, path)
                    .await
                    .with_context(|| format!("Failed to upload {} as {}", path.display(), key))?;
                tracing::info!(path = %path.display(), key = %key, "Uploaded");
                if remote.is_some() {
                    report.updated += 1;
                } else {
                    report.added += 1;
                }
            }
        }

        self.dispose(path, suffix, policy, stamp, report).await
    }

    /// Delete, move, or remember a file that is now in the store
    async fn dispose(
        &mut self,
        path: &Path,
        suffix: &str,
        policy: &CompiledPolicy,
        stamp: FileStamp,
        report: &mut PolicyReport,
    ) -> Result<()> {
        let settings = &policy.settings;

        if settings.delete_after_upload {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("Failed to delete {}", path.display()))?;
            self.last_seen.remove(path);
            report.deleted += 1;
            return Ok(());
        }

        if let Some(destination) = &settings.move_after_upload
            && !self.moves_disabled
        {
            if !destination.is_dir() {
                self.moves_disabled = true;
                report.fail(format!(
                    "Move destination {} is not a directory; moves disabled",
                    destination.display()
                ));
            } else {
                let target = destination.join(suffix.trim_start_matches('/'));
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await.with_context(|| {
                        format!("Failed to create directory: {}", parent.display())
                    })?;
                }
                tokio::fs::rename(path, &target).await.with_context(|| {
                    format!("Failed to move {} to {}", path.display(), target.display())
                })?;
                self.last_seen.remove(path);
                report.moved += 1;
                return Ok(());
            }
        }

        self.last_seen.insert(path.to_path_buf(), stamp);
        Ok(())
    }
}

/// Files matching a glob, in sorted order; in-flight temp files excluded
pub(crate) fn match_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = glob::glob(pattern)
        .with_context(|| format!("Invalid pattern: {}", pattern))?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("Unreadable path while matching {}: {}", pattern, e);
                None
            }
        })
        .filter(|path| {
            !path
                .file_name()
                .map(|n| {
                    let n = n.to_string_lossy();
                    n.starts_with('.') && n.ends_with(".part")
                })
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

#[async_trait]
impl PolicyHandler for UploadHandler {
    fn reset(&mut self) {
        self.last_seen.clear();
        self.moves_disabled = false;
    }

    async fn apply(
        &mut self,
        policy: &CompiledPolicy,
        store: Arc<dyn ObjectStore>,
    ) -> Result<PolicyReport> {
        let mut report = PolicyReport::default();

        for path in match_paths(&policy.settings.pattern)? {
            if let Err(e) = self.upload_one(&path, policy, store.as_ref(), &mut report).await {
                report.fail(format!("{}: {:#}", path.display(), e));
            }
        }

        tracing::info!(
            policy = policy.name(),
            added = report.added,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            "Upload finished"
        );
        Ok(report)
    }
}
