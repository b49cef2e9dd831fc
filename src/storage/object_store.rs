//! Object store abstraction and the filesystem-backed implementation

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncRead;

/// Metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// A fetched object: declared length plus a body stream
pub struct ObjectBody {
    pub content_length: u64,
    pub modified: DateTime<Utc>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_length", &self.content_length)
            .field("modified", &self.modified)
            .finish()
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List objects under a key prefix
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Object metadata, `None` if the object does not exist
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody>;

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()>;

    /// Stream a local file into the store
    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;
}

/// Object store laid out on a filesystem: `<root>/<bucket>/<key>`
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf> {
        validate_segment(bucket).with_context(|| format!("Invalid bucket name: {}", bucket))?;
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let key_path = Path::new(key);
        let valid = !key.is_empty()
            && key_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            anyhow::bail!("Invalid object key: {}", key);
        }
        Ok(self.bucket_path(bucket)?.join(key_path))
    }

    async fn info_for(path: &Path, key: String) -> Result<ObjectInfo> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat object: {}", path.display()))?;
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(ObjectInfo {
            key,
            size: metadata.len(),
            modified,
        })
    }

    async fn commit(temp: &Path, target: &Path) -> Result<()> {
        tokio::fs::rename(temp, target).await.with_context(|| {
            format!("Failed to rename {} to {}", temp.display(), target.display())
        })
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || segment.contains('/') || segment.contains('\\') || segment == "." || segment == ".." {
        anyhow::bail!("must be a single non-empty path segment");
    }
    Ok(())
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".part")
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let bucket_root = self.bucket_path(bucket)?;
        let mut objects = Vec::new();

        if !bucket_root.exists() {
            return Ok(objects);
        }

        let mut pending = vec![bucket_root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("Failed to list: {}", dir.display()))?;

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }

                if is_temp_name(&entry.file_name().to_string_lossy()) {
                    continue;
                }

                let key = path
                    .strip_prefix(&bucket_root)
                    .context("Object escaped bucket root")?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");

                if key.starts_with(prefix) {
                    objects.push(Self::info_for(&path, key).await?);
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        let path = self.object_path(bucket, key)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(Self::info_for(&path, key.to_string()).await?))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        let path = self.object_path(bucket, key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to open object {}/{}", bucket, key))?;
        let info = Self::info_for(&path, key.to_string()).await?;

        Ok(ObjectBody {
            content_length: info.size,
            modified: info.modified,
            reader: Box::new(file),
        })
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = crate::platform::common::temp_path_for(&path);
        tokio::fs::write(&temp, &data)
            .await
            .with_context(|| format!("Failed to write object {}/{}", bucket, key))?;
        Self::commit(&temp, &path).await
    }

    async fn upload_file(&self, bucket: &str, key: &str, source: &Path) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = crate::platform::common::temp_path_for(&path);
        tokio::fs::copy(source, &temp)
            .await
            .with_context(|| format!("Failed to upload {} to {}/{}", source.display(), bucket, key))?;
        Self::commit(&temp, &path).await
    }
}
