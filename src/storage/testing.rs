//! Test doubles for storage collaborators

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ObjectBody, ObjectInfo, ObjectStore};

/// Wraps a store and counts every remote call
pub struct CountingStore {
    inner: Arc<dyn ObjectStore>,
    calls: AtomicUsize,
    pub fail_writes: std::sync::atomic::AtomicBool,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("simulated write failure");
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.count();
        self.inner.list_objects(bucket, prefix).await
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        self.count();
        self.inner.head_object(bucket, key).await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        self.count();
        self.inner.get_object(bucket, key).await
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.count();
        self.check_writes()?;
        self.inner.put_object(bucket, key, data).await
    }

    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        self.count();
        self.check_writes()?;
        self.inner.upload_file(bucket, key, path).await
    }
}

/// Serves objects whose body is shorter than the declared length
pub struct TruncatingStore {
    inner: Arc<dyn ObjectStore>,
    missing_bytes: u64,
}

impl TruncatingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, missing_bytes: u64) -> Self {
        Self {
            inner,
            missing_bytes,
        }
    }
}

#[async_trait]
impl ObjectStore for TruncatingStore {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list_objects(bucket, prefix).await
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        self.inner.head_object(bucket, key).await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        let mut body = self.inner.get_object(bucket, key).await?;
        body.content_length += self.missing_bytes;
        Ok(body)
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.inner.put_object(bucket, key, data).await
    }

    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        self.inner.upload_file(bucket, key, path).await
    }
}
