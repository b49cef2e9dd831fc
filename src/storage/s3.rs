//! S3 object store adapter.
//!
//! One client per bucket, built on first use from the configured region,
//! endpoint and rotated credentials. A credential rotation drops the whole
//! adapter, so the next use builds fresh clients.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

use ::object_store::aws::AmazonS3Builder;
use ::object_store::buffered::BufWriter;
use ::object_store::path::Path as RemotePath;
use ::object_store::{ObjectMeta, ObjectStore as RemoteStore, PutPayload};

use super::{ObjectBody, ObjectInfo, ObjectStore};
use crate::agent::ObjectStoreConfig;

/// Access keys as delivered by a credential rotation
#[derive(Clone, Deserialize)]
pub struct S3Credentials {
    #[serde(alias = "AccessKeyId", alias = "aws_access_key_id")]
    pub access_key_id: String,
    #[serde(alias = "SecretAccessKey", alias = "aws_secret_access_key")]
    pub secret_access_key: String,
    #[serde(default, alias = "SessionToken", alias = "aws_session_token")]
    pub session_token: Option<String>,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

type ClientFactory = Box<dyn Fn(&str) -> Result<Arc<dyn RemoteStore>> + Send + Sync>;

pub struct S3ObjectStore {
    factory: ClientFactory,
    clients: Mutex<HashMap<String, Arc<dyn RemoteStore>>>,
}

impl S3ObjectStore {
    /// Validates the credentials now; clients are built per bucket on first use
    pub fn new(config: &ObjectStoreConfig) -> Result<Self> {
        let credentials = config
            .credentials
            .clone()
            .map(serde_json::from_value::<S3Credentials>)
            .transpose()
            .context("Invalid object store credentials")?;
        if credentials.is_none() {
            tracing::debug!("No rotated credentials; using the environment");
        }

        let region = config.region.clone();
        let endpoint = config.endpoint.clone();

        Ok(Self::with_factory(Box::new(move |bucket| {
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(region) = &region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            if let Some(credentials) = &credentials {
                builder = builder
                    .with_access_key_id(&credentials.access_key_id)
                    .with_secret_access_key(&credentials.secret_access_key);
                if let Some(token) = &credentials.session_token {
                    builder = builder.with_token(token);
                }
            }
            let client = builder
                .build()
                .with_context(|| format!("Failed to build S3 client for bucket {}", bucket))?;
            Ok(Arc::new(client) as Arc<dyn RemoteStore>)
        })))
    }

    fn with_factory(factory: ClientFactory) -> Self {
        Self {
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, bucket: &str) -> Result<Arc<dyn RemoteStore>> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| anyhow::anyhow!("S3 client cache poisoned"))?;
        if let Some(client) = clients.get(bucket) {
            return Ok(client.clone());
        }

        let client = (self.factory)(bucket)?;
        tracing::debug!(bucket = %bucket, "S3 client ready");
        clients.insert(bucket.to_string(), client.clone());
        Ok(client)
    }
}

fn info(meta: ObjectMeta) -> ObjectInfo {
    ObjectInfo {
        key: meta.location.to_string(),
        size: meta.size,
        modified: meta.last_modified,
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let client = self.client(bucket)?;

        // Listing works on whole path segments; the rest of the prefix is matched here
        let directory = prefix.rfind('/').map(|i| &prefix[..i]).unwrap_or("");
        let base = (!directory.is_empty()).then(|| RemotePath::from(directory));

        let metas: Vec<ObjectMeta> = client
            .list(base.as_ref())
            .try_collect()
            .await
            .with_context(|| format!("Failed to list {}/{}", bucket, prefix))?;

        let mut objects: Vec<ObjectInfo> = metas
            .into_iter()
            .map(info)
            .filter(|object| object.key.starts_with(prefix))
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        let client = self.client(bucket)?;
        match client.head(&RemotePath::from(key)).await {
            Ok(meta) => Ok(Some(info(meta))),
            Err(::object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}/{}", bucket, key)),
        }
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        let client = self.client(bucket)?;
        let result = client
            .get(&RemotePath::from(key))
            .await
            .with_context(|| format!("Failed to fetch {}/{}", bucket, key))?;

        let content_length = result.meta.size;
        let modified = result.meta.last_modified;
        let stream = result.into_stream().map_err(std::io::Error::other);

        Ok(ObjectBody {
            content_length,
            modified,
            reader: Box::new(StreamReader::new(stream)),
        })
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        let client = self.client(bucket)?;
        client
            .put(&RemotePath::from(key), PutPayload::from(data))
            .await
            .with_context(|| format!("Failed to store {}/{}", bucket, key))?;
        Ok(())
    }

    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let client = self.client(bucket)?;
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        // Large files go up as a multipart upload
        let mut writer = BufWriter::new(client, RemotePath::from(key));
        let copied = tokio::io::copy(&mut file, &mut writer).await;
        match copied {
            Ok(_) => writer
                .shutdown()
                .await
                .with_context(|| format!("Failed to complete upload of {}/{}", bucket, key)),
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    tracing::warn!("Failed to abort upload of {}: {}", key, abort);
                }
                Err(e).with_context(|| format!("Failed to upload {}", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::object_store::memory::InMemory;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    /// Adapter over one in-memory backend; counts client builds
    fn in_memory() -> (S3ObjectStore, Arc<InMemory>, Arc<AtomicUsize>) {
        let backend = Arc::new(InMemory::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let (shared, counter) = (backend.clone(), builds.clone());
        let store = S3ObjectStore::with_factory(Box::new(move |_bucket| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(shared.clone() as Arc<dyn RemoteStore>)
        }));
        (store, backend, builds)
    }

    fn config(credentials: Option<serde_json::Value>) -> ObjectStoreConfig {
        ObjectStoreConfig {
            kind: "s3".to_string(),
            region: Some("eu-west-1".to_string()),
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            credentials,
            ..ObjectStoreConfig::default()
        }
    }

    #[test]
    fn accepts_rotated_credentials_in_either_spelling() {
        assert!(S3ObjectStore::new(&config(Some(json!({
            "access_key_id": "AKIA1",
            "secret_access_key": "secret",
        }))))
        .is_ok());
        assert!(S3ObjectStore::new(&config(Some(json!({
            "AccessKeyId": "AKIA1",
            "SecretAccessKey": "secret",
            "SessionToken": "token",
        }))))
        .is_ok());
    }

    #[test]
    fn malformed_credentials_are_rejected() {
        let err = S3ObjectStore::new(&config(Some(json!({"access_key_id": "AKIA1"})))).err();
        assert!(format!("{:#}", err.unwrap()).contains("Invalid object store credentials"));
    }

    #[test]
    fn builds_one_client_per_bucket_without_network() {
        let store = S3ObjectStore::new(&config(Some(json!({
            "access_key_id": "AKIA1",
            "secret_access_key": "secret",
        }))))
        .unwrap();
        let first = store.client("site").unwrap();
        let again = store.client("site").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn put_head_get_roundtrip() {
        let (store, _, builds) = in_memory();
        store.put_object("site", "a/b.txt", b"hello".to_vec()).await.unwrap();

        let info = store.head_object("site", "a/b.txt").await.unwrap().unwrap();
        assert_eq!((info.key.as_str(), info.size), ("a/b.txt", 5));
        assert!(store.head_object("site", "a/missing").await.unwrap().is_none());

        let mut body = store.get_object("site", "a/b.txt").await.unwrap();
        assert_eq!(body.content_length, 5);
        let mut data = Vec::new();
        body.reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"hello");

        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn list_matches_partial_segment_prefixes() {
        let (store, _, _) = in_memory();
        for key in ["logs/2024-01.txt", "logs/2024-02.txt", "logs/2023-12.txt", "other/x"] {
            store.put_object("site", key, b"x".to_vec()).await.unwrap();
        }

        let keys: Vec<String> = store
            .list_objects("site", "logs/2024")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["logs/2024-01.txt", "logs/2024-02.txt"]);

        assert_eq!(store.list_objects("site", "").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn upload_file_streams_contents() {
        let (store, backend, _) = in_memory();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(&path, b"a,b\n1,2\n").unwrap();

        store.upload_file("site", "up/report.csv", &path).await.unwrap();

        let stored = backend
            .get(&RemotePath::from("up/report.csv"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.as_ref(), b"a,b\n1,2\n");
    }
}
