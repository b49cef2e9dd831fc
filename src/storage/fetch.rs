//! Verified object download.
//!
//! An object is written to a temporary sibling of its target and only
//! renamed into place once the bytes written match the declared length.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::AsyncWriteExt;

use super::ObjectStore;
use crate::platform::common::temp_path_for;

/// Fetch `bucket/key` into `target`, replacing any existing file.
///
/// On failure `target` is left as it was and no temporary file remains.
pub async fn fetch_verified(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    target: &Path,
) -> Result<u64> {
    let mut body = store.get_object(bucket, key).await?;
    let temp = temp_path_for(target);

    let written = match write_temp(&temp, &mut body.reader).await {
        Ok(n) => n,
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e).with_context(|| format!("Failed to download {}", key));
        }
    };

    if written != body.content_length {
        let _ = tokio::fs::remove_file(&temp).await;
        anyhow::bail!(
            "Short read for {}: got {} of {} bytes",
            key,
            written,
            body.content_length
        );
    }

    tokio::fs::rename(&temp, target)
        .await
        .with_context(|| format!("Failed to rename into {}", target.display()))?;
    Ok(written)
}

async fn write_temp(
    temp: &Path,
    reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
) -> Result<u64> {
    let mut file = tokio::fs::File::create(temp)
        .await
        .with_context(|| format!("Failed to create {}", temp.display()))?;
    let written = tokio::io::copy(reader, &mut file)
        .await
        .with_context(|| format!("Failed to write {}", temp.display()))?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsObjectStore;
    use crate::storage::testing::TruncatingStore;
    use std::sync::Arc;

    async fn seeded(dir: &Path) -> Arc<dyn ObjectStore> {
        let store = FsObjectStore::new(dir);
        store.put_object("b", "conf.ini", b"key=value".to_vec()).await.unwrap();
        Arc::new(store)
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".part"))
            .collect()
    }

    #[tokio::test]
    async fn replaces_target_with_complete_object() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let target = local.path().join("conf.ini");
        std::fs::write(&target, b"old").unwrap();

        let store = seeded(remote.path()).await;
        let written = fetch_verified(store.as_ref(), "b", "conf.ini", &target)
            .await
            .unwrap();

        assert_eq!(written, 9);
        assert_eq!(std::fs::read(&target).unwrap(), b"key=value");
        assert!(leftovers(local.path()).is_empty());
    }

    #[tokio::test]
    async fn short_read_keeps_the_old_file() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let target = local.path().join("conf.ini");
        std::fs::write(&target, b"old").unwrap();

        let store = TruncatingStore::new(seeded(remote.path()).await, 2);
        let err = fetch_verified(&store, "b", "conf.ini", &target)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Short read"));
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
        assert!(leftovers(local.path()).is_empty());
    }

    #[tokio::test]
    async fn missing_object_leaves_nothing_behind() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let store = seeded(remote.path()).await;

        let target = local.path().join("absent");
        assert!(fetch_verified(store.as_ref(), "b", "absent", &target).await.is_err());
        assert!(!target.exists());
        assert!(leftovers(local.path()).is_empty());
    }
}
