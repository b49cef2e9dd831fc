//! Directed actions sent by the management service

use anyhow::{Context, Result};
use std::path::Path;

use crate::platform::command::{CommandOutput, CommandRunner};
use crate::platform::common::set_file_permissions;
use crate::storage::{ObjectStore, fetch_verified};

/// A directed action, parsed from the action tag the host delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectedAction {
    Report,
    Customizers,
    Upgrade,
    Reboot,
    Restart,
    Unknown(String),
}

impl DirectedAction {
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "report" => DirectedAction::Report,
            "customizers" => DirectedAction::Customizers,
            "upgrade" => DirectedAction::Upgrade,
            "reboot" => DirectedAction::Reboot,
            "restart" => DirectedAction::Restart,
            other => DirectedAction::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DirectedAction::Report => "report",
            DirectedAction::Customizers => "customizers",
            DirectedAction::Upgrade => "upgrade",
            DirectedAction::Reboot => "reboot",
            DirectedAction::Restart => "restart",
            DirectedAction::Unknown(name) => name,
        }
    }

    /// Action tag of the acknowledgment contact
    pub fn ack_tag(&self) -> String {
        format!("ack+{}", self.name())
    }

    /// Action tag reported when the action failed
    pub fn error_tag(&self) -> String {
        format!("{}+error", self.name())
    }
}

/// Download every object under `prefix` into `directory`, one at a time.
///
/// Stops at the first failure. Returns the number of files written.
pub async fn fetch_customizers(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    directory: &Path,
) -> Result<usize> {
    tokio::fs::create_dir_all(directory)
        .await
        .with_context(|| format!("Failed to create directory: {}", directory.display()))?;

    let objects = store.list_objects(bucket, prefix).await?;
    let mut written = 0;

    for object in &objects {
        let relative = object.key.strip_prefix(prefix).unwrap_or(&object.key);
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            continue;
        }

        let target = directory.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let copied = fetch_verified(store, bucket, &object.key, &target).await?;
        set_file_permissions(&target, 0o755)?;

        tracing::info!(key = %object.key, bytes = copied, "Customizer installed");
        written += 1;
    }

    Ok(written)
}

/// Run a configured external command; a missing command or a non-zero exit is an error
pub async fn run_configured(
    runner: &dyn CommandRunner,
    name: &str,
    command: Option<&str>,
) -> Result<CommandOutput> {
    let command = command
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("No {} command configured", name))?;

    tracing::info!(action = name, "Running: {}", command);
    let output = runner.run(command).await?;

    if !output.success() {
        anyhow::bail!(
            "{} command exited with status {}: {}",
            name,
            output.status,
            output.stderr.trim()
        );
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsObjectStore;
    use crate::storage::testing::TruncatingStore;
    use assert_fs::prelude::*;
    use std::sync::Arc;

    #[test]
    fn tags() {
        assert_eq!(DirectedAction::parse("report").ack_tag(), "ack+report");
        assert_eq!(DirectedAction::parse("upgrade").error_tag(), "upgrade+error");
        assert_eq!(
            DirectedAction::parse("dance"),
            DirectedAction::Unknown("dance".to_string())
        );
        assert_eq!(DirectedAction::parse("dance").error_tag(), "dance+error");
    }

    #[tokio::test]
    async fn downloads_customizers_under_prefix() {
        let remote = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(remote.path());
        store
            .put_object("site", "customizers/10-net.sh", b"#!/bin/sh\n".to_vec())
            .await
            .unwrap();
        store
            .put_object("site", "other/skip.sh", b"x".to_vec())
            .await
            .unwrap();

        let local = assert_fs::TempDir::new().unwrap();
        let written = fetch_customizers(&store, "site", "customizers/", local.path())
            .await
            .unwrap();

        assert_eq!(written, 1);
        local.child("10-net.sh").assert("#!/bin/sh\n");
        local.child("skip.sh").assert(predicates::path::missing());
    }

    #[tokio::test]
    async fn aborts_on_first_error() {
        let remote = tempfile::tempdir().unwrap();
        let inner = Arc::new(FsObjectStore::new(remote.path()));
        inner
            .put_object("site", "customizers/a.sh", b"a".to_vec())
            .await
            .unwrap();
        inner
            .put_object("site", "customizers/b.sh", b"b".to_vec())
            .await
            .unwrap();
        let store = TruncatingStore::new(inner, 1);

        let local = assert_fs::TempDir::new().unwrap();
        let err = fetch_customizers(&store, "site", "customizers/", local.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("customizers/a.sh"));
        local.child("b.sh").assert(predicates::path::missing());
    }
}
