use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

/// Lifecycle state of the device as seen by the management service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Unregistered,
    Registered,
    Discovered,
    Configured,
    Error,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Unregistered => "unregistered",
            DeviceState::Registered => "registered",
            DeviceState::Discovered => "discovered",
            DeviceState::Configured => "configured",
            DeviceState::Error => "error",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The device context shared between the orchestrator, the host and the
/// policy engine. One live copy exists at a time; it is handed from owner
/// to owner by value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DeviceContext {
    #[serde(default)]
    pub state: DeviceState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Pending or compound action tag, e.g. `ack+customizers`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thing_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mailbox_id: Option<String>,

    /// Settings patch delivered by the host (out-of-band)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,

    /// Object-store credential rotation delivered by the host (out-of-band)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,

    /// Fields we don't model but must not drop
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Out-of-band fields stripped from a context after a successful contact
#[derive(Debug, Default)]
pub struct OutOfBand {
    pub credentials: Option<Value>,
    pub config: Option<Value>,
    pub action: Option<String>,
}

impl DeviceContext {
    /// Create a context in the given state
    pub fn with_state(state: DeviceState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }

    /// Whether identity credentials have been issued
    pub fn has_identity(&self) -> bool {
        self.thing_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Remove the out-of-band fields the orchestrator acts on
    pub fn take_out_of_band(&mut self) -> OutOfBand {
        OutOfBand {
            credentials: self.credentials.take(),
            config: self.config.take(),
            action: self.action.take(),
        }
    }

    /// Shallow-merge a JSON object into this context (last write wins).
    ///
    /// The context is left untouched if the merged document no longer
    /// describes a valid context.
    pub fn merge(&mut self, patch: &Map<String, Value>) -> Result<()> {
        let mut doc = match serde_json::to_value(&*self).context("Failed to serialize context")? {
            Value::Object(map) => map,
            _ => anyhow::bail!("Context did not serialize to an object"),
        };

        for (key, value) in patch {
            doc.insert(key.clone(), value.clone());
        }

        let merged: DeviceContext = serde_json::from_value(Value::Object(doc))
            .context("Merged context is not valid")?;
        *self = merged;

        Ok(())
    }

    /// Load the persisted context.
    ///
    /// A missing file yields an unregistered context; an unreadable or
    /// corrupt file yields a context in the error state.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::with_state(DeviceState::Unregistered);
        }

        match Self::read(path) {
            Ok(context) => context,
            Err(e) => {
                tracing::error!(path = %path.display(), "Failed to load device context: {:#}", e);
                let mut context = Self::with_state(DeviceState::Error);
                context.error = Some(format!("{:#}", e));
                context
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read context file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse context file: {}", path.display()))
    }

    /// Persist the context
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize context")?;

        crate::platform::common::atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write context file: {}", path.display()))?;

        Ok(())
    }
}

/// Get the default device context path
pub fn get_context_path() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let system_path = PathBuf::from("/var/lib/fieldsync/context.json");
        if system_path.parent().map(|p| p.exists()).unwrap_or(false) {
            return Ok(system_path);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "fieldsync") {
        let mut path = dirs.data_local_dir().to_path_buf();
        path.push("context.json");
        return Ok(path);
    }

    anyhow::bail!("Could not determine context file location");
}
