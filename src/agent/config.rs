use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::policy::PolicySpec;

/// Agent configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Optional YAML file holding additional policies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies_file: Option<PathBuf>,

    pub host: HostConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

/// Which host transport to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    /// Local pass-through, no management service
    Basic,
    /// Polling HTTP
    #[default]
    Http,
    /// Pub/sub broker with HTTP registration and acknowledgment
    Pubsub,
}

impl HostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostKind::Basic => "basic",
            HostKind::Http => "http",
            HostKind::Pubsub => "pubsub",
        }
    }
}

/// Management service settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    #[serde(default)]
    pub kind: HostKind,

    /// Base URL of the management service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Broker URL for the pub/sub host, e.g. `mqtt://broker:1883` or `mqtts://broker`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_url: Option<String>,

    /// Broker password; the thing token is the username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_password: Option<String>,

    /// Bearer token presented at registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_token: Option<String>,

    /// Request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub timeout: u64,
}

/// Agent settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentSettings {
    /// How often to phone home (seconds)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// Random jitter added to each heartbeat (seconds)
    #[serde(default = "default_jitter")]
    pub heartbeat_jitter: u64,

    /// Where the device context is persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_path: Option<PathBuf>,

    /// Where the running agent records its pid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,

    /// Delay after a credential rotation before the object store is used (seconds)
    #[serde(default = "default_credential_cooldown")]
    pub credential_cooldown: u64,

    /// Minimum broker reconnect delay (seconds)
    #[serde(default = "default_reconnect_min")]
    pub reconnect_min: u64,
}

/// Object store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_store_kind")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Default bucket for policies that don't name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// Region for the s3 store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Credentials delivered by rotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
}

/// Durable queue settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Redis URL; in-memory queue when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Bounded wait for a queue pop (seconds)
    #[serde(default = "default_pop_timeout")]
    pub pop_timeout: u64,
}

/// Directed action settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_command: Option<String>,

    #[serde(default = "default_reboot_command")]
    pub reboot_command: String,

    /// Object-store prefix holding handler scripts
    #[serde(default = "default_customizers_prefix")]
    pub customizers_prefix: String,

    /// Local directory receiving handler scripts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customizers_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_request_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    300 // 5 minutes
}

fn default_jitter() -> u64 {
    30
}

fn default_credential_cooldown() -> u64 {
    10
}

fn default_reconnect_min() -> u64 {
    1
}

fn default_store_kind() -> String {
    "fs".to_string()
}

fn default_pop_timeout() -> u64 {
    1
}

fn default_reboot_command() -> String {
    "reboot".to_string()
}

fn default_customizers_prefix() -> String {
    "customizers/".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_jitter: default_jitter(),
            context_path: None,
            pid_file: None,
            credential_cooldown: default_credential_cooldown(),
            reconnect_min: default_reconnect_min(),
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            root: None,
            bucket: None,
            region: None,
            endpoint: None,
            credentials: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: None,
            pop_timeout: default_pop_timeout(),
        }
    }
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            upgrade_command: None,
            reboot_command: default_reboot_command(),
            customizers_prefix: default_customizers_prefix(),
            customizers_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AgentConfig {
    /// Configuration for a host-less agent
    pub fn basic() -> Self {
        Self {
            policies_file: None,
            host: HostConfig {
                kind: HostKind::Basic,
                url: None,
                broker_url: None,
                broker_password: None,
                registration_token: None,
                timeout: default_request_timeout(),
            },
            agent: AgentSettings::default(),
            object_store: ObjectStoreConfig::default(),
            queue: QueueConfig::default(),
            actions: ActionsConfig::default(),
            logging: LoggingConfig::default(),
            policies: Vec::new(),
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self).context("Failed to serialize config")?;

        crate::platform::common::atomic_write(path, toml.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        // Holds tokens
        crate::platform::common::set_file_permissions(path, 0o600)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.kind != HostKind::Basic {
            let raw = self
                .host
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("host.url is required for the {} host", self.host.kind.as_str()))?;
            let url = url::Url::parse(raw).context("Invalid host URL")?;
            if url.scheme() != "https" && url.scheme() != "http" {
                anyhow::bail!("Host URL must use http or https (got: {})", url.scheme());
            }
        }

        if self.host.kind == HostKind::Pubsub {
            let raw = self
                .host
                .broker_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("host.broker_url is required for the pubsub host"))?;
            let url = url::Url::parse(raw).context("Invalid broker URL")?;
            if url.scheme() != "mqtt" && url.scheme() != "mqtts" {
                anyhow::bail!("Broker URL must use mqtt or mqtts (got: {})", url.scheme());
            }
        }

        if self.agent.heartbeat_interval < 10 {
            anyhow::bail!(
                "Heartbeat interval must be at least 10 seconds (got: {})",
                self.agent.heartbeat_interval
            );
        }

        Ok(())
    }

    /// Copy with every secret replaced by a fixed mask, for display and reports
    pub fn redacted(&self) -> Self {
        const MASK: &str = "****";
        let mut config = self.clone();
        if config.host.registration_token.is_some() {
            config.host.registration_token = Some(MASK.to_string());
        }
        if config.host.broker_password.is_some() {
            config.host.broker_password = Some(MASK.to_string());
        }
        if config.object_store.credentials.is_some() {
            config.object_store.credentials = Some(Value::String(MASK.to_string()));
        }
        config
    }

    /// Deep-merge a settings patch into this configuration.
    ///
    /// The configuration is unchanged if the result fails to parse or validate.
    pub fn apply_patch(&mut self, patch: &Value) -> Result<()> {
        if !patch.is_object() {
            anyhow::bail!("Settings patch must be an object");
        }

        let mut doc = serde_json::to_value(&*self).context("Failed to serialize config")?;
        merge_json(&mut doc, patch);

        let patched: AgentConfig =
            serde_json::from_value(doc).context("Settings patch produced an invalid config")?;
        patched.validate().context("Settings patch produced an invalid config")?;

        *self = patched;
        Ok(())
    }

    /// Inline policies followed by those in `policies_file`
    pub fn all_policies(&self) -> Result<Vec<PolicySpec>> {
        let mut policies = self.policies.clone();

        if let Some(path) = &self.policies_file {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read policies file: {}", path.display()))?;
            let extra: Vec<PolicySpec> = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse policies file: {}", path.display()))?;
            policies.extend(extra);
        }

        Ok(policies)
    }

    /// Device context location
    pub fn context_path(&self) -> Result<PathBuf> {
        match &self.agent.context_path {
            Some(path) => Ok(path.clone()),
            None => crate::state::get_context_path(),
        }
    }

    /// Pid file location
    pub fn pid_path(&self) -> Result<PathBuf> {
        match &self.agent.pid_file {
            Some(path) => Ok(path.clone()),
            None => Ok(self.context_path()?.with_file_name("fieldsync.pid")),
        }
    }
}

/// Recursively merge `patch` into `target`; non-object values replace
fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Get the platform-specific agent config file path
pub fn get_agent_config_path() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/fieldsync/agent.toml"))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(PathBuf::from("/Library/Application Support/fieldsync/agent.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push("fieldsync");
        path.push("agent.toml");
        Ok(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        anyhow::bail!("Unsupported operating system");
    }
}
