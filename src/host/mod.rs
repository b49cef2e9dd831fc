// Host protocol
//
// A host is the device's link to the management service. Each contact sends
// the folded status of the device and may bring back identity tokens, a
// settings patch, credentials or a directed action inside the returned
// context.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::agent::{AgentConfig, HostKind, Signal};
use crate::state::{DeviceContext, DeviceState};

pub mod basic;
pub mod broker;
pub mod http;
pub mod mqtt;
pub mod pubsub;

pub use basic::BasicHost;
pub use broker::{Broker, BrokerConnector, BrokerEvent, Session};
pub use http::HttpHost;
pub use mqtt::{MqttBroker, MqttConnector};
pub use pubsub::{Backoff, PubSubHost};

/// Registration endpoint, relative to the service base URL
pub const REGISTER_PATH: &str = "1/register";

/// Topic (and HTTP path) carrying device status
pub fn status_path(thing: &str) -> String {
    format!("/1/l/{}", thing)
}

/// Topic (and HTTP path) carrying mailbox commands
pub fn mailbox_path(thing: &str) -> String {
    format!("/1/m/{}", thing)
}

/// Command acknowledgment path
pub fn ack_path(thing: &str) -> String {
    format!("/1/a/{}", thing)
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected status {status} from {endpoint}")]
    Status { status: u16, endpoint: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Broker error: {0}")]
    Broker(String),
}

impl From<reqwest::Error> for HostError {
    fn from(e: reqwest::Error) -> Self {
        HostError::Transport(e.to_string())
    }
}

#[async_trait]
pub trait Host: Send {
    /// Whether the next contact has to register the device first
    fn registration_required(&self, ctx: &DeviceContext) -> bool;

    /// One exchange with the management service
    async fn contact(&mut self, ctx: DeviceContext) -> Result<DeviceContext, HostError>;
}

/// Outbound status record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub state: DeviceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub action_id: Uuid,
    pub state_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

impl Message {
    /// Fold the reportable fields of a context into one message and clear
    /// the transient ones. `state` stays on the context.
    pub fn fold(ctx: &mut DeviceContext) -> Self {
        Self {
            state: ctx.state,
            action: ctx.action.take(),
            version: ctx.version.take(),
            action_id: Uuid::new_v4(),
            state_id: Uuid::new_v4(),
            result: ctx.result.take(),
            info: ctx.info.take(),
        }
    }
}

/// Inbound mailbox command
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MailboxMessage {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

fn id_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "mailbox id must be a string or number, got {}",
            other
        ))),
    }
}

/// What applying a mailbox command did to the context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxOutcome {
    Merged,
    Duplicate,
    Rejected(String),
}

impl MailboxOutcome {
    pub fn ack_status(&self) -> &'static str {
        match self {
            MailboxOutcome::Merged | MailboxOutcome::Duplicate => "success",
            MailboxOutcome::Rejected(_) => "failure",
        }
    }
}

/// Merge a mailbox payload into the context unless it was seen before
pub fn apply_mailbox(ctx: &mut DeviceContext, message: &MailboxMessage) -> MailboxOutcome {
    if ctx.last_mailbox_id.as_deref() == Some(message.id.as_str()) {
        tracing::debug!(id = %message.id, "Mailbox command already applied");
        return MailboxOutcome::Duplicate;
    }

    let patch = match payload_object(&message.payload) {
        Ok(patch) => patch,
        Err(reason) => {
            tracing::warn!(id = %message.id, "Rejecting mailbox command: {}", reason);
            return MailboxOutcome::Rejected(reason);
        }
    };

    if let Err(e) = ctx.merge(&patch) {
        tracing::warn!(id = %message.id, "Rejecting mailbox command: {:#}", e);
        return MailboxOutcome::Rejected(format!("{:#}", e));
    }

    ctx.last_mailbox_id = Some(message.id.clone());
    tracing::info!(id = %message.id, keys = patch.len(), "Mailbox command merged");
    MailboxOutcome::Merged
}

/// The payload as a JSON object; JSON text holding an object is accepted too
fn payload_object(payload: &Value) -> Result<Map<String, Value>, String> {
    match payload {
        Value::Object(map) => Ok(map.clone()),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err("payload is not a JSON object".to_string()),
            Err(e) => Err(format!("payload is not valid JSON: {}", e)),
        },
        _ => Err("payload is not a JSON object".to_string()),
    }
}

/// Build the host selected by the configuration
pub fn build_host(
    config: &AgentConfig,
    signals: UnboundedSender<Signal>,
) -> anyhow::Result<Box<dyn Host>> {
    match config.host.kind {
        HostKind::Basic => Ok(Box::new(BasicHost::new())),
        HostKind::Http => Ok(Box::new(HttpHost::new(&config.host)?)),
        HostKind::Pubsub => {
            let http = HttpHost::new(&config.host)?;
            let broker_url = config
                .host
                .broker_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("host.broker_url is required for the pubsub host"))?;
            let connector =
                MqttConnector::new(&broker_url, config.host.broker_password.clone())?;
            Ok(Box::new(PubSubHost::new(
                http,
                Arc::new(connector),
                &config.agent,
                signals,
            )))
        }
    }
}
