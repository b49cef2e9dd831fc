// Policy engine
//
// Policies reconcile local files against the object store. Each handler kind
// has exactly one live instance, memoized by the engine, so its memory of
// what it already synchronized survives from one reconciliation to the next.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::QueueConfig;
use crate::storage::ObjectStore;

pub mod download;
pub mod relay;
pub mod spec;
pub mod transform;
pub mod upload;

pub use download::DownloadHandler;
pub use relay::RelayHandler;
pub use spec::{CompiledPolicy, PolicyDefaults, PolicySettings, PolicySpec, compile_all, fingerprint};
pub use transform::KeyTransform;
pub use upload::UploadHandler;

/// Outcome counters of one policy run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyReport {
    pub added: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub ignored: u64,
    pub deleted: u64,
    pub moved: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl PolicyReport {
    /// Count a per-item failure and keep its description
    pub fn fail(&mut self, error: String) {
        tracing::warn!("{}", error);
        self.failed += 1;
        self.errors.push(error);
    }
}

#[async_trait]
pub trait PolicyHandler: Send {
    /// Forget everything remembered from earlier runs
    fn reset(&mut self);

    async fn apply(
        &mut self,
        policy: &CompiledPolicy,
        store: Arc<dyn ObjectStore>,
    ) -> Result<PolicyReport>;
}

/// Handler for kinds nobody implements
#[derive(Debug, Default)]
pub struct NoopHandler;

#[async_trait]
impl PolicyHandler for NoopHandler {
    fn reset(&mut self) {}

    async fn apply(
        &mut self,
        policy: &CompiledPolicy,
        _store: Arc<dyn ObjectStore>,
    ) -> Result<PolicyReport> {
        tracing::warn!(
            policy = policy.name(),
            kind = %policy.settings.kind,
            "No handler for policy kind; nothing to do"
        );
        Ok(PolicyReport {
            status: Some(format!("no handler for '{}'", policy.settings.kind)),
            ..PolicyReport::default()
        })
    }
}

/// Registry of handlers plus the compiled policy list
pub struct PolicyEngine {
    handlers: HashMap<String, Box<dyn PolicyHandler>>,
    queue_config: QueueConfig,
    policies: Vec<CompiledPolicy>,
    fingerprint: Option<String>,
}

impl PolicyEngine {
    pub fn new(queue_config: QueueConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            queue_config,
            policies: Vec::new(),
            fingerprint: None,
        }
    }

    /// Install a handler instance for a kind, replacing any memoized one
    pub fn register(&mut self, kind: &str, handler: Box<dyn PolicyHandler>) {
        self.handlers.insert(kind.to_string(), handler);
    }

    /// Replace the policy list. Handler memory is cleared when the list changed.
    ///
    /// Returns whether the fingerprint changed.
    pub fn load(&mut self, specs: &[PolicySpec], defaults: &PolicyDefaults) -> bool {
        let new_fingerprint = fingerprint(specs);
        let changed = self.fingerprint.as_deref() != Some(new_fingerprint.as_str());

        if changed {
            if self.fingerprint.is_some() {
                tracing::info!("Policy list changed; resetting handlers");
                self.reset_all();
            }
            self.fingerprint = Some(new_fingerprint);
        }

        self.policies = compile_all(specs, defaults);
        tracing::debug!(count = self.policies.len(), "Policies compiled");
        changed
    }

    /// Swap the queue settings. Memoized handlers are dropped when they
    /// differ, which stops running relays so they reconnect on next use.
    pub fn set_queue_config(&mut self, queue_config: QueueConfig) {
        if queue_config != self.queue_config {
            tracing::info!("Queue settings changed; dropping handlers");
            self.handlers.clear();
            self.queue_config = queue_config;
        }
    }

    pub fn policies(&self) -> &[CompiledPolicy] {
        &self.policies
    }

    pub fn reset_all(&mut self) {
        for handler in self.handlers.values_mut() {
            handler.reset();
        }
    }

    fn handler_for(&mut self, kind: &str) -> &mut Box<dyn PolicyHandler> {
        let queue_config = &self.queue_config;
        self.handlers
            .entry(kind.to_string())
            .or_insert_with(|| -> Box<dyn PolicyHandler> {
                match kind {
                    "upload" => Box::new(UploadHandler::new()),
                    "download" => Box::new(DownloadHandler::new()),
                    "relay" => Box::new(RelayHandler::new(queue_config.clone())),
                    _ => Box::new(NoopHandler),
                }
            })
    }

    /// Run every policy in order; the result maps policy name to its report
    pub async fn run(&mut self, store: Arc<dyn ObjectStore>) -> Value {
        let policies = self.policies.clone();
        let mut results = Map::new();

        for policy in &policies {
            let handler = self.handler_for(&policy.settings.kind);
            tracing::info!(policy = policy.name(), kind = %policy.settings.kind, "Running policy");

            let entry = match handler.apply(policy, store.clone()).await {
                Ok(report) => serde_json::to_value(&report).unwrap_or(Value::Null),
                Err(e) => {
                    tracing::error!(policy = policy.name(), "Policy failed: {:#}", e);
                    json!({ "error": format!("{:#}", e) })
                }
            };
            results.insert(policy.name().to_string(), entry);
        }

        Value::Object(results)
    }
}
