use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::Instant;

use super::actions::{DirectedAction, fetch_customizers, run_configured};
use super::{AgentConfig, HeartbeatScheduler};
use crate::host::{Host, build_host};
use crate::platform::command::{CommandRunner, ShellRunner};
use crate::platform::common::atomic_write;
use crate::platform::facts::{brief_facts, full_facts};
use crate::policy::{PolicyDefaults, PolicyEngine};
use crate::state::{DeviceContext, DeviceState};
use crate::storage::{ObjectStore, build_object_store};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound on chained cycles for a single check-now invocation
const MAX_REENTRIES: usize = 4;

/// What starts a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Startup,
    /// Phone home with the given action tag ("heartbeat", "watchdog", ...)
    PhoneHome(String),
    /// Operator wake-up; clears handler memory first
    Wake,
}

/// What the loop does after a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Reschedule,
    Reenter(Signal),
    Exit(i32),
}

/// Next step inside a cycle. Directed actions and acknowledgments can chain.
enum Step {
    Done(CycleOutcome),
    Perform(DirectedAction, DeviceContext),
    Acknowledge {
        ctx: DeviceContext,
        tag: String,
        result: Option<Value>,
    },
}

/// Result of one host contact after out-of-band fields were applied
struct Exchange {
    ctx: DeviceContext,
    action: Option<String>,
    patched: bool,
}

/// Single-threaded owner of the device cycle: host contact, settings,
/// directed actions and policy reconciliation.
pub struct Orchestrator {
    config: AgentConfig,
    config_path: Option<PathBuf>,
    context_path: PathBuf,
    host: Option<Box<dyn Host>>,
    engine: PolicyEngine,
    store: Option<Arc<dyn ObjectStore>>,
    store_ready_at: Option<Instant>,
    scheduler: HeartbeatScheduler,
    runner: Arc<dyn CommandRunner>,
    signals_tx: UnboundedSender<Signal>,
    signals_rx: UnboundedReceiver<Signal>,
}

impl Orchestrator {
    pub fn new(config: AgentConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let context_path = config.context_path()?;
        let (signals_tx, signals_rx) = unbounded_channel();
        let scheduler =
            HeartbeatScheduler::new(config.agent.heartbeat_interval, config.agent.heartbeat_jitter);
        let engine = PolicyEngine::new(config.queue.clone());

        let mut orchestrator = Self {
            config,
            config_path,
            context_path,
            host: None,
            engine,
            store: None,
            store_ready_at: None,
            scheduler,
            runner: Arc::new(ShellRunner::default()),
            signals_tx,
            signals_rx,
        };
        orchestrator.load_policies();
        Ok(orchestrator)
    }

    /// Use this host instead of the one the configuration describes
    pub fn set_host(&mut self, host: Box<dyn Host>) {
        self.host = Some(host);
    }

    pub fn set_runner(&mut self, runner: Arc<dyn CommandRunner>) {
        self.runner = runner;
    }

    /// Sender for waking the loop from other tasks
    pub fn signals(&self) -> UnboundedSender<Signal> {
        self.signals_tx.clone()
    }

    pub fn context_path(&self) -> &Path {
        &self.context_path
    }

    /// Serve cycles until an exit is requested; returns the exit code
    pub async fn run(&mut self) -> Result<i32> {
        tracing::info!(
            version = VERSION,
            host = self.config.host.kind.as_str(),
            interval = self.config.agent.heartbeat_interval,
            jitter = self.config.agent.heartbeat_jitter,
            "Agent starting"
        );
        self.write_pid_file();
        self.install_wake_listener();

        let mut next = Some(Signal::Startup);
        let mut deadline: Option<Instant> = None;

        loop {
            let signal = match next.take() {
                Some(signal) => signal,
                None => tokio::select! {
                    received = self.signals_rx.recv() => match received {
                        Some(signal) => signal,
                        None => return Ok(0),
                    },
                    _ = wait_until(deadline) => Signal::PhoneHome("heartbeat".to_string()),
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Interrupted; shutting down");
                        self.remove_pid_file();
                        return Ok(0);
                    }
                },
            };

            // A cycle replaces whatever was scheduled before it
            deadline = None;

            match self.cycle(signal).await {
                CycleOutcome::Reschedule => {
                    let (at, wall) = self.scheduler.next_deadline();
                    deadline = Some(at);
                    tracing::debug!("Next heartbeat at: {}", wall.format("%Y-%m-%d %H:%M:%S %Z"));
                }
                CycleOutcome::Reenter(signal) => next = Some(signal),
                CycleOutcome::Exit(code) => {
                    tracing::info!(code, "Agent exiting");
                    self.remove_pid_file();
                    return Ok(code);
                }
            }
        }
    }

    /// Run cycles for one signal without scheduling a heartbeat.
    ///
    /// Returns the exit code if a directed action asked the agent to exit.
    pub async fn run_once(&mut self, signal: Signal) -> Option<i32> {
        let mut signal = signal;
        for _ in 0..MAX_REENTRIES {
            match self.cycle(signal).await {
                CycleOutcome::Reschedule => return None,
                CycleOutcome::Reenter(next) => signal = next,
                CycleOutcome::Exit(code) => return Some(code),
            }
        }
        tracing::warn!("Giving up after {} chained cycles", MAX_REENTRIES);
        None
    }

    /// One complete cycle
    pub async fn cycle(&mut self, signal: Signal) -> CycleOutcome {
        let mut ctx = DeviceContext::load(&self.context_path);

        let registration_outstanding = match self.host() {
            Ok(host) => host.registration_required(&ctx),
            Err(e) => {
                tracing::error!("{:#}", e);
                return CycleOutcome::Reschedule;
            }
        };

        let action = match &signal {
            Signal::Startup if registration_outstanding => "register".to_string(),
            Signal::Startup => "startup".to_string(),
            Signal::PhoneHome(action) => action.clone(),
            Signal::Wake => {
                tracing::info!("Wake requested; clearing handler memory");
                self.engine.reset_all();
                "wakeup".to_string()
            }
        };

        tracing::info!(action = %action, state = %ctx.state.as_str(), "Cycle starting");
        stamp(&mut ctx, &action, signal == Signal::Startup);

        let state_before = ctx.state;
        let short_circuit = action == "heartbeat" && ctx.state == DeviceState::Configured;
        if short_circuit {
            ctx.result = Some(self.reconcile().await);
        }

        let exchange = match self.exchange(ctx).await {
            Ok(exchange) => exchange,
            Err(e) => {
                tracing::error!(action = %action, "{:#}", e);
                return CycleOutcome::Reschedule;
            }
        };

        if registration_outstanding {
            tracing::info!("Registration complete; starting over");
            return CycleOutcome::Reenter(Signal::Startup);
        }

        let mut step = match exchange.action {
            Some(name) => Step::Perform(DirectedAction::parse(&name), exchange.ctx),
            None if !short_circuit || exchange.patched || exchange.ctx.state != state_before => {
                Step::Acknowledge {
                    ctx: exchange.ctx,
                    tag: format!("ack+{}", action),
                    result: None,
                }
            }
            None => Step::Done(CycleOutcome::Reschedule),
        };

        loop {
            step = match step {
                Step::Done(outcome) => return outcome,
                Step::Perform(action, ctx) => self.perform(action, ctx).await,
                Step::Acknowledge { ctx, tag, result } => {
                    self.acknowledge(ctx, &tag, result).await
                }
            };
        }
    }

    /// Contact the host again to report the outcome of what was just done.
    ///
    /// Without an explicit result a configured device reconciles first.
    async fn acknowledge(
        &mut self,
        mut ctx: DeviceContext,
        tag: &str,
        result: Option<Value>,
    ) -> Step {
        stamp(&mut ctx, tag, false);
        ctx.result = match result {
            Some(result) => Some(result),
            None if ctx.state == DeviceState::Configured => Some(self.reconcile().await),
            None => None,
        };

        match self.exchange(ctx).await {
            Ok(Exchange {
                ctx,
                action: Some(name),
                ..
            }) => Step::Perform(DirectedAction::parse(&name), ctx),
            Ok(_) => Step::Done(CycleOutcome::Reschedule),
            Err(e) => {
                tracing::error!(action = tag, "{:#}", e);
                Step::Done(CycleOutcome::Reschedule)
            }
        }
    }

    async fn perform(&mut self, action: DirectedAction, ctx: DeviceContext) -> Step {
        tracing::info!(action = action.name(), "Directed action received");

        match &action {
            DirectedAction::Report => {
                let settings = serde_json::to_value(self.config.redacted()).unwrap_or(Value::Null);
                Step::Acknowledge {
                    ctx,
                    tag: action.ack_tag(),
                    result: Some(settings),
                }
            }
            DirectedAction::Customizers => match self.install_customizers().await {
                Ok(count) => {
                    tracing::info!(count, "Customizers installed");
                    Step::Acknowledge {
                        ctx,
                        tag: action.ack_tag(),
                        result: None,
                    }
                }
                Err(e) => failed(&action, ctx, e),
            },
            DirectedAction::Upgrade => {
                let command = self.config.actions.upgrade_command.clone();
                match run_configured(self.runner.as_ref(), "upgrade", command.as_deref()).await {
                    Ok(_) => {
                        tracing::info!("Upgrade installed; exiting for restart");
                        Step::Done(CycleOutcome::Exit(0))
                    }
                    Err(e) => failed(&action, ctx, e),
                }
            }
            DirectedAction::Reboot => {
                let command = self.config.actions.reboot_command.clone();
                match run_configured(self.runner.as_ref(), "reboot", Some(&command)).await {
                    Ok(_) => Step::Acknowledge {
                        ctx,
                        tag: action.ack_tag(),
                        result: Some(json!({ "rebooting": true })),
                    },
                    Err(e) => failed(&action, ctx, e),
                }
            }
            DirectedAction::Restart => {
                tracing::info!("Restart requested; exiting");
                Step::Done(CycleOutcome::Exit(0))
            }
            DirectedAction::Unknown(name) => {
                let error = anyhow::anyhow!("Unknown action: {}", name);
                failed(&action, ctx, error)
            }
        }
    }

    /// Contact the host, persist the returned context and act on its
    /// out-of-band fields
    async fn exchange(&mut self, ctx: DeviceContext) -> Result<Exchange> {
        let host = self.host()?;
        let mut ctx = host.contact(ctx).await.context("Host contact failed")?;

        let out_of_band = ctx.take_out_of_band();
        if let Err(e) = ctx.save(&self.context_path) {
            tracing::error!("Failed to persist device context: {:#}", e);
        }

        if let Some(credentials) = out_of_band.credentials {
            self.rotate_credentials(credentials);
        }

        let patched = match out_of_band.config {
            Some(patch) => self.apply_settings(&patch),
            None => false,
        };

        Ok(Exchange {
            ctx,
            action: out_of_band.action,
            patched,
        })
    }

    fn host(&mut self) -> Result<&mut Box<dyn Host>> {
        if self.host.is_none() {
            let host = build_host(&self.config, self.signals_tx.clone())
                .context("Failed to set up host")?;
            tracing::info!(kind = self.config.host.kind.as_str(), "Host ready");
            self.host = Some(host);
        }
        self.host
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Host unavailable"))
    }

    fn rotate_credentials(&mut self, credentials: Value) {
        tracing::info!("Object store credentials rotated");
        self.config.object_store.credentials = Some(credentials);
        self.store = None;
        self.store_ready_at =
            Some(Instant::now() + Duration::from_secs(self.config.agent.credential_cooldown));
        self.save_config();
    }

    /// Merge a settings patch; returns whether it was applied
    fn apply_settings(&mut self, patch: &Value) -> bool {
        let host_before = serde_json::to_value((&self.config.host, &self.config.agent)).ok();

        if let Err(e) = self.config.apply_patch(patch) {
            tracing::error!("Rejected settings patch: {:#}", e);
            return false;
        }
        tracing::info!("Settings patch applied");
        self.save_config();

        self.scheduler = HeartbeatScheduler::new(
            self.config.agent.heartbeat_interval,
            self.config.agent.heartbeat_jitter,
        );
        self.store = None;
        self.engine.set_queue_config(self.config.queue.clone());
        self.load_policies();

        let host_after = serde_json::to_value((&self.config.host, &self.config.agent)).ok();
        if host_before != host_after && self.host.is_some() {
            tracing::info!("Host settings changed; reconnecting on next contact");
            self.host = None;
        }
        true
    }

    fn save_config(&self) {
        if let Some(path) = &self.config_path
            && let Err(e) = self.config.save(path)
        {
            tracing::error!("Failed to save configuration: {:#}", e);
        }
    }

    fn load_policies(&mut self) {
        let specs = match self.config.all_policies() {
            Ok(specs) => specs,
            Err(e) => {
                tracing::error!("Failed to load policies: {:#}", e);
                Vec::new()
            }
        };
        let defaults = PolicyDefaults {
            bucket: self.config.object_store.bucket.clone(),
            pop_timeout: Duration::from_secs(self.config.queue.pop_timeout),
        };
        if self.engine.load(&specs, &defaults) {
            tracing::info!(count = self.engine.policies().len(), "Policies loaded");
        }
    }

    /// The object store client, rebuilt lazily. Waits out the cooldown
    /// after a credential rotation.
    async fn object_store(&mut self) -> Result<Arc<dyn ObjectStore>> {
        if let Some(ready_at) = self.store_ready_at.take() {
            let now = Instant::now();
            if ready_at > now {
                tracing::info!("Waiting {:?} for new credentials to settle", ready_at - now);
                tokio::time::sleep_until(ready_at).await;
            }
        }

        if let Some(store) = &self.store {
            return Ok(store.clone());
        }
        let store = build_object_store(&self.config.object_store)?;
        self.store = Some(store.clone());
        Ok(store)
    }

    /// Run every policy; the result is reported to the host
    async fn reconcile(&mut self) -> Value {
        if self.engine.policies().is_empty() {
            tracing::debug!("No policies configured");
            return json!({});
        }

        match self.object_store().await {
            Ok(store) => self.engine.run(store).await,
            Err(e) => {
                tracing::error!("Object store unavailable: {:#}", e);
                json!({ "error": format!("{:#}", e) })
            }
        }
    }

    async fn install_customizers(&mut self) -> Result<usize> {
        let directory = self
            .config
            .actions
            .customizers_dir
            .clone()
            .ok_or_else(|| anyhow::anyhow!("actions.customizers_dir is not set"))?;
        let bucket = self
            .config
            .object_store
            .bucket
            .clone()
            .ok_or_else(|| anyhow::anyhow!("object_store.bucket is not set"))?;
        let prefix = self.config.actions.customizers_prefix.clone();

        let store = self.object_store().await?;
        fetch_customizers(store.as_ref(), &bucket, &prefix, &directory).await
    }

    fn write_pid_file(&self) {
        let result = self
            .config
            .pid_path()
            .and_then(|path| atomic_write(&path, std::process::id().to_string().as_bytes()));
        if let Err(e) = result {
            tracing::warn!("Failed to write pid file: {:#}", e);
        }
    }

    fn remove_pid_file(&self) {
        if let Ok(path) = self.config.pid_path() {
            let _ = std::fs::remove_file(path);
        }
    }

    fn install_wake_listener(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let sender = self.signals_tx.clone();
            match signal(SignalKind::user_defined1()) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        while stream.recv().await.is_some() {
                            tracing::info!("Wake signal received");
                            if sender.send(Signal::Wake).is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(e) => tracing::warn!("Wake signal unavailable: {}", e),
            }
        }
    }
}

fn stamp(ctx: &mut DeviceContext, action: &str, full_info: bool) {
    ctx.version = Some(VERSION.to_string());
    ctx.action = Some(action.to_string());
    ctx.info = Some(if full_info { full_facts() } else { brief_facts() });
}

fn failed(action: &DirectedAction, ctx: DeviceContext, error: anyhow::Error) -> Step {
    tracing::error!(action = action.name(), "Directed action failed: {:#}", error);
    Step::Acknowledge {
        ctx,
        tag: action.error_tag(),
        result: Some(json!({ "error": format!("{:#}", error) })),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Run the agent until it exits; returns the process exit code
pub async fn run_agent_daemon(config: AgentConfig, config_path: Option<PathBuf>) -> Result<i32> {
    let mut orchestrator = Orchestrator::new(config, config_path)?;
    orchestrator.run().await
}

/// Run a single check-now cycle chain
pub async fn check_now(config: AgentConfig, config_path: Option<PathBuf>) -> Result<Option<i32>> {
    let mut orchestrator = Orchestrator::new(config, config_path)?;
    Ok(orchestrator.run_once(Signal::PhoneHome("check".to_string())).await)
}

/// Ask a running agent to wake up; returns its pid
#[cfg(unix)]
pub fn send_wake(pid_path: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read pid file: {}", pid_path.display()))?;
    let pid: i32 = content
        .trim()
        .parse()
        .with_context(|| format!("Invalid pid file: {}", pid_path.display()))?;

    // SAFETY: kill(2) takes plain integers and has no memory preconditions
    let rc = unsafe { libc::kill(pid, libc::SIGUSR1) };
    if rc != 0 {
        anyhow::bail!(
            "Failed to signal agent (pid {}): {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
    Ok(pid)
}

#[cfg(not(unix))]
pub fn send_wake(_pid_path: &Path) -> Result<i32> {
    anyhow::bail!("Waking the agent is only supported on Unix");
}
