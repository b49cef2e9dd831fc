// Agent module
//
// The orchestrator owns the device cycle: it phones home through the
// configured host, applies settings and credentials pushed back by the
// management service, runs directed actions and reconciles policies.

mod actions;
mod config;
mod daemon;
mod scheduler;

pub use actions::{DirectedAction, fetch_customizers, run_configured};
pub use config::{
    ActionsConfig, AgentConfig, AgentSettings, HostConfig, HostKind, LoggingConfig,
    ObjectStoreConfig, QueueConfig, get_agent_config_path,
};
pub use daemon::{CycleOutcome, Orchestrator, Signal, check_now, run_agent_daemon, send_wake};
pub use scheduler::HeartbeatScheduler;
