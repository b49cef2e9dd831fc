use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::agent::{self, AgentConfig, HeartbeatScheduler};
use crate::state::DeviceContext;

use super::utils::{format_duration, init_logging, mask_secret};

/// Load the agent configuration from `path` or the platform default
fn load_config(path: Option<PathBuf>) -> Result<(AgentConfig, PathBuf)> {
    let path = match path {
        Some(path) => path,
        None => agent::get_agent_config_path()?,
    };
    let config = AgentConfig::load(&path).with_context(|| {
        format!(
            "Failed to load agent configuration from {}",
            path.display()
        )
    })?;
    Ok((config, path))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Run the agent in the foreground until it exits
pub fn run(config_path: Option<PathBuf>, verbose: bool) -> Result<i32> {
    let (config, path) = load_config(config_path)?;
    init_logging(verbose, &config.logging.level);
    tracing::info!(config = %path.display(), "Configuration loaded");

    runtime()?.block_on(agent::run_agent_daemon(config, Some(path)))
}

/// Phone home once and reconcile
pub fn check_now(config_path: Option<PathBuf>, verbose: bool) -> Result<i32> {
    let (config, path) = load_config(config_path)?;
    init_logging(verbose, &config.logging.level);

    println!("Contacting management service...");
    let exit = runtime()?.block_on(agent::check_now(config.clone(), Some(path)))?;

    let ctx = DeviceContext::load(&config.context_path()?);
    println!("✓ Check complete (state: {})", ctx.state.as_str());

    Ok(exit.unwrap_or(0))
}

/// Signal the running agent
pub fn wake(config_path: Option<PathBuf>) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let pid_path = config.pid_path()?;

    let pid = agent::send_wake(&pid_path).context("Is the agent running?")?;
    println!("✓ Woke agent (pid {})", pid);
    Ok(())
}

/// Show device state and identity
pub fn status(config_path: Option<PathBuf>) -> Result<()> {
    let (config, path) = load_config(config_path)?;
    let context_path = config.context_path()?;
    let ctx = DeviceContext::load(&context_path);

    println!("Field Sync Agent Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Config:        {}", path.display());
    println!("Host:          {}", config.host.kind.as_str());
    if let Some(url) = &config.host.url {
        println!("Service URL:   {}", url);
    }
    println!("State:         {}", ctx.state.as_str());
    if let Some(error) = &ctx.error {
        println!("Error:         {}", error);
    }

    println!();
    println!("Identity:");
    match &ctx.thing_token {
        Some(token) => println!("  Thing:       {}", mask_secret(token)),
        None => println!("  Thing:       (not registered)"),
    }
    if let Some(token) = &ctx.collection_token {
        println!("  Collection:  {}", mask_secret(token));
    }
    if let Some(token) = &ctx.account_token {
        println!("  Account:     {}", mask_secret(token));
    }
    if let Some(id) = &ctx.last_mailbox_id {
        println!("  Last command: {}", id);
    }

    if let Ok(metadata) = std::fs::metadata(&context_path)
        && let Ok(modified) = metadata.modified()
    {
        let modified: chrono::DateTime<chrono::Utc> = modified.into();
        println!();
        println!(
            "Last contact:  {} ({} ago)",
            modified.format("%Y-%m-%d %H:%M:%S %Z"),
            format_duration(chrono::Utc::now() - modified)
        );
    }

    let policies = config.all_policies().map(|p| p.len()).unwrap_or(0);
    println!("Policies:      {}", policies);

    let scheduler =
        HeartbeatScheduler::new(config.agent.heartbeat_interval, config.agent.heartbeat_jitter);
    println!(
        "Heartbeat:     every {}s (next ~{} if running)",
        scheduler.base_interval().as_secs(),
        scheduler.next_heartbeat_time().format("%Y-%m-%d %H:%M:%S %Z")
    );

    Ok(())
}

/// Print the effective configuration as TOML, secrets masked
pub fn show_config(config_path: Option<PathBuf>) -> Result<()> {
    let (config, path) = load_config(config_path)?;

    let rendered =
        toml::to_string_pretty(&config.redacted()).context("Failed to serialize config")?;
    println!("# {}", path.display());
    println!("{}", rendered);
    Ok(())
}
