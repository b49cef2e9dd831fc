//! External command execution for directed actions (upgrade, reboot)

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Output of a completed command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs shell commands on behalf of the orchestrator
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> anyhow::Result<CommandOutput>;
}

/// Runs commands through `sh -c`
#[derive(Debug, Clone)]
pub struct ShellRunner {
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> anyhow::Result<CommandOutput> {
        tracing::debug!(command = %command, "executing command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn '{}': {}", command, e))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| anyhow::anyhow!("Failed to wait for '{}': {}", command, e))?,
            Err(_) => anyhow::bail!("Command '{}' timed out after {:?}", command, self.timeout),
        };

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if !result.success() {
            tracing::error!(
                command = %command,
                status = result.status,
                stderr = %result.stderr.trim(),
                "command failed"
            );
        }

        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let runner = ShellRunner::default();
        let output = runner.run("echo ok").await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let runner = ShellRunner::default();
        let output = runner.run("exit 3").await.unwrap();
        assert_eq!(output.status, 3);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn times_out() {
        let runner = ShellRunner::new(Duration::from_millis(50));
        assert!(runner.run("sleep 5").await.is_err());
    }
}
