//! Post-apply notification command.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use keymirror_core::Config;

use crate::error::HookError;

/// A command run after every applied diff, retried on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHook {
    argv: Vec<String>,
    retries: u64,
    retry_interval: Duration,
}

impl CommandHook {
    pub fn new(argv: Vec<String>, retries: u64, retry_interval: Duration) -> Self {
        Self {
            argv,
            retries,
            retry_interval,
        }
    }

    /// `None` when no command is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        if config.notification_command.is_empty() {
            return None;
        }
        Some(Self::new(
            config.notification_command.clone(),
            config.notification_command_retries,
            config.notification_command_retry_interval(),
        ))
    }

    /// Run the command until it succeeds or the retries are spent.
    pub async fn run(&self) -> Result<(), HookError> {
        let mut attempt = 0;
        loop {
            match self.run_once().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(attempt, retries = self.retries, error = %err, "notification command failed, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_once(&self) -> Result<(), HookError> {
        let (program, args) = self.argv.split_first().ok_or(HookError::Empty)?;
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| HookError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(HookError::Failed {
                program: program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim_end();
        if !stdout.is_empty() {
            tracing::info!(program = %program, "{stdout}");
        }
        Ok(())
    }
}
