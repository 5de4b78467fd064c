use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{DeployError, Result};
use crate::hub::StatusStreamer;
use crate::models::RollbackCommand;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs one rollback step. Non-zero exits and timeouts are errors.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &RollbackCommand) -> Result<CommandOutput>;
}

/// Spawns the step's program with its argument list. No shell is involved,
/// so arguments are never expanded or split.
#[derive(Debug, Clone, Default)]
pub struct ProcessCommandRunner;

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, command: &RollbackCommand) -> Result<CommandOutput> {
        let shown = &command.command;
        let timeout = command.timeout;
        debug!("Running `{}` (timeout {:?})", shown, timeout);
        let child = Command::new(&command.program)
            .args(&command.args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| {
                DeployError::Command(format!("`{}` timed out after {:?}", shown, timeout))
            })?
            .map_err(|e| DeployError::Command(format!("`{}` could not start: {}", shown, e)))?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !output.status.success() {
            return Err(DeployError::Command(format!(
                "`{}` exited with {:?}: {}",
                shown,
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(result)
    }
}

/// Executes commands in ascending order, stopping at the first failure.
/// Each step is announced as a log update for the deployment.
pub async fn run_in_order(
    runner: &dyn CommandRunner,
    deployment_id: &str,
    commands: &[RollbackCommand],
    streamer: &StatusStreamer,
) -> Result<()> {
    let mut ordered: Vec<&RollbackCommand> = commands.iter().collect();
    ordered.sort_by_key(|c| c.order);

    for command in ordered {
        info!(deployment = %deployment_id, order = command.order, "{}", command.description);
        streamer
            .stream_log(
                deployment_id,
                "info",
                &format!("Step {}: {}", command.order, command.description),
            )
            .await;

        if let Err(e) = runner.run(command).await {
            streamer
                .stream_log(deployment_id, "error", &e.to_string())
                .await;
            return Err(e);
        }
    }
    Ok(())
}
