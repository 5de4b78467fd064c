//! Platform seams: per-platform monitors and rollback controllers.

pub mod executor;
pub mod kubernetes;
pub mod stub;

use async_trait::async_trait;

use crate::error::Result;
use crate::hub::StatusStreamer;
use crate::models::{Deployment, DeploymentProgress, HealthCheck, RollbackCommand, RollbackInfo};

pub use executor::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use kubernetes::{KubernetesMonitor, KubernetesRollbackController};
pub use stub::{StubMonitor, StubRollbackController};

/// Live tracking of a deployment's resources on one platform.
#[async_trait]
pub trait DeploymentMonitor: Send + Sync {
    async fn start(&self, deployment: &Deployment) -> Result<()>;

    /// Observed view of the deployment. Status and progress reflect the
    /// platform; the caller decides which transitions to apply.
    async fn get_status(&self, deployment_id: &str) -> Result<Deployment>;

    async fn update_progress(&self, deployment_id: &str, progress: DeploymentProgress)
        -> Result<()>;

    async fn check_health(&self, deployment_id: &str) -> Result<Vec<HealthCheck>>;

    async fn stop(&self, deployment_id: &str) -> Result<()>;
}

/// Answer to "can this deployment be rolled back".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackEligibility {
    Eligible,
    Ineligible(String),
}

#[async_trait]
pub trait RollbackController: Send + Sync {
    /// `Ineligible` is a normal answer; `Err` means the check itself failed.
    async fn can_rollback(&self, deployment: &Deployment) -> Result<RollbackEligibility>;

    /// Commands sorted by ascending `order`, no duplicates.
    async fn generate_rollback_commands(
        &self,
        deployment: &Deployment,
        target_version: Option<&str>,
    ) -> Result<Vec<RollbackCommand>>;

    /// Plans the rollback and records it as in progress.
    async fn initiate_rollback(
        &self,
        deployment: &Deployment,
        reason: &str,
        target_version: Option<&str>,
        initiated_by: &str,
    ) -> Result<RollbackInfo>;

    /// Runs the planned commands and returns the finished record.
    async fn execute_rollback(
        &self,
        deployment: &Deployment,
        rollback: RollbackInfo,
        streamer: &StatusStreamer,
    ) -> Result<RollbackInfo>;

    async fn get_rollback_status(&self, deployment_id: &str) -> Result<RollbackInfo>;
}
