//! Placeholder monitor and rollback controller for container-runtime and
//! cloud platforms. They satisfy the contracts without touching any
//! platform: status is whatever was stored at start, health is unknown and
//! rollback is never applicable.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{DeployError, Result};
use crate::hub::StatusStreamer;
use crate::models::{
    Deployment, DeploymentProgress, HealthCheck, HealthCheckType, HealthStatus, PlatformKind,
    RollbackCommand, RollbackInfo,
};
use crate::platform::{DeploymentMonitor, RollbackController, RollbackEligibility};

fn kind_label(kind: PlatformKind) -> &'static str {
    match kind {
        PlatformKind::Cluster => "cluster",
        PlatformKind::ContainerRuntime => "container runtime",
        PlatformKind::Cloud => "cloud",
    }
}

pub struct StubMonitor {
    kind: PlatformKind,
    deployments: RwLock<HashMap<String, Deployment>>,
}

impl StubMonitor {
    pub fn new(kind: PlatformKind) -> Self {
        Self {
            kind,
            deployments: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DeploymentMonitor for StubMonitor {
    async fn start(&self, deployment: &Deployment) -> Result<()> {
        let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
        deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn get_status(&self, deployment_id: &str) -> Result<Deployment> {
        let deployments = self.deployments.read().unwrap_or_else(|e| e.into_inner());
        deployments
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| DeployError::not_found("monitored deployment", deployment_id))
    }

    async fn update_progress(
        &self,
        deployment_id: &str,
        progress: DeploymentProgress,
    ) -> Result<()> {
        let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
        let deployment = deployments
            .get_mut(deployment_id)
            .ok_or_else(|| DeployError::not_found("monitored deployment", deployment_id))?;
        deployment.progress = Some(progress);
        Ok(())
    }

    async fn check_health(&self, deployment_id: &str) -> Result<Vec<HealthCheck>> {
        let deployments = self.deployments.read().unwrap_or_else(|e| e.into_inner());
        let deployment = deployments
            .get(deployment_id)
            .ok_or_else(|| DeployError::not_found("monitored deployment", deployment_id))?;
        Ok(vec![HealthCheck::new(
            format!("{}-platform", deployment.name),
            HealthCheckType::Custom,
        )
        .with_status(
            HealthStatus::Unknown,
            format!("health checks are not implemented for {} platforms", kind_label(self.kind)),
        )
        .with_meta("platform", deployment.platform.as_str())])
    }

    async fn stop(&self, deployment_id: &str) -> Result<()> {
        let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
        deployments
            .remove(deployment_id)
            .map(|_| ())
            .ok_or_else(|| DeployError::not_found("monitored deployment", deployment_id))
    }
}

pub struct StubRollbackController {
    kind: PlatformKind,
}

impl StubRollbackController {
    pub fn new(kind: PlatformKind) -> Self {
        Self { kind }
    }

    fn unsupported(&self) -> String {
        format!("rollback is not supported for {} platforms", kind_label(self.kind))
    }
}

#[async_trait]
impl RollbackController for StubRollbackController {
    async fn can_rollback(&self, _deployment: &Deployment) -> Result<RollbackEligibility> {
        Ok(RollbackEligibility::Ineligible(self.unsupported()))
    }

    async fn generate_rollback_commands(
        &self,
        _deployment: &Deployment,
        _target_version: Option<&str>,
    ) -> Result<Vec<RollbackCommand>> {
        Ok(Vec::new())
    }

    async fn initiate_rollback(
        &self,
        _deployment: &Deployment,
        _reason: &str,
        _target_version: Option<&str>,
        _initiated_by: &str,
    ) -> Result<RollbackInfo> {
        Err(DeployError::RollbackNotApplicable(self.unsupported()))
    }

    async fn execute_rollback(
        &self,
        _deployment: &Deployment,
        _rollback: RollbackInfo,
        _streamer: &StatusStreamer,
    ) -> Result<RollbackInfo> {
        Err(DeployError::RollbackNotApplicable(self.unsupported()))
    }

    async fn get_rollback_status(&self, deployment_id: &str) -> Result<RollbackInfo> {
        Err(DeployError::not_found("rollback for deployment", deployment_id))
    }
}
