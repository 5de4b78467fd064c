use serde_json::json;
use tracing::warn;

use super::HubHandle;
use crate::models::{Deployment, DeploymentProgress, HealthCheck, StatusUpdate, UpdateType};

/// Typed helpers for publishing deployment updates. Publishing is
/// best-effort; a stopped hub is logged and ignored.
#[derive(Clone)]
pub struct StatusStreamer {
    hub: HubHandle,
}

impl StatusStreamer {
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }

    pub async fn stream_status(&self, deployment: &Deployment) {
        self.publish(StatusUpdate::for_deployment(
            &deployment.id,
            UpdateType::Status,
            json!({
                "status": deployment.status,
                "name": deployment.name,
                "version": deployment.version,
                "environment": deployment.environment,
                "error": deployment.error,
            }),
        ))
        .await;
    }

    pub async fn stream_progress(&self, deployment_id: &str, progress: &DeploymentProgress) {
        self.publish(StatusUpdate::for_deployment(
            deployment_id,
            UpdateType::Progress,
            json!(progress),
        ))
        .await;
    }

    pub async fn stream_health(&self, deployment_id: &str, checks: &[HealthCheck]) {
        self.publish(StatusUpdate::for_deployment(
            deployment_id,
            UpdateType::Health,
            json!(checks),
        ))
        .await;
    }

    pub async fn stream_log(&self, deployment_id: &str, level: &str, message: &str) {
        self.publish(StatusUpdate::for_deployment(
            deployment_id,
            UpdateType::Log,
            json!({ "level": level, "message": message }),
        ))
        .await;
    }

    pub async fn stream_error(&self, deployment_id: &str, error: &str) {
        self.publish(StatusUpdate::for_deployment(
            deployment_id,
            UpdateType::Error,
            json!({ "error": error }),
        ))
        .await;
    }

    async fn publish(&self, update: StatusUpdate) {
        if let Err(e) = self.hub.broadcast(update).await {
            warn!("Dropping status update: {}", e);
        }
    }
}
