use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

use super::resolve_refs;
use crate::cluster::ClusterClient;
use crate::error::{DeployError, Result};
use crate::hub::StatusStreamer;
use crate::models::{
    is_image_tag, order_commands, Deployment, DeploymentStatus, Platform, RollbackCommand,
    RollbackInfo,
};
use crate::platform::executor::{run_in_order, CommandRunner};
use crate::platform::{RollbackController, RollbackEligibility};

const ROLLOUT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Reverts cluster deployments with `kubectl`.
pub struct KubernetesRollbackController {
    client: Arc<dyn ClusterClient>,
    runner: Arc<dyn CommandRunner>,
    namespace: String,
    rollbacks: RwLock<HashMap<String, RollbackInfo>>,
}

impl KubernetesRollbackController {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        runner: Arc<dyn CommandRunner>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            runner,
            namespace: namespace.into(),
            rollbacks: RwLock::new(HashMap::new()),
        }
    }

    fn store(&self, rollback: &RollbackInfo) {
        let mut rollbacks = self.rollbacks.write().unwrap_or_else(|e| e.into_inner());
        rollbacks.insert(rollback.target_deployment_id.clone(), rollback.clone());
    }
}

fn is_previous(target_version: Option<&str>) -> bool {
    matches!(target_version, None | Some("") | Some("previous"))
}

#[async_trait]
impl RollbackController for KubernetesRollbackController {
    async fn can_rollback(&self, deployment: &Deployment) -> Result<RollbackEligibility> {
        if !deployment.status.allows_rollback() {
            return Ok(RollbackEligibility::Ineligible(format!(
                "cannot rollback deployment in {} state",
                deployment.status
            )));
        }

        let refs = resolve_refs(deployment, &self.namespace)?;
        let live = self
            .client
            .get_deployment(&refs.namespace, &refs.deployment_name)
            .await?;

        let observed_generation = live
            .status
            .as_ref()
            .and_then(|s| s.observed_generation)
            .unwrap_or(0);
        if observed_generation <= 1 {
            return Ok(RollbackEligibility::Ineligible(
                "no previous revision to rollback to".to_string(),
            ));
        }

        // Replica sets of every revision share the deployment's own selector.
        let selector = live
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.as_ref())
            .filter(|labels| !labels.is_empty())
            .map(|labels| {
                labels
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_else(|| format!("app={}", deployment.name));
        let replica_sets = self
            .client
            .list_replica_sets(&refs.namespace, &selector)
            .await?;
        if replica_sets.len() < 2 {
            return Ok(RollbackEligibility::Ineligible(
                "no previous replicaset found".to_string(),
            ));
        }

        Ok(RollbackEligibility::Eligible)
    }

    async fn generate_rollback_commands(
        &self,
        deployment: &Deployment,
        target_version: Option<&str>,
    ) -> Result<Vec<RollbackCommand>> {
        if deployment.platform != Platform::Kubernetes {
            return Err(DeployError::UnsupportedPlatform(deployment.platform));
        }
        let refs = resolve_refs(deployment, &self.namespace)?;
        let target = target_version.filter(|v| !is_previous(Some(*v)));
        if let Some(version) = target {
            if !is_image_tag(version) {
                return Err(DeployError::Configuration(format!(
                    "target version {:?} is not a valid image tag",
                    version
                )));
            }
        }

        let ns = refs.namespace.as_str();
        let resource = format!("deployment/{}", refs.deployment_name);
        let resource = resource.as_str();
        let selector = refs.label_selector();
        let step = |order, args: &[&str], description: String, timeout| {
            RollbackCommand::new(
                Platform::Kubernetes,
                order,
                "kubectl",
                args.iter().map(|a| a.to_string()).collect(),
                description,
                timeout,
            )
        };

        let mut commands = Vec::with_capacity(4);
        commands.push(match target {
            None => step(
                1,
                &["rollout", "undo", resource, "-n", ns],
                "Rollback deployment to previous version".to_string(),
                ROLLOUT_TIMEOUT,
            ),
            Some(version) => step(
                1,
                &["set", "image", resource, format!("*=*:{}", version).as_str(), "-n", ns],
                format!("Set deployment image to version {}", version),
                VERIFY_TIMEOUT,
            ),
        });
        commands.push(step(
            2,
            &["rollout", "status", resource, "-n", ns, "--timeout=5m"],
            "Wait for rollback to complete".to_string(),
            ROLLOUT_TIMEOUT,
        ));
        commands.push(step(
            3,
            &["get", "pods", "-l", selector.as_str(), "-n", ns],
            "Verify pods are running".to_string(),
            VERIFY_TIMEOUT,
        ));
        if refs.service_configured {
            commands.push(step(
                4,
                &["get", "endpoints", refs.service_name.as_str(), "-n", ns],
                "Verify service endpoints".to_string(),
                VERIFY_TIMEOUT,
            ));
        }

        order_commands(commands).map_err(DeployError::Terminal)
    }

    async fn initiate_rollback(
        &self,
        deployment: &Deployment,
        reason: &str,
        target_version: Option<&str>,
        initiated_by: &str,
    ) -> Result<RollbackInfo> {
        let commands = self
            .generate_rollback_commands(deployment, target_version)
            .await?;
        let target = target_version
            .filter(|v| !is_previous(Some(*v)))
            .unwrap_or("previous");

        let rollback = RollbackInfo {
            target_version: target.to_string(),
            target_deployment_id: deployment.id.clone(),
            reason: reason.to_string(),
            initiated_by: initiated_by.to_string(),
            initiated_at: Utc::now(),
            completed_at: None,
            status: DeploymentStatus::RollingBack,
            commands,
        };
        self.store(&rollback);

        info!(
            deployment = %deployment.id,
            target = %rollback.target_version,
            "Rollback initiated: {}",
            reason
        );
        Ok(rollback)
    }

    async fn execute_rollback(
        &self,
        deployment: &Deployment,
        mut rollback: RollbackInfo,
        streamer: &StatusStreamer,
    ) -> Result<RollbackInfo> {
        let outcome = run_in_order(
            self.runner.as_ref(),
            &deployment.id,
            &rollback.commands,
            streamer,
        )
        .await;

        rollback.finish(match &outcome {
            Ok(()) => DeploymentStatus::RolledBack,
            Err(_) => DeploymentStatus::Failed,
        });
        self.store(&rollback);
        outcome.map(|()| rollback)
    }

    async fn get_rollback_status(&self, deployment_id: &str) -> Result<RollbackInfo> {
        let rollbacks = self.rollbacks.read().unwrap_or_else(|e| e.into_inner());
        rollbacks
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| DeployError::not_found("rollback for deployment", deployment_id))
    }
}
