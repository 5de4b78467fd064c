use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::resolve_refs;
use crate::cluster::{ClusterClient, ClusterEvent, KubeDeployment, Pod};
use crate::error::{DeployError, Result};
use crate::models::{
    Deployment, DeploymentProgress, DeploymentStatus, HealthCheck, HealthCheckType, HealthStatus,
    ProgressMessage, ResourceRefs,
};
use crate::platform::DeploymentMonitor;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

struct Tracked {
    deployment: Deployment,
    refs: ResourceRefs,
    stop: watch::Sender<bool>,
    /// Most recent object delivered by the watch.
    latest: Option<KubeDeployment>,
}

type TrackedMap = Arc<RwLock<HashMap<String, Tracked>>>;

pub struct KubernetesMonitor {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    tracked: TrackedMap,
    backoff: (Duration, Duration),
}

impl KubernetesMonitor {
    pub fn new(client: Arc<dyn ClusterClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            tracked: Arc::new(RwLock::new(HashMap::new())),
            backoff: (INITIAL_BACKOFF, MAX_BACKOFF),
        }
    }

    /// Overrides the watch reconnect delays.
    pub fn with_watch_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff = (initial, max.max(initial));
        self
    }

    pub fn is_tracking(&self, deployment_id: &str) -> bool {
        let tracked = self.tracked.read().unwrap_or_else(|e| e.into_inner());
        tracked.contains_key(deployment_id)
    }

    fn snapshot(&self, deployment_id: &str) -> Result<(ResourceRefs, Option<KubeDeployment>)> {
        let tracked = self.tracked.read().unwrap_or_else(|e| e.into_inner());
        tracked
            .get(deployment_id)
            .map(|t| (t.refs.clone(), t.latest.clone()))
            .ok_or_else(|| DeployError::not_found("monitored deployment", deployment_id))
    }
}

#[async_trait]
impl DeploymentMonitor for KubernetesMonitor {
    async fn start(&self, deployment: &Deployment) -> Result<()> {
        let refs = resolve_refs(deployment, &self.namespace)?;
        let (stop_tx, stop_rx) = watch::channel(false);

        {
            let mut tracked = self.tracked.write().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = tracked.insert(
                deployment.id.clone(),
                Tracked {
                    deployment: deployment.clone(),
                    refs: refs.clone(),
                    stop: stop_tx,
                    latest: None,
                },
            ) {
                let _ = previous.stop.send(true);
            }
        }

        info!(
            deployment = %deployment.id,
            "Watching {}/{} ({})",
            refs.namespace,
            refs.deployment_name,
            refs.label_selector()
        );
        tokio::spawn(watch_loop(
            self.client.clone(),
            self.tracked.clone(),
            deployment.id.clone(),
            refs,
            stop_rx,
            self.backoff,
        ));
        Ok(())
    }

    async fn get_status(&self, deployment_id: &str) -> Result<Deployment> {
        let (refs, watched) = self.snapshot(deployment_id)?;

        let live = match self
            .client
            .get_deployment(&refs.namespace, &refs.deployment_name)
            .await
        {
            Ok(live) => live,
            Err(e) => match watched {
                Some(watched) => {
                    warn!(deployment = %deployment_id, "Falling back to watched state: {}", e);
                    watched
                }
                None => return Err(e.into()),
            },
        };

        let pods = match self
            .client
            .list_pods(&refs.namespace, &refs.label_selector())
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!(deployment = %deployment_id, "Failed to list pods: {}", e);
                Vec::new()
            }
        };

        let status = derive_status(&live);
        let progress = calculate_progress(&live, &pods);

        let mut tracked = self.tracked.write().unwrap_or_else(|e| e.into_inner());
        let entry = tracked
            .get_mut(deployment_id)
            .ok_or_else(|| DeployError::not_found("monitored deployment", deployment_id))?;
        entry.deployment.status = status;
        entry.deployment.error = (status == DeploymentStatus::Failed)
            .then(|| "deployment exceeded its progress deadline".to_string());
        entry.deployment.progress = Some(progress);
        entry.latest = Some(live);
        Ok(entry.deployment.clone())
    }

    async fn update_progress(
        &self,
        deployment_id: &str,
        progress: DeploymentProgress,
    ) -> Result<()> {
        let mut tracked = self.tracked.write().unwrap_or_else(|e| e.into_inner());
        let entry = tracked
            .get_mut(deployment_id)
            .ok_or_else(|| DeployError::not_found("monitored deployment", deployment_id))?;
        entry.deployment.progress = Some(progress);
        Ok(())
    }

    async fn check_health(&self, deployment_id: &str) -> Result<Vec<HealthCheck>> {
        let (refs, _) = self.snapshot(deployment_id)?;

        let pods = self
            .client
            .list_pods(&refs.namespace, &refs.label_selector())
            .await?;

        let mut checks = Vec::new();
        for pod in &pods {
            checks.extend(pod_health(pod));
        }

        if refs.service_configured {
            let endpoints = self
                .client
                .get_endpoints(&refs.namespace, &refs.service_name)
                .await?;
            let addresses: usize = endpoints
                .and_then(|e| e.subsets)
                .unwrap_or_default()
                .iter()
                .map(|subset| subset.addresses.as_ref().map_or(0, Vec::len))
                .sum();

            let check = HealthCheck::new(
                format!("{}-service", refs.service_name),
                HealthCheckType::Custom,
            )
            .with_meta("service", refs.service_name.clone());
            checks.push(if addresses > 0 {
                check.with_status(
                    HealthStatus::Healthy,
                    format!("Service has {} endpoints", addresses),
                )
            } else {
                check.with_status(HealthStatus::Unhealthy, "Service has no endpoints")
            });
        }

        Ok(checks)
    }

    async fn stop(&self, deployment_id: &str) -> Result<()> {
        let removed = {
            let mut tracked = self.tracked.write().unwrap_or_else(|e| e.into_inner());
            tracked.remove(deployment_id)
        };
        match removed {
            Some(entry) => {
                let _ = entry.stop.send(true);
                debug!(deployment = %deployment_id, "Stopped monitoring");
                Ok(())
            }
            None => Err(DeployError::not_found("monitored deployment", deployment_id)),
        }
    }
}

/// Follows one deployment object until stopped, reopening the watch with
/// exponential backoff whenever the stream ends or cannot be opened.
async fn watch_loop(
    client: Arc<dyn ClusterClient>,
    tracked: TrackedMap,
    deployment_id: String,
    refs: ResourceRefs,
    mut stop: watch::Receiver<bool>,
    (initial_backoff, max_backoff): (Duration, Duration),
) {
    let mut backoff = initial_backoff;

    loop {
        if stopped(&stop) {
            break;
        }

        let opened = tokio::select! {
            _ = stop.changed() => break,
            opened = client.watch_deployment(&refs.namespace, &refs.deployment_name) => opened,
        };

        match opened {
            Ok(mut events) => {
                backoff = initial_backoff;
                loop {
                    let next = tokio::select! {
                        _ = stop.changed() => return,
                        next = events.next() => next,
                    };
                    match next {
                        Some(Ok(ClusterEvent::Applied(object))) => {
                            let status = derive_status(&object);
                            let mut map = tracked.write().unwrap_or_else(|e| e.into_inner());
                            match map.get_mut(&deployment_id) {
                                Some(entry) => {
                                    entry.deployment.status = status;
                                    entry.latest = Some(*object);
                                }
                                None => return,
                            }
                        }
                        Some(Ok(ClusterEvent::Deleted(_))) => {
                            warn!(deployment = %deployment_id, "Watched deployment {} was deleted", refs.deployment_name);
                            let mut map = tracked.write().unwrap_or_else(|e| e.into_inner());
                            if let Some(entry) = map.get_mut(&deployment_id) {
                                entry.latest = None;
                            }
                        }
                        Some(Ok(ClusterEvent::Error(message))) => {
                            warn!(deployment = %deployment_id, "Watch error event: {}", message);
                        }
                        Some(Err(e)) => {
                            warn!(deployment = %deployment_id, "Watch stream error: {}", e);
                        }
                        None => {
                            debug!(deployment = %deployment_id, "Watch stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(deployment = %deployment_id, "Failed to open watch: {}", e);
            }
        }

        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(max_backoff);
    }

    debug!(deployment = %deployment_id, "Watch loop exited");
}

fn stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

struct ReplicaCounts {
    desired: i32,
    updated: i32,
    ready: i32,
    observed_generation: i64,
    generation: i64,
}

impl ReplicaCounts {
    fn of(object: &KubeDeployment) -> Self {
        let status = object.status.as_ref();
        Self {
            desired: object.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            updated: status.and_then(|s| s.updated_replicas).unwrap_or(0),
            ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
            observed_generation: status.and_then(|s| s.observed_generation).unwrap_or(0),
            generation: object.metadata.generation.unwrap_or(0),
        }
    }
}

/// Maps a cluster deployment object onto the lifecycle.
pub fn derive_status(object: &KubeDeployment) -> DeploymentStatus {
    let counts = ReplicaCounts::of(object);
    let conditions = object
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();

    for condition in conditions.iter().filter(|c| c.type_ == "Progressing") {
        if condition.reason.as_deref() == Some("ProgressDeadlineExceeded") {
            return DeploymentStatus::Failed;
        }
        if condition.status == "True" {
            if counts.updated < counts.desired {
                return DeploymentStatus::Deploying;
            }
            if counts.ready < counts.desired {
                return DeploymentStatus::Verifying;
            }
        }
    }

    if counts.observed_generation >= counts.generation
        && counts.updated == counts.desired
        && counts.ready == counts.desired
    {
        return DeploymentStatus::Completed;
    }
    DeploymentStatus::Deploying
}

pub fn calculate_progress(object: &KubeDeployment, pods: &[Pod]) -> DeploymentProgress {
    let counts = ReplicaCounts::of(object);

    let percentage = if counts.desired > 0 {
        f64::from(counts.ready) / f64::from(counts.desired) * 100.0
    } else {
        0.0
    };
    let current_stage = if counts.updated < counts.desired {
        "Rolling out new version"
    } else if counts.ready < counts.desired {
        "Waiting for pods to be ready"
    } else {
        "Deployment complete"
    };

    let messages = pods
        .iter()
        .filter_map(|pod| {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("Unknown");
            (phase != "Running").then(|| {
                let name = pod_name(pod);
                ProgressMessage {
                    timestamp: Utc::now(),
                    level: "info".to_string(),
                    message: format!("Pod {} is {}", name, phase),
                    component: Some(name.to_string()),
                }
            })
        })
        .collect();

    DeploymentProgress {
        total_steps: counts.desired.max(0) as u32,
        current_step: counts.ready.max(0) as u32,
        current_stage: current_stage.to_string(),
        percentage,
        messages,
    }
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("unknown")
}

/// Readiness check for the pod plus a liveness check per container.
fn pod_health(pod: &Pod) -> Vec<HealthCheck> {
    let name = pod_name(pod);
    let status = pod.status.as_ref();

    let ready_condition = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"));
    let readiness = HealthCheck::new(format!("{}-readiness", name), HealthCheckType::Readiness)
        .with_meta("pod", name);
    let readiness = match ready_condition {
        Some(c) if c.status == "True" => readiness.with_status(HealthStatus::Healthy, "Pod is ready"),
        Some(c) => readiness.with_status(
            HealthStatus::Unhealthy,
            c.message.clone().unwrap_or_else(|| "Pod is not ready".to_string()),
        ),
        None => readiness.with_status(HealthStatus::Unhealthy, "Unknown"),
    };

    let mut checks = vec![readiness];
    for container in status
        .and_then(|s| s.container_statuses.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let state = container.state.as_ref();
        let running = state.map_or(false, |s| s.running.is_some());
        let check = HealthCheck::new(
            format!("{}-{}-liveness", name, container.name),
            HealthCheckType::Liveness,
        )
        .with_meta("pod", name)
        .with_meta("container", container.name.clone());

        checks.push(if container.ready && running {
            check.with_status(HealthStatus::Healthy, "Container is running")
        } else {
            let message = match state {
                Some(s) if s.waiting.is_some() => format!(
                    "Waiting: {}",
                    s.waiting.as_ref().and_then(|w| w.reason.as_deref()).unwrap_or("")
                ),
                Some(s) if s.terminated.is_some() => format!(
                    "Terminated: {}",
                    s.terminated.as_ref().and_then(|t| t.reason.as_deref()).unwrap_or("")
                ),
                _ => "Unknown state".to_string(),
            };
            check.with_status(HealthStatus::Unhealthy, message)
        });
    }
    checks
}
