use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{details, DeploymentService};
use crate::error::Result;
use crate::models::{Deployment, DeploymentStatus, HealthCheck, HealthStatus};
use crate::platform::DeploymentMonitor;

enum Cycle {
    Continue,
    Done,
}

/// What one poll saw on the platform, gathered before the record is locked.
struct Observation {
    observed: Deployment,
    checks: Option<Vec<HealthCheck>>,
}

/// Position on the forward path. Rollback states are off the path.
fn rank(status: DeploymentStatus) -> Option<u8> {
    match status {
        DeploymentStatus::Pending => Some(0),
        DeploymentStatus::Preparing => Some(1),
        DeploymentStatus::Deploying => Some(2),
        DeploymentStatus::Verifying => Some(3),
        DeploymentStatus::Completed => Some(4),
        _ => None,
    }
}

fn stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

fn successor(status: DeploymentStatus) -> Option<DeploymentStatus> {
    match status {
        DeploymentStatus::Pending => Some(DeploymentStatus::Preparing),
        DeploymentStatus::Preparing => Some(DeploymentStatus::Deploying),
        DeploymentStatus::Deploying => Some(DeploymentStatus::Verifying),
        DeploymentStatus::Verifying => Some(DeploymentStatus::Completed),
        _ => None,
    }
}

impl DeploymentService {
    pub(super) fn spawn_reconciliation(
        self: &Arc<Self>,
        deployment: Deployment,
        monitor: Arc<dyn DeploymentMonitor>,
    ) {
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = active.insert(deployment.id.clone(), stop_tx) {
                let _ = previous.send(true);
            }
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let id = deployment.id.clone();
            service.reconcile(deployment, monitor, stop_rx).await;
            let mut active = service.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.get(&id).map_or(false, |tx| tx.is_closed()) {
                active.remove(&id);
            }
        });
    }

    async fn reconcile(
        &self,
        mut deployment: Deployment,
        monitor: Arc<dyn DeploymentMonitor>,
        mut stop: watch::Receiver<bool>,
    ) {
        let poll = self.settings.poll_interval;
        let elapsed = (chrono::Utc::now() - deployment.start_time)
            .to_std()
            .unwrap_or_default();
        let deadline = Instant::now() + self.settings.deployment_timeout.saturating_sub(elapsed);
        let expiry = sleep_until(deadline);
        tokio::pin!(expiry);

        let mut ticker = interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(deployment = %deployment.id, "Reconciliation started");
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!(deployment = %deployment.id, "Reconciliation stopped");
                    return;
                }
                _ = &mut expiry => {
                    if let Err(e) = self.expire(&mut deployment, &stop).await {
                        error!(deployment = %deployment.id, "Failed to record timeout: {}", e);
                    }
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.reconcile_once(&mut deployment, monitor.as_ref(), &stop).await {
                Ok(Cycle::Continue) => {}
                Ok(Cycle::Done) => return,
                Err(e) if e.is_transient() => {
                    warn!(deployment = %deployment.id, "Reconciliation cycle skipped: {}", e)
                }
                Err(e) => {
                    error!(deployment = %deployment.id, "Reconciliation cycle failed: {}", e)
                }
            }
        }
    }

    async fn reconcile_once(
        &self,
        deployment: &mut Deployment,
        monitor: &dyn DeploymentMonitor,
        stop: &watch::Receiver<bool>,
    ) -> Result<Cycle> {
        if stopped(stop) {
            return Ok(Cycle::Done);
        }
        let observation = self.observe(&deployment.id, monitor).await;

        let lock = self.record_lock(&deployment.id);
        let guard = lock.lock().await;
        if stopped(stop) {
            return Ok(Cycle::Done);
        }
        // Health checks and other writers may have updated the record.
        *deployment = self.history.get_deployment(&deployment.id).await?;

        if !deployment.status.is_terminal() {
            if let Some(observation) = observation {
                self.apply_observed(deployment, observation).await?;
            }
            self.history.record_deployment(deployment).await?;
            self.cache_snapshot(deployment).await;
        }
        drop(guard);

        if let Some(progress) = deployment.progress.clone() {
            if let Err(e) = monitor.update_progress(&deployment.id, progress).await {
                debug!(deployment = %deployment.id, "Monitor progress not updated: {}", e);
            }
        }

        if deployment.status.is_terminal() {
            self.finalize(deployment).await?;
            return Ok(Cycle::Done);
        }
        Ok(Cycle::Continue)
    }

    /// Polls the platform. Health is only probed once every replica runs
    /// the new version, which is when the completion gate can use it.
    async fn observe(
        &self,
        deployment_id: &str,
        monitor: &dyn DeploymentMonitor,
    ) -> Option<Observation> {
        let observed = match monitor.get_status(deployment_id).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(deployment = %deployment_id, "Status poll failed: {}", e);
                return None;
            }
        };

        let checks = if matches!(
            observed.status,
            DeploymentStatus::Verifying | DeploymentStatus::Completed
        ) {
            match monitor.check_health(deployment_id).await {
                Ok(checks) => Some(checks),
                Err(e) => {
                    warn!(deployment = %deployment_id, "Health check failed: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Some(Observation { observed, checks })
    }

    async fn apply_observed(
        &self,
        deployment: &mut Deployment,
        observation: Observation,
    ) -> Result<()> {
        let Observation { observed, checks } = observation;
        if let Some(progress) = observed.progress {
            deployment.set_progress(progress);
            if let Some(progress) = &deployment.progress {
                self.streamer.stream_progress(&deployment.id, progress).await;
            }
        }

        if observed.status == DeploymentStatus::Failed {
            let reason = observed
                .error
                .unwrap_or_else(|| format!("{} reported the deployment as failed", deployment.platform));
            self.mark_failed(deployment, reason).await?;
            self.streamer.stream_status(deployment).await;
            return Ok(());
        }

        // Completion is only reached through the health gate below.
        let target = match observed.status {
            DeploymentStatus::Completed => DeploymentStatus::Verifying,
            other => other,
        };
        let before = deployment.status;
        if let (Some(mut current), Some(wanted)) = (rank(deployment.status), rank(target)) {
            while current < wanted {
                let Some(next) = successor(deployment.status) else {
                    break;
                };
                if !self.advance(deployment, next).await? {
                    break;
                }
                current = rank(next).unwrap_or(wanted);
            }
        }

        if deployment.status == DeploymentStatus::Verifying {
            if let Some(checks) = checks {
                self.streamer.stream_health(&deployment.id, &checks).await;
                let all_healthy = !checks.is_empty()
                    && checks.iter().all(|c| c.status == HealthStatus::Healthy);
                deployment.health_checks = checks;
                if observed.status == DeploymentStatus::Completed && all_healthy {
                    self.advance(deployment, DeploymentStatus::Completed).await?;
                }
            }
        }

        if deployment.status != before {
            self.streamer.stream_status(deployment).await;
        }
        Ok(())
    }

    async fn finalize(&self, deployment: &Deployment) -> Result<()> {
        let duration = deployment
            .duration()
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default();
        self.history
            .record_event(
                &deployment.id,
                "deployment_completed",
                details(json!({
                    "status": deployment.status,
                    "duration": duration,
                })),
                None,
            )
            .await?;
        self.streamer.stream_status(deployment).await;
        info!(
            deployment = %deployment.id,
            status = %deployment.status,
            "Deployment finished after {:.1}s",
            duration
        );
        Ok(())
    }

    async fn expire(&self, deployment: &mut Deployment, stop: &watch::Receiver<bool>) -> Result<()> {
        let lock = self.record_lock(&deployment.id);
        let _guard = lock.lock().await;
        if stopped(stop) {
            return Ok(());
        }
        *deployment = self.history.get_deployment(&deployment.id).await?;
        if deployment.status.is_terminal() {
            return Ok(());
        }

        let timeout = self.settings.deployment_timeout;
        let reason = format!("deployment timed out after {}s", timeout.as_secs_f64());
        if !self.mark_failed(deployment, reason).await? {
            return Ok(());
        }
        self.history.record_deployment(deployment).await?;
        self.history
            .record_event(
                &deployment.id,
                "deployment_timeout",
                details(json!({ "timeout_secs": timeout.as_secs_f64() })),
                None,
            )
            .await?;
        self.streamer.stream_status(deployment).await;
        self.cache_snapshot(deployment).await;
        Ok(())
    }
}
