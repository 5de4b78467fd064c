//! Orchestration service: owns deployment records, drives platform
//! monitors and rollback controllers, and publishes updates.

pub mod dashboard;
mod reconcile;

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{error, info, warn};

use crate::config::ServiceSettings;
use crate::error::{DeployError, Result};
use crate::hub::StatusStreamer;
use crate::models::{
    Deployment, DeploymentFilters, DeploymentHistory, DeploymentRequest, DeploymentStatus,
    HealthCheck, HistoryFilters, KubernetesConfig, Platform, PlatformKind, RollbackCommand,
    RollbackInfo,
};
use crate::platform::{DeploymentMonitor, RollbackController, RollbackEligibility};
use crate::storage::{CacheLookup, HistoryManager, SnapshotCache};

pub use dashboard::{DashboardMetrics, DeploymentSummary, HealthSummary};

/// Default actor recorded for rollbacks without an explicit initiator.
pub const SYSTEM_ACTOR: &str = "system";

pub struct DeploymentService {
    monitors: RwLock<HashMap<Platform, Arc<dyn DeploymentMonitor>>>,
    rollback_controllers: RwLock<HashMap<Platform, Arc<dyn RollbackController>>>,
    history: Arc<dyn HistoryManager>,
    cache: Arc<dyn SnapshotCache>,
    streamer: StatusStreamer,
    settings: ServiceSettings,
    /// Stop signals of running reconciliation loops.
    active: Mutex<HashMap<String, watch::Sender<bool>>>,
    /// Serialises read-modify-write cycles on a single deployment record.
    /// Unlike the map locks above, a record lock is held across the store
    /// read and write it orders. Cluster calls are made before taking it.
    record_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DeploymentService {
    pub fn new(
        history: Arc<dyn HistoryManager>,
        cache: Arc<dyn SnapshotCache>,
        streamer: StatusStreamer,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            monitors: RwLock::new(HashMap::new()),
            rollback_controllers: RwLock::new(HashMap::new()),
            history,
            cache,
            streamer,
            settings,
            active: Mutex::new(HashMap::new()),
            record_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_monitor(&self, platform: Platform, monitor: Arc<dyn DeploymentMonitor>) {
        let mut monitors = self.monitors.write().unwrap_or_else(|e| e.into_inner());
        monitors.insert(platform, monitor);
    }

    pub fn register_rollback_controller(
        &self,
        platform: Platform,
        controller: Arc<dyn RollbackController>,
    ) {
        let mut controllers = self
            .rollback_controllers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        controllers.insert(platform, controller);
    }

    fn monitor(&self, platform: Platform) -> Result<Arc<dyn DeploymentMonitor>> {
        let monitors = self.monitors.read().unwrap_or_else(|e| e.into_inner());
        monitors
            .get(&platform)
            .cloned()
            .ok_or(DeployError::UnsupportedPlatform(platform))
    }

    fn rollback_controller(&self, platform: Platform) -> Result<Arc<dyn RollbackController>> {
        let controllers = self
            .rollback_controllers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        controllers
            .get(&platform)
            .cloned()
            .ok_or(DeployError::UnsupportedPlatform(platform))
    }

    fn record_lock(&self, deployment_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.record_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(deployment_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn is_reconciling(&self, deployment_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains_key(deployment_id)
    }

    /// Signals the reconciliation loop of a deployment to exit. Returns
    /// whether a loop was running.
    fn signal_stop(&self, deployment_id: &str) -> bool {
        let sender = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.remove(deployment_id)
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(true);
                true
            }
            None => false,
        }
    }

    pub async fn start_deployment(self: &Arc<Self>, request: DeploymentRequest) -> Result<Deployment> {
        request.validate().map_err(DeployError::Configuration)?;
        let monitor = self.monitor(request.platform)?;
        if request.platform.kind() == PlatformKind::Cluster {
            KubernetesConfig::validated(&request.name, &request.version, &request.configuration)
                .map_err(DeployError::Configuration)?;
        }

        let mut deployment = Deployment::new(request);
        self.history.record_deployment(&deployment).await?;
        self.history
            .record_event(
                &deployment.id,
                "deployment_started",
                details(json!({
                    "name": deployment.name,
                    "version": deployment.version,
                    "platform": deployment.platform,
                    "environment": deployment.environment,
                })),
                None,
            )
            .await?;
        info!(
            deployment = %deployment.id,
            platform = %deployment.platform,
            "Starting deployment {} {}",
            deployment.name,
            deployment.version
        );

        self.advance(&mut deployment, DeploymentStatus::Preparing).await?;
        self.history.record_deployment(&deployment).await?;

        if let Err(e) = monitor.start(&deployment).await {
            error!(deployment = %deployment.id, "Failed to start monitoring: {}", e);
            self.mark_failed(&mut deployment, format!("failed to start monitoring: {}", e))
                .await?;
            self.history.record_deployment(&deployment).await?;
            self.streamer.stream_status(&deployment).await;
            self.cache_snapshot(&deployment).await;
            return Ok(deployment);
        }

        self.advance(&mut deployment, DeploymentStatus::Deploying).await?;
        self.history.record_deployment(&deployment).await?;
        self.streamer.stream_status(&deployment).await;
        self.cache_snapshot(&deployment).await;

        self.spawn_reconciliation(deployment.clone(), monitor);
        Ok(deployment)
    }

    /// Cache-aside read of the current deployment state.
    pub async fn get_deployment_status(&self, deployment_id: &str) -> Result<Deployment> {
        match self.cache.get(deployment_id).await {
            Ok(CacheLookup::Hit(deployment)) => return Ok(deployment),
            Ok(CacheLookup::Stale(_)) | Ok(CacheLookup::Miss) => {}
            Err(e) => warn!(deployment = %deployment_id, "Cache read failed: {}", e),
        }

        let mut deployment = self.history.get_deployment(deployment_id).await?;

        if self.is_reconciling(deployment_id) {
            if let Ok(monitor) = self.monitor(deployment.platform) {
                match monitor.get_status(deployment_id).await {
                    Ok(observed) => {
                        if let Some(progress) = observed.progress {
                            deployment.set_progress(progress);
                        }
                    }
                    Err(e) => {
                        warn!(deployment = %deployment_id, "Live refresh failed: {}", e)
                    }
                }
            }
        }

        self.cache_snapshot(&deployment).await;
        Ok(deployment)
    }

    pub async fn check_deployment_health(&self, deployment_id: &str) -> Result<Vec<HealthCheck>> {
        let platform = self.history.get_deployment(deployment_id).await?.platform;
        let checks = self.monitor(platform)?.check_health(deployment_id).await?;

        let lock = self.record_lock(deployment_id);
        let _guard = lock.lock().await;
        let mut deployment = self.history.get_deployment(deployment_id).await?;
        deployment.health_checks = checks.clone();
        self.history.record_deployment(&deployment).await?;
        self.cache_snapshot(&deployment).await;
        self.streamer.stream_health(deployment_id, &checks).await;
        Ok(checks)
    }

    pub async fn initiate_rollback(
        self: &Arc<Self>,
        deployment_id: &str,
        reason: &str,
        target_version: Option<&str>,
        initiated_by: Option<&str>,
    ) -> Result<RollbackInfo> {
        let deployment = self.history.get_deployment(deployment_id).await?;
        let controller = self.rollback_controller(deployment.platform)?;
        let initiated_by = initiated_by.unwrap_or(SYSTEM_ACTOR);

        if let RollbackEligibility::Ineligible(why) = controller.can_rollback(&deployment).await? {
            info!(deployment = %deployment_id, "Rollback not applicable: {}", why);
            return Err(DeployError::RollbackNotApplicable(why));
        }

        let lock = self.record_lock(deployment_id);
        let guard = lock.lock().await;

        // Re-read: the reconciliation loop or a concurrent rollback may have
        // written since the check. The controller only records a plan once
        // the transition is known to be allowed.
        let mut deployment = self.history.get_deployment(deployment_id).await?;
        if !deployment.status.can_transition_to(DeploymentStatus::RollingBack) {
            return Err(DeployError::RollbackNotApplicable(format!(
                "deployment is {}",
                deployment.status
            )));
        }
        let rollback = controller
            .initiate_rollback(&deployment, reason, target_version, initiated_by)
            .await?;

        self.signal_stop(deployment_id);
        self.advance(&mut deployment, DeploymentStatus::RollingBack)
            .await?;
        deployment.rollback_info = Some(rollback.clone());
        self.history.record_deployment(&deployment).await?;
        self.history
            .record_event(
                deployment_id,
                "rollback_initiated",
                details(json!({
                    "reason": reason,
                    "target_version": rollback.target_version,
                    "initiated_by": initiated_by,
                })),
                Some(initiated_by),
            )
            .await?;
        self.streamer.stream_status(&deployment).await;
        self.cache_snapshot(&deployment).await;
        drop(guard);

        let service = Arc::clone(self);
        let execution = rollback.clone();
        tokio::spawn(async move {
            if let Err(e) = service
                .run_rollback(deployment, execution, controller)
                .await
            {
                error!("Rollback bookkeeping failed: {}", e);
            }
        });

        Ok(rollback)
    }

    async fn run_rollback(
        &self,
        deployment: Deployment,
        rollback: RollbackInfo,
        controller: Arc<dyn RollbackController>,
    ) -> Result<()> {
        let outcome = controller
            .execute_rollback(&deployment, rollback.clone(), &self.streamer)
            .await;

        let lock = self.record_lock(&deployment.id);
        let _guard = lock.lock().await;
        let mut deployment = self.history.get_deployment(&deployment.id).await?;

        match outcome {
            Ok(finished) => {
                deployment.rollback_info = Some(finished);
                self.advance(&mut deployment, DeploymentStatus::RolledBack)
                    .await?;
                self.history.record_deployment(&deployment).await?;
                self.history
                    .record_event(
                        &deployment.id,
                        "rollback_completed",
                        details(json!({ "target_version": rollback.target_version })),
                        Some(rollback.initiated_by.as_str()),
                    )
                    .await?;
                info!(deployment = %deployment.id, "Rollback completed");
            }
            Err(e) => {
                let mut failed = deployment.rollback_info.take().unwrap_or(rollback);
                failed.finish(DeploymentStatus::Failed);
                let initiated_by = failed.initiated_by.clone();
                deployment.rollback_info = Some(failed);
                self.mark_failed(&mut deployment, format!("rollback failed: {}", e))
                    .await?;
                self.history.record_deployment(&deployment).await?;
                self.history
                    .record_event(
                        &deployment.id,
                        "rollback_failed",
                        details(json!({ "error": e.to_string() })),
                        Some(initiated_by.as_str()),
                    )
                    .await?;
                warn!(deployment = %deployment.id, "Rollback failed: {}", e);
            }
        }

        self.streamer.stream_status(&deployment).await;
        self.cache_snapshot(&deployment).await;
        Ok(())
    }

    pub async fn get_rollback_commands(
        &self,
        deployment_id: &str,
        target_version: Option<&str>,
    ) -> Result<Vec<RollbackCommand>> {
        let deployment = self.history.get_deployment(deployment_id).await?;
        let controller = self.rollback_controller(deployment.platform)?;
        controller
            .generate_rollback_commands(&deployment, target_version)
            .await
    }

    pub async fn get_rollback_status(&self, deployment_id: &str) -> Result<RollbackInfo> {
        let deployment = self.history.get_deployment(deployment_id).await?;
        let controller = self.rollback_controller(deployment.platform)?;
        match controller.get_rollback_status(deployment_id).await {
            Err(DeployError::NotFound(_)) => deployment
                .rollback_info
                .ok_or_else(|| DeployError::not_found("rollback for deployment", deployment_id)),
            other => other,
        }
    }

    pub async fn get_deployment_history(
        &self,
        filters: &HistoryFilters,
    ) -> Result<Vec<DeploymentHistory>> {
        self.history.get_history(filters).await
    }

    pub async fn get_deployments(&self, filters: &DeploymentFilters) -> Result<Vec<Deployment>> {
        self.history.get_deployments(filters).await
    }

    /// Ends tracking: the reconciliation loop exits, the platform watch is
    /// released and the cached snapshot dropped. The stored record is left
    /// as is.
    pub async fn stop_deployment(&self, deployment_id: &str) -> Result<Deployment> {
        let deployment = self.history.get_deployment(deployment_id).await?;
        let was_running = self.signal_stop(deployment_id);

        if let Ok(monitor) = self.monitor(deployment.platform) {
            match monitor.stop(deployment_id).await {
                Ok(()) | Err(DeployError::NotFound(_)) => {}
                Err(e) => warn!(deployment = %deployment_id, "Failed to stop monitor: {}", e),
            }
        }
        // Waits out a cycle that passed its stop check before the signal.
        let lock = self.record_lock(deployment_id);
        let _guard = lock.lock().await;
        if let Err(e) = self.cache.invalidate(deployment_id).await {
            warn!(deployment = %deployment_id, "Cache invalidation failed: {}", e);
        }
        info!(deployment = %deployment_id, was_running, "Stopped tracking deployment");
        Ok(deployment)
    }

    /// Applies a lifecycle transition and records it. Returns false when the
    /// lifecycle does not allow it.
    async fn advance(&self, deployment: &mut Deployment, next: DeploymentStatus) -> Result<bool> {
        let from = deployment.status;
        if !deployment.transition(next) {
            return Ok(false);
        }
        info!(deployment = %deployment.id, from = %from, to = %next, "Status changed");
        self.history
            .record_event(
                &deployment.id,
                "status_changed",
                details(json!({ "from": from, "to": next })),
                None,
            )
            .await?;
        Ok(true)
    }

    async fn mark_failed(&self, deployment: &mut Deployment, reason: String) -> Result<bool> {
        let from = deployment.status;
        if !deployment.fail(reason.clone()) {
            return Ok(false);
        }
        warn!(deployment = %deployment.id, from = %from, "Deployment failed: {}", reason);
        self.history
            .record_event(
                &deployment.id,
                "status_changed",
                details(json!({ "from": from, "to": DeploymentStatus::Failed })),
                None,
            )
            .await?;
        self.history
            .record_event(
                &deployment.id,
                "deployment_failed",
                details(json!({ "error": reason })),
                None,
            )
            .await?;
        self.streamer.stream_error(&deployment.id, &reason).await;
        Ok(true)
    }

    async fn cache_snapshot(&self, deployment: &Deployment) {
        if let Err(e) = self.cache.put(deployment).await {
            warn!(deployment = %deployment.id, "Cache write failed: {}", e);
        }
    }
}

fn details(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
