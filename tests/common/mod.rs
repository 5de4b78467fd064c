// Shared fixtures: an in-process cluster, a recording command runner and a
// fully wired service over in-memory storage.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use rollwatch::cluster::{
    ClusterClient, ClusterError, Endpoints, EventStream, KubeDeployment, Pod, ReplicaSet,
};
use rollwatch::config::{HubSettings, ServiceSettings};
use rollwatch::error::{DeployError, Result};
use rollwatch::hub::{HubHandle, StatusHub, StatusStreamer};
use rollwatch::models::{DeploymentRequest, Platform, PlatformKind, RollbackCommand};
use rollwatch::platform::{
    CommandOutput, CommandRunner, KubernetesMonitor, KubernetesRollbackController, StubMonitor,
    StubRollbackController,
};
use rollwatch::models::Deployment;
use rollwatch::storage::{HistoryManager, MemoryCache};
use rollwatch::{DeploymentService, Storage};

/// Cluster state served from memory. Watches never deliver events, so the
/// monitor relies on live reads.
#[derive(Default)]
pub struct FakeCluster {
    deployment: Mutex<Option<Value>>,
    pods: Mutex<Vec<Value>>,
    replica_sets: Mutex<usize>,
    endpoints: Mutex<Option<Value>>,
    pub watches: AtomicUsize,
    pub gets: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A rollout of `desired` replicas with the given counters.
    pub fn set_rollout(&self, desired: i32, updated: i32, ready: i32, generation: i64) {
        self.set_deployment(json!({
            "metadata": {"name": "api", "namespace": "default", "generation": generation},
            "spec": {
                "replicas": desired,
                "selector": {"matchLabels": {"app": "api"}},
                "template": {"metadata": {"labels": {"app": "api"}}}
            },
            "status": {
                "observedGeneration": generation,
                "replicas": desired,
                "updatedReplicas": updated,
                "readyReplicas": ready,
                "availableReplicas": ready,
                "conditions": [{"type": "Progressing", "status": "True", "reason": "NewReplicaSetAvailable"}]
            }
        }));
    }

    pub fn set_deadline_exceeded(&self) {
        self.set_deployment(json!({
            "metadata": {"name": "api", "namespace": "default", "generation": 2},
            "spec": {
                "replicas": 3,
                "selector": {"matchLabels": {"app": "api"}},
                "template": {}
            },
            "status": {
                "observedGeneration": 2,
                "updatedReplicas": 1,
                "readyReplicas": 0,
                "conditions": [{
                    "type": "Progressing",
                    "status": "False",
                    "reason": "ProgressDeadlineExceeded",
                    "message": "ReplicaSet api-7d4 has timed out progressing."
                }]
            }
        }));
    }

    pub fn set_deployment(&self, object: Value) {
        *self.deployment.lock().unwrap() = Some(object);
    }

    /// `count` running pods whose readiness and containers are all healthy.
    pub fn set_ready_pods(&self, count: usize) {
        let pods = (0..count)
            .map(|i| {
                json!({
                    "metadata": {"name": format!("api-{}", i), "namespace": "default"},
                    "status": {
                        "phase": "Running",
                        "conditions": [{"type": "Ready", "status": "True"}],
                        "containerStatuses": [{
                            "name": "api",
                            "ready": true,
                            "restartCount": 0,
                            "image": "api:v2",
                            "imageID": "",
                            "state": {"running": {"startedAt": "2024-01-01T00:00:00Z"}}
                        }]
                    }
                })
            })
            .collect();
        *self.pods.lock().unwrap() = pods;
    }

    pub fn set_replica_sets(&self, count: usize) {
        *self.replica_sets.lock().unwrap() = count;
    }

    pub fn set_endpoints(&self, addresses: usize) {
        let ips: Vec<Value> = (0..addresses)
            .map(|i| json!({"ip": format!("10.0.0.{}", i + 1)}))
            .collect();
        *self.endpoints.lock().unwrap() = Some(json!({
            "metadata": {"name": "api"},
            "subsets": [{"addresses": ips}]
        }));
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> std::result::Result<T, ClusterError> {
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<KubeDeployment, ClusterError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let object = self.deployment.lock().unwrap().clone();
        match object {
            Some(object) => decode(object),
            None => Err(ClusterError::NotFound {
                kind: "deployment",
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        _selector: &str,
    ) -> std::result::Result<Vec<Pod>, ClusterError> {
        let pods = self.pods.lock().unwrap().clone();
        pods.into_iter().map(decode).collect()
    }

    async fn list_replica_sets(
        &self,
        _namespace: &str,
        _selector: &str,
    ) -> std::result::Result<Vec<ReplicaSet>, ClusterError> {
        let count = *self.replica_sets.lock().unwrap();
        (0..count)
            .map(|i| decode(json!({"metadata": {"name": format!("api-{}", i)}})))
            .collect()
    }

    async fn get_endpoints(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> std::result::Result<Option<Endpoints>, ClusterError> {
        let endpoints = self.endpoints.lock().unwrap().clone();
        endpoints.map(decode).transpose()
    }

    async fn watch_deployment(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> std::result::Result<EventStream, ClusterError> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(futures::stream::pending()))
    }
}

/// Records every command instead of running it. Fails on the command whose
/// text contains `fail_on`. A held runner blocks each command until
/// `release` is called.
#[derive(Default)]
pub struct RecordingRunner {
    pub commands: Mutex<Vec<String>>,
    pub argv: Mutex<Vec<(String, Vec<String>)>>,
    fail_on: Option<String>,
    gate: Option<Semaphore>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(fragment: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_on: Some(fragment.to_string()),
            ..Self::default()
        })
    }

    pub fn held() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn recorded(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &RollbackCommand) -> Result<CommandOutput> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        self.commands.lock().unwrap().push(command.command.clone());
        self.argv
            .lock()
            .unwrap()
            .push((command.program.clone(), command.args.clone()));
        if self
            .fail_on
            .as_deref()
            .map_or(false, |fragment| command.command.contains(fragment))
        {
            return Err(DeployError::Command(format!(
                "`{}` exited with Some(1)",
                command.command
            )));
        }
        Ok(CommandOutput {
            exit_code: Some(0),
            ..CommandOutput::default()
        })
    }
}

pub fn fast_settings() -> ServiceSettings {
    ServiceSettings {
        poll_interval: Duration::from_millis(50),
        deployment_timeout: Duration::from_secs(30),
        cache_ttl: Duration::from_secs(60),
        namespace: "default".to_string(),
    }
}

pub fn fast_hub_settings() -> HubSettings {
    HubSettings {
        heartbeat_interval: Duration::from_secs(30),
        client_buffer: 64,
        channel_buffer: 64,
        read_deadline: Duration::from_secs(5),
        ping_interval: Duration::from_secs(5),
        write_deadline: Duration::from_secs(1),
    }
}

pub struct Harness {
    pub service: Arc<DeploymentService>,
    pub storage: Storage,
    pub hub: HubHandle,
    pub cluster: Arc<FakeCluster>,
    pub runner: Arc<RecordingRunner>,
}

pub async fn harness(settings: ServiceSettings) -> Harness {
    harness_with_runner(settings, RecordingRunner::new()).await
}

pub async fn harness_with_runner(
    settings: ServiceSettings,
    runner: Arc<RecordingRunner>,
) -> Harness {
    let storage = Storage::in_memory().await.unwrap();
    storage.migrate().await.unwrap();

    let hub = StatusHub::spawn(fast_hub_settings());
    let cache = Arc::new(MemoryCache::new(settings.cache_ttl));
    let service = Arc::new(DeploymentService::new(
        Arc::new(storage.clone()),
        cache,
        StatusStreamer::new(hub.clone()),
        settings,
    ));

    let cluster = FakeCluster::new();
    let client: Arc<dyn ClusterClient> = cluster.clone();
    service.register_monitor(
        Platform::Kubernetes,
        Arc::new(KubernetesMonitor::new(client.clone(), "default")),
    );
    service.register_rollback_controller(
        Platform::Kubernetes,
        Arc::new(KubernetesRollbackController::new(
            client,
            runner.clone(),
            "default",
        )),
    );
    service.register_monitor(
        Platform::Docker,
        Arc::new(StubMonitor::new(PlatformKind::ContainerRuntime)),
    );
    service.register_rollback_controller(
        Platform::Docker,
        Arc::new(StubRollbackController::new(PlatformKind::ContainerRuntime)),
    );

    Harness {
        service,
        storage,
        hub,
        cluster,
        runner,
    }
}

pub fn request(name: &str, platform: Platform) -> DeploymentRequest {
    DeploymentRequest {
        name: name.to_string(),
        version: "v2".to_string(),
        platform,
        environment: "prod".to_string(),
        components: vec![],
        configuration: Default::default(),
        metadata: Default::default(),
    }
}

/// Polls `check` every 20ms until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// The durable record, bypassing the cache.
pub async fn stored(storage: &Storage, deployment_id: &str) -> Deployment {
    storage.get_deployment(deployment_id).await.unwrap()
}

pub fn app_state(h: &Harness) -> rollwatch::api::AppState {
    rollwatch::api::AppState {
        service: h.service.clone(),
        storage: h.storage.clone(),
        hub: h.hub.clone(),
        hub_settings: fast_hub_settings(),
    }
}
