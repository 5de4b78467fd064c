use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;

use rollwatch::{
    api::{start_server, AppState},
    cluster::{ClusterClient, HttpClusterClient},
    config::{HubSettings, ServiceSettings},
    hub::{StatusHub, StatusStreamer},
    models::Platform,
    platform::{
        CommandRunner, KubernetesMonitor, KubernetesRollbackController, ProcessCommandRunner,
        StubMonitor, StubRollbackController,
    },
    storage::MemoryCache,
    DeploymentService, Storage,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tracks deployments on Kubernetes and streams their progress.
#[derive(Debug, Parser)]
#[command(name = "rollwatch", version)]
struct Cli {
    /// Address the HTTP and WebSocket API binds to.
    #[arg(long, env = "ROLLWATCH_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    #[arg(long, env = "ROLLWATCH_DATABASE_URL", default_value = "sqlite:rollwatch.db?mode=rwc")]
    database_url: String,

    /// Kubernetes API base URL, e.g. a local `kubectl proxy`.
    #[arg(long, env = "ROLLWATCH_KUBE_API", default_value = "http://127.0.0.1:8001")]
    kube_api: String,

    #[arg(long, env = "ROLLWATCH_KUBE_TOKEN", hide_env_values = true)]
    kube_token: Option<String>,

    /// Namespace used when a deployment does not name one.
    #[arg(long, env = "ROLLWATCH_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Register placeholder monitors for container-runtime and cloud platforms.
    #[arg(long, env = "ROLLWATCH_STUB_PLATFORMS")]
    stub_platforms: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rollwatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!("Starting rollwatch");

    let storage = Storage::new(&cli.database_url).await?;
    tracing::info!("Running database migrations");
    storage.migrate().await?;

    let settings = ServiceSettings {
        namespace: cli.namespace.clone(),
        ..ServiceSettings::default()
    };
    let hub_settings = HubSettings::default();
    let hub = StatusHub::spawn(hub_settings.clone());
    let cache = Arc::new(MemoryCache::new(settings.cache_ttl));
    let sweeper = cache.clone();
    let sweep_every = settings.cache_ttl;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            let purged = sweeper.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "Evicted expired deployment snapshots");
            }
        }
    });
    let service = Arc::new(DeploymentService::new(
        Arc::new(storage.clone()),
        cache,
        StatusStreamer::new(hub.clone()),
        settings,
    ));

    let cluster: Arc<dyn ClusterClient> =
        Arc::new(HttpClusterClient::new(cli.kube_api.clone(), cli.kube_token.clone()));
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessCommandRunner);
    service.register_monitor(
        Platform::Kubernetes,
        Arc::new(KubernetesMonitor::new(cluster.clone(), cli.namespace.clone())),
    );
    service.register_rollback_controller(
        Platform::Kubernetes,
        Arc::new(KubernetesRollbackController::new(
            cluster,
            runner,
            cli.namespace.clone(),
        )),
    );

    if cli.stub_platforms {
        for platform in [
            Platform::Docker,
            Platform::DockerCompose,
            Platform::Aws,
            Platform::Gcp,
            Platform::Azure,
        ] {
            let kind = platform.kind();
            service.register_monitor(platform, Arc::new(StubMonitor::new(kind)));
            service.register_rollback_controller(platform, Arc::new(StubRollbackController::new(kind)));
        }
        tracing::info!("Registered placeholder monitors for container and cloud platforms");
    }

    let state = AppState {
        service,
        storage,
        hub,
        hub_settings,
    };
    start_server(state, cli.listen).await?;

    Ok(())
}
