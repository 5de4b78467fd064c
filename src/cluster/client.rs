use async_trait::async_trait;
use futures::Stream;
use k8s_openapi::api::apps::v1::{Deployment as KubeDeployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use std::pin::Pin;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("watch error: {0}")]
    Watch(String),
}

/// Change notification for a watched deployment resource.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// Added or modified.
    Applied(Box<KubeDeployment>),
    Deleted(Box<KubeDeployment>),
    /// Error frame sent by the API inside an open watch.
    Error(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ClusterEvent, ClusterError>> + Send>>;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KubeDeployment, ClusterError>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn list_replica_sets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ReplicaSet>, ClusterError>;

    /// `None` when the endpoints object does not exist.
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, ClusterError>;

    /// Opens a watch on a single deployment, filtered by name.
    async fn watch_deployment(&self, namespace: &str, name: &str)
        -> Result<EventStream, ClusterError>;
}
