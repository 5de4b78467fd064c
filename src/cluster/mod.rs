//! Minimal cluster API surface used by the Kubernetes monitor and rollback
//! controller.

pub mod client;
pub mod http;

pub use client::{ClusterClient, ClusterError, ClusterEvent, EventStream};
pub use http::HttpClusterClient;

pub use k8s_openapi::api::apps::v1::{Deployment as KubeDeployment, ReplicaSet};
pub use k8s_openapi::api::core::v1::{Endpoints, Pod};
