pub mod deployment;
pub mod history;
pub mod platform_config;
pub mod update;

pub use deployment::{
    order_commands, Component, Deployment, DeploymentProgress, DeploymentRequest,
    DeploymentStatus, HealthCheck, HealthCheckType, HealthStatus, Platform, PlatformKind,
    ProgressMessage, RollbackCommand, RollbackInfo,
};
pub use history::{DeploymentFilters, DeploymentHistory, HistoryFilters};
pub use platform_config::{is_image_tag, KubernetesConfig, ResourceRefs};
pub use update::{StatusUpdate, UpdateType};
