mod monitor;
mod rollback;

pub use monitor::{calculate_progress, derive_status, KubernetesMonitor};
pub use rollback::KubernetesRollbackController;

use crate::error::{DeployError, Result};
use crate::models::{Deployment, KubernetesConfig, ResourceRefs};

/// Cluster object names for a deployment, validated from its configuration.
pub(crate) fn resolve_refs(deployment: &Deployment, namespace: &str) -> Result<ResourceRefs> {
    let config = KubernetesConfig::validated(
        &deployment.name,
        &deployment.version,
        &deployment.configuration,
    )
    .map_err(DeployError::Configuration)?;
    Ok(config.resolve(deployment, namespace))
}
