//! Error taxonomy for deployment tracking.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::models::Platform;

pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(Platform),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot rollback: {0}")]
    RollbackNotApplicable(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Terminal(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeployError {
    pub fn not_found(what: &str, id: &str) -> Self {
        Self::NotFound(format!("{} {}", what, id))
    }

    /// Failures the caller may retry or tolerate in degraded mode.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Cluster(_))
    }
}
