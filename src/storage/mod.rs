pub mod cache;
pub mod deployment_store;
pub mod event_store;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::sync::Arc;

use crate::error::{DeployError, Result};
use crate::models::{Deployment, DeploymentFilters, DeploymentHistory, HistoryFilters};

use self::deployment_store::DeploymentStore;
use self::event_store::EventStore;

pub use cache::{CacheLookup, MemoryCache, SnapshotCache};

/// Durable record of deployments and their lifecycle events.
#[async_trait]
pub trait HistoryManager: Send + Sync {
    /// Inserts or replaces the stored snapshot of a deployment.
    async fn record_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn record_event(
        &self,
        deployment_id: &str,
        event: &str,
        details: Map<String, Value>,
        actor: Option<&str>,
    ) -> Result<DeploymentHistory>;

    async fn get_history(&self, filters: &HistoryFilters) -> Result<Vec<DeploymentHistory>>;

    /// Fails with `NotFound` for unknown ids.
    async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment>;

    async fn get_deployments(&self, filters: &DeploymentFilters) -> Result<Vec<Deployment>>;
}

#[derive(Clone)]
pub struct Storage {
    pub pool: Arc<SqlitePool>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Single-connection in-memory database. The connection is never
    /// recycled, otherwise the data would vanish with it.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&*self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&*self.pool).await?;
        Ok(())
    }

    pub fn deployments(&self) -> DeploymentStore {
        DeploymentStore::new((*self.pool).clone())
    }

    pub fn events(&self) -> EventStore {
        EventStore::new((*self.pool).clone())
    }
}

#[async_trait]
impl HistoryManager for Storage {
    async fn record_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.deployments().upsert(deployment).await
    }

    async fn record_event(
        &self,
        deployment_id: &str,
        event: &str,
        details: Map<String, Value>,
        actor: Option<&str>,
    ) -> Result<DeploymentHistory> {
        self.events().record(deployment_id, event, details, actor).await
    }

    async fn get_history(&self, filters: &HistoryFilters) -> Result<Vec<DeploymentHistory>> {
        self.events().list(filters).await
    }

    async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment> {
        self.deployments()
            .get(deployment_id)
            .await?
            .ok_or_else(|| DeployError::not_found("deployment", deployment_id))
    }

    async fn get_deployments(&self, filters: &DeploymentFilters) -> Result<Vec<Deployment>> {
        self.deployments().list(filters).await
    }
}

/// Fixed-precision UTC text so that string order matches time order.
pub(crate) fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DeployError::Persistence(sqlx::Error::Decode(Box::new(e))))
}

/// SQLite treats a negative LIMIT as "no limit".
pub(crate) fn page(limit: Option<u32>, offset: Option<u32>) -> (i64, i64) {
    let limit = match limit {
        Some(0) | None => -1,
        Some(n) => n as i64,
    };
    (limit, offset.unwrap_or(0) as i64)
}
