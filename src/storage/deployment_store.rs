use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::{format_time, page, parse_time};
use crate::error::{DeployError, Result};
use crate::models::{Deployment, DeploymentFilters};

const COLUMNS: &str = "id, name, version, platform, environment, status, start_time, end_time, \
     components, configuration, progress, health_checks, error, rollback_info, metadata";

pub struct DeploymentStore {
    pool: SqlitePool,
}

impl DeploymentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Identity columns are written once; everything mutable is replaced.
    pub async fn upsert(&self, deployment: &Deployment) -> Result<()> {
        let progress = deployment
            .progress
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let rollback_info = deployment
            .rollback_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO deployments (id, name, version, platform, environment, status, start_time, end_time,
                components, configuration, progress, health_checks, error, rollback_info, metadata, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                end_time = excluded.end_time,
                components = excluded.components,
                progress = excluded.progress,
                health_checks = excluded.health_checks,
                error = excluded.error,
                rollback_info = excluded.rollback_info,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at"
        )
        .bind(&deployment.id)
        .bind(&deployment.name)
        .bind(&deployment.version)
        .bind(deployment.platform.as_str())
        .bind(&deployment.environment)
        .bind(deployment.status.as_str())
        .bind(format_time(&deployment.start_time))
        .bind(deployment.end_time.as_ref().map(format_time))
        .bind(serde_json::to_string(&deployment.components)?)
        .bind(serde_json::to_string(&deployment.configuration)?)
        .bind(progress)
        .bind(serde_json::to_string(&deployment.health_checks)?)
        .bind(&deployment.error)
        .bind(rollback_info)
        .bind(serde_json::to_string(&deployment.metadata)?)
        .bind(format_time(&chrono::Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Deployment>> {
        let row = sqlx::query(&format!("SELECT {} FROM deployments WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_deployment).transpose()
    }

    pub async fn list(&self, filters: &DeploymentFilters) -> Result<Vec<Deployment>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM deployments WHERE 1=1", COLUMNS));

        if let Some(platform) = filters.platform {
            query.push(" AND platform = ").push_bind(platform.as_str());
        }
        if let Some(environment) = &filters.environment {
            query.push(" AND environment = ").push_bind(environment.clone());
        }
        if let Some(status) = filters.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(start) = &filters.start_time {
            query.push(" AND start_time >= ").push_bind(format_time(start));
        }
        if let Some(end) = &filters.end_time {
            query.push(" AND start_time <= ").push_bind(format_time(end));
        }

        let (limit, offset) = page(filters.limit, filters.offset);
        query
            .push(" ORDER BY start_time DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_deployment).collect()
    }
}

fn row_to_deployment(row: &SqliteRow) -> Result<Deployment> {
    let platform: String = row.try_get("platform")?;
    let status: String = row.try_get("status")?;
    let end_time: Option<String> = row.try_get("end_time")?;
    let progress: Option<String> = row.try_get("progress")?;
    let rollback_info: Option<String> = row.try_get("rollback_info")?;

    Ok(Deployment {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        platform: platform.parse().map_err(decode_error)?,
        environment: row.try_get("environment")?,
        status: status.parse().map_err(decode_error)?,
        start_time: parse_time(&row.try_get::<String, _>("start_time")?)?,
        end_time: end_time.as_deref().map(parse_time).transpose()?,
        components: serde_json::from_str(&row.try_get::<String, _>("components")?)?,
        configuration: serde_json::from_str(&row.try_get::<String, _>("configuration")?)?,
        progress: progress.as_deref().map(serde_json::from_str).transpose()?,
        health_checks: serde_json::from_str(&row.try_get::<String, _>("health_checks")?)?,
        error: row.try_get("error")?,
        rollback_info: rollback_info.as_deref().map(serde_json::from_str).transpose()?,
        metadata: serde_json::from_str(&row.try_get::<String, _>("metadata")?)?,
    })
}

fn decode_error(message: String) -> DeployError {
    DeployError::Persistence(sqlx::Error::Decode(message.into()))
}
