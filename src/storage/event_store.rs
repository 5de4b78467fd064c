use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use super::{format_time, page, parse_time};
use crate::error::Result;
use crate::models::{DeploymentHistory, HistoryFilters};

/// Append-only lifecycle events. Rows are never updated or deleted.
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        deployment_id: &str,
        event: &str,
        details: Map<String, Value>,
        actor: Option<&str>,
    ) -> Result<DeploymentHistory> {
        let entry = DeploymentHistory {
            id: Uuid::new_v4().to_string(),
            deployment_id: deployment_id.to_string(),
            timestamp: Utc::now(),
            event: event.to_string(),
            details,
            actor: actor.map(str::to_string),
        };

        sqlx::query(
            "INSERT INTO deployment_history (id, deployment_id, timestamp, event, details, actor)
             VALUES (?, ?, ?, ?, ?, ?)"
        )
        .bind(&entry.id)
        .bind(&entry.deployment_id)
        .bind(format_time(&entry.timestamp))
        .bind(&entry.event)
        .bind(serde_json::to_string(&entry.details)?)
        .bind(&entry.actor)
        .execute(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Newest first.
    pub async fn list(&self, filters: &HistoryFilters) -> Result<Vec<DeploymentHistory>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, deployment_id, timestamp, event, details, actor FROM deployment_history WHERE 1=1",
        );

        if let Some(id) = &filters.deployment_id {
            query.push(" AND deployment_id = ").push_bind(id.clone());
        }
        if let Some(start) = &filters.start_time {
            query.push(" AND timestamp >= ").push_bind(format_time(start));
        }
        if let Some(end) = &filters.end_time {
            query.push(" AND timestamp <= ").push_bind(format_time(end));
        }
        if let Some(event) = &filters.event {
            query.push(" AND event = ").push_bind(event.clone());
        }

        let (limit, offset) = page(filters.limit, filters.offset);
        query
            .push(" ORDER BY timestamp DESC, rowid DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }
}

fn row_to_event(row: &SqliteRow) -> Result<DeploymentHistory> {
    Ok(DeploymentHistory {
        id: row.try_get("id")?,
        deployment_id: row.try_get("deployment_id")?,
        timestamp: parse_time(&row.try_get::<String, _>("timestamp")?)?,
        event: row.try_get("event")?,
        details: serde_json::from_str(&row.try_get::<String, _>("details")?)?,
        actor: row.try_get("actor")?,
    })
}
