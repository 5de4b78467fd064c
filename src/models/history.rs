use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{DeploymentStatus, Platform};

/// One append-only lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentHistory {
    pub id: String,
    pub deployment_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryFilters {
    pub deployment_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub event: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentFilters {
    pub platform: Option<Platform>,
    pub environment: Option<String>,
    pub status: Option<DeploymentStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}
