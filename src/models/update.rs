use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kind of payload carried by a [`StatusUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Status,
    Progress,
    Health,
    Log,
    Error,
    /// Sent once to a client right after it registers.
    Connection,
    /// Hub heartbeat.
    Ping,
}

/// Real-time message pushed to hub clients. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub data: Value,
}

impl StatusUpdate {
    pub fn new(deployment_id: Option<String>, update_type: UpdateType, data: Value) -> Self {
        Self {
            deployment_id,
            timestamp: Utc::now(),
            update_type,
            data,
        }
    }

    pub fn for_deployment(deployment_id: &str, update_type: UpdateType, data: Value) -> Self {
        Self::new(Some(deployment_id.to_string()), update_type, data)
    }

    pub fn connected(deployment_id: Option<String>) -> Self {
        Self::new(
            deployment_id,
            UpdateType::Connection,
            json!({
                "status": "connected",
                "message": "Successfully connected to deployment status stream",
            }),
        )
    }

    pub fn heartbeat() -> Self {
        let now = Utc::now();
        Self {
            deployment_id: None,
            timestamp: now,
            update_type: UpdateType::Ping,
            data: json!({ "timestamp": now.timestamp() }),
        }
    }
}
