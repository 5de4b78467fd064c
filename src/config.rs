//! Runtime settings shared by the service, hub and API.

use std::time::Duration;

/// Timing knobs for reconciliation and caching.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// How often each reconciliation loop polls its monitor.
    pub poll_interval: Duration,
    /// Hard deadline measured from a deployment's start time.
    pub deployment_timeout: Duration,
    /// Lifetime of cached deployment snapshots.
    pub cache_ttl: Duration,
    /// Default namespace for cluster resources.
    pub namespace: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            deployment_timeout: Duration::from_secs(30 * 60),
            cache_ttl: Duration::from_secs(5 * 60),
            namespace: "default".to_string(),
        }
    }
}

/// Status hub and WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub heartbeat_interval: Duration,
    /// Outbound buffer per client; updates beyond it are dropped.
    pub client_buffer: usize,
    /// Buffer of the register, unregister, subscribe and broadcast channels.
    pub channel_buffer: usize,
    pub read_deadline: Duration,
    pub ping_interval: Duration,
    pub write_deadline: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            client_buffer: 50,
            channel_buffer: 256,
            read_deadline: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_deadline: Duration::from_secs(10),
        }
    }
}
