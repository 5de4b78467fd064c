use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a tracked deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Preparing,
    Deploying,
    Verifying,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Deploying => "deploying",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Terminal states end the reconciliation loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Preparing | Self::Deploying | Self::Verifying)
    }

    /// States from which a rollback may be started.
    pub fn allows_rollback(&self) -> bool {
        matches!(
            self,
            Self::Deploying | Self::Verifying | Self::Completed | Self::Failed
        )
    }

    /// Forward edges of the lifecycle plus the rollback branch.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        match (self, next) {
            (Pending, Preparing) | (Pending, Failed) => true,
            (Preparing, Deploying) | (Preparing, Failed) => true,
            (Deploying, Verifying) | (Deploying, Failed) => true,
            (Verifying, Completed) | (Verifying, Failed) => true,
            (RollingBack, RolledBack) | (RollingBack, Failed) => true,
            (from, RollingBack) => from.allows_rollback(),
            _ => false,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "preparing" => Ok(Self::Preparing),
            "deploying" => Ok(Self::Deploying),
            "verifying" => Ok(Self::Verifying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rolling_back" => Ok(Self::RollingBack),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(format!("unknown deployment status: {}", other)),
        }
    }
}

/// Target runtime platform of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Kubernetes,
    Docker,
    DockerCompose,
    Aws,
    Gcp,
    Azure,
}

/// Families of platforms sharing a monitor implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformKind {
    Cluster,
    ContainerRuntime,
    Cloud,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::Docker => "docker",
            Self::DockerCompose => "docker-compose",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        }
    }

    pub fn kind(&self) -> PlatformKind {
        match self {
            Self::Kubernetes => PlatformKind::Cluster,
            Self::Docker | Self::DockerCompose => PlatformKind::ContainerRuntime,
            Self::Aws | Self::Gcp | Self::Azure => PlatformKind::Cloud,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kubernetes" => Ok(Self::Kubernetes),
            "docker" => Ok(Self::Docker),
            "docker-compose" => Ok(Self::DockerCompose),
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub version: String,
    pub platform: Platform,
    pub environment: String,
    pub status: DeploymentStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub configuration: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<DeploymentProgress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_info: Option<RollbackInfo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Deployment {
    pub fn new(request: DeploymentRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            version: request.version,
            platform: request.platform,
            environment: request.environment,
            status: DeploymentStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            components: request.components,
            configuration: request.configuration,
            progress: None,
            health_checks: Vec::new(),
            error: None,
            rollback_info: None,
            metadata: request.metadata,
        }
    }

    /// Applies `next` if the lifecycle permits it. Returns whether the
    /// status changed.
    pub fn transition(&mut self, next: DeploymentStatus) -> bool {
        if self.status == next || !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() && self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
        self.normalize_progress();
        true
    }

    /// Moves the deployment to `Failed` with the given reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        let changed = self.transition(DeploymentStatus::Failed);
        if changed {
            self.error = Some(reason.into());
        }
        changed
    }

    pub fn set_progress(&mut self, progress: DeploymentProgress) {
        self.progress = Some(progress);
        self.normalize_progress();
    }

    /// Keeps the percentage within bounds and at 100 only once completed.
    pub fn normalize_progress(&mut self) {
        let completed = self.status == DeploymentStatus::Completed;
        if let Some(progress) = self.progress.as_mut() {
            progress.percentage = if completed {
                100.0
            } else if progress.percentage.is_nan() {
                0.0
            } else {
                progress.percentage.clamp(0.0, MAX_INCOMPLETE_PERCENTAGE)
            };
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Highest percentage reported for a deployment that has not completed.
pub const MAX_INCOMPLETE_PERCENTAGE: f64 = 99.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Component {
    pub name: String,
    #[serde(rename = "type", default)]
    pub component_type: String,
    pub version: String,
    #[serde(default = "default_component_status")]
    pub status: DeploymentStatus,
    #[serde(default = "Utc::now")]
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

fn default_component_status() -> DeploymentStatus {
    DeploymentStatus::Pending
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentProgress {
    pub total_steps: u32,
    pub current_step: u32,
    pub current_stage: String,
    pub percentage: f64,
    #[serde(default)]
    pub messages: Vec<ProgressMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressMessage {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    Readiness,
    Liveness,
    Startup,
    Custom,
}

impl HealthCheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Readiness => "readiness",
            Self::Liveness => "liveness",
            Self::Startup => "startup",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Degraded => "degraded",
            Self::Unknown => "unknown",
        }
    }

    /// Rolls a set of checks up into a single status.
    pub fn overall(checks: &[HealthCheck]) -> HealthStatus {
        if checks.is_empty() {
            return HealthStatus::Unknown;
        }
        if checks.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: HealthCheckType,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_checked: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl HealthCheck {
    pub fn new(name: impl Into<String>, check_type: HealthCheckType) -> Self {
        Self {
            name: name.into(),
            check_type,
            status: HealthStatus::Unknown,
            message: String::new(),
            last_checked: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_status(mut self, status: HealthStatus, message: impl Into<String>) -> Self {
        self.status = status;
        self.message = message.into();
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackInfo {
    pub target_version: String,
    pub target_deployment_id: String,
    pub reason: String,
    pub initiated_by: String,
    pub initiated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub commands: Vec<RollbackCommand>,
}

impl RollbackInfo {
    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Records the outcome. A finished rollback is never reopened.
    pub fn finish(&mut self, status: DeploymentStatus) {
        if !self.is_finished() {
            self.status = status;
            self.completed_at = Some(Utc::now());
        }
    }
}

/// One rollback step. `program` and `args` are executed directly, never
/// through a shell; `command` is their display form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackCommand {
    pub platform: Platform,
    pub command: String,
    pub program: String,
    pub args: Vec<String>,
    pub description: String,
    pub order: u32,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl RollbackCommand {
    pub fn new(
        platform: Platform,
        order: u32,
        program: &str,
        args: Vec<String>,
        description: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let command = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            platform,
            command,
            program: program.to_string(),
            args,
            description: description.into(),
            order,
            timeout,
        }
    }
}

/// Sorts commands by `order` and rejects duplicate positions.
pub fn order_commands(mut commands: Vec<RollbackCommand>) -> Result<Vec<RollbackCommand>, String> {
    commands.sort_by_key(|c| c.order);
    if let Some(pair) = commands.windows(2).find(|w| w[0].order == w[1].order) {
        return Err(format!("duplicate rollback command order {}", pair[0].order));
    }
    Ok(commands)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Body of `POST /deployments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub name: String,
    pub version: String,
    pub platform: Platform,
    pub environment: String,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub configuration: Map<String, Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DeploymentRequest {
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("name", &self.name),
            ("version", &self.version),
            ("environment", &self.environment),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} is required", field));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeploymentRequest {
        DeploymentRequest {
            name: "api".to_string(),
            version: "v2".to_string(),
            platform: Platform::Kubernetes,
            environment: "prod".to_string(),
            components: vec![],
            configuration: Map::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_lifecycle_forward_path() {
        let mut d = Deployment::new(request());
        assert!(d.transition(DeploymentStatus::Preparing));
        assert!(d.transition(DeploymentStatus::Deploying));
        assert!(d.transition(DeploymentStatus::Verifying));
        assert!(d.end_time.is_none());
        assert!(d.transition(DeploymentStatus::Completed));
        assert!(d.end_time.is_some());
    }

    #[test]
    fn test_rejects_skipping_verification() {
        let mut d = Deployment::new(request());
        d.transition(DeploymentStatus::Preparing);
        d.transition(DeploymentStatus::Deploying);
        assert!(!d.transition(DeploymentStatus::Completed));
        assert_eq!(d.status, DeploymentStatus::Deploying);
        assert!(!d.transition(DeploymentStatus::Pending));
    }

    #[test]
    fn test_end_time_set_once() {
        let mut d = Deployment::new(request());
        d.transition(DeploymentStatus::Preparing);
        d.transition(DeploymentStatus::Deploying);
        d.transition(DeploymentStatus::Verifying);
        d.transition(DeploymentStatus::Completed);
        let first_end = d.end_time;
        assert!(d.transition(DeploymentStatus::RollingBack));
        assert!(d.transition(DeploymentStatus::RolledBack));
        assert_eq!(d.end_time, first_end);
    }

    #[test]
    fn test_rollback_not_allowed_from_pending() {
        assert!(!DeploymentStatus::Pending.can_transition_to(DeploymentStatus::RollingBack));
        assert!(!DeploymentStatus::RolledBack.can_transition_to(DeploymentStatus::RollingBack));
        assert!(DeploymentStatus::Failed.can_transition_to(DeploymentStatus::RollingBack));
    }

    #[test]
    fn test_percentage_only_full_when_completed() {
        let mut d = Deployment::new(request());
        d.transition(DeploymentStatus::Preparing);
        d.transition(DeploymentStatus::Deploying);
        d.set_progress(DeploymentProgress {
            total_steps: 3,
            current_step: 3,
            current_stage: "Deployment complete".to_string(),
            percentage: 100.0,
            messages: vec![],
        });
        assert_eq!(d.progress.as_ref().unwrap().percentage, MAX_INCOMPLETE_PERCENTAGE);

        d.transition(DeploymentStatus::Verifying);
        d.transition(DeploymentStatus::Completed);
        assert_eq!(d.progress.as_ref().unwrap().percentage, 100.0);
    }

    #[test]
    fn test_order_commands_detects_duplicates() {
        let cmd = |order| {
            RollbackCommand::new(Platform::Kubernetes, order, "true", vec![], "", Duration::from_secs(1))
        };
        let sorted = order_commands(vec![cmd(3), cmd(1), cmd(2)]).unwrap();
        assert_eq!(sorted.iter().map(|c| c.order).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(order_commands(vec![cmd(1), cmd(1)]).is_err());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeploymentStatus::RollingBack).unwrap(),
            "\"rolling_back\""
        );
        assert_eq!(
            serde_json::to_string(&Platform::DockerCompose).unwrap(),
            "\"docker-compose\""
        );
        assert_eq!("rolled_back".parse::<DeploymentStatus>(), Ok(DeploymentStatus::RolledBack));
    }

    #[test]
    fn test_overall_health() {
        let ok = HealthCheck::new("a", HealthCheckType::Readiness).with_status(HealthStatus::Healthy, "");
        let degraded = HealthCheck::new("b", HealthCheckType::Custom).with_status(HealthStatus::Degraded, "");
        let bad = HealthCheck::new("c", HealthCheckType::Liveness).with_status(HealthStatus::Unhealthy, "");
        assert_eq!(HealthStatus::overall(&[]), HealthStatus::Unknown);
        assert_eq!(HealthStatus::overall(&[ok.clone()]), HealthStatus::Healthy);
        assert_eq!(HealthStatus::overall(&[ok.clone(), degraded.clone()]), HealthStatus::Degraded);
        assert_eq!(HealthStatus::overall(&[ok, degraded, bad]), HealthStatus::Unhealthy);
    }
}
