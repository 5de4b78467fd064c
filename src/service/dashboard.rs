//! Aggregated views over stored deployments: dashboard summaries and the
//! Prometheus text exposition.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;

use super::DeploymentService;
use crate::error::Result;
use crate::models::{
    Deployment, DeploymentFilters, DeploymentStatus, HealthStatus, Platform,
};

const RECENT_LIMIT: usize = 10;
const QUERY_LIMIT: u32 = 1000;
const PROMETHEUS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DashboardMetrics {
    pub range_secs: u64,
    pub generated_at: DateTime<Utc>,
    pub total_deployments: usize,
    pub active_deployments: usize,
    pub successful_deployments: usize,
    pub failed_deployments: usize,
    pub rolled_back_deployments: usize,
    /// Mean duration of completed deployments.
    pub average_deployment_secs: Option<f64>,
    pub deployments_by_platform: BTreeMap<String, usize>,
    pub deployments_by_environment: BTreeMap<String, usize>,
    pub recent_deployments: Vec<DeploymentSummary>,
    pub health_summary: BTreeMap<String, HealthSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeploymentSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub platform: Platform,
    pub environment: String,
    pub status: DeploymentStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    pub progress: f64,
    pub health_status: HealthStatus,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthSummary {
    pub total_checks: usize,
    pub healthy_checks: usize,
    pub unhealthy_checks: usize,
    pub degraded_checks: usize,
    pub overall_status: HealthStatus,
    pub last_checked: Option<DateTime<Utc>>,
}

fn seconds(deployment: &Deployment) -> Option<f64> {
    deployment
        .duration()
        .map(|d| d.num_milliseconds() as f64 / 1000.0)
}

/// Builds dashboard metrics from deployments ordered newest first.
pub fn summarize(deployments: &[Deployment], range: Duration) -> DashboardMetrics {
    let mut metrics = DashboardMetrics {
        range_secs: range.as_secs(),
        generated_at: Utc::now(),
        total_deployments: deployments.len(),
        active_deployments: 0,
        successful_deployments: 0,
        failed_deployments: 0,
        rolled_back_deployments: 0,
        average_deployment_secs: None,
        deployments_by_platform: BTreeMap::new(),
        deployments_by_environment: BTreeMap::new(),
        recent_deployments: Vec::new(),
        health_summary: BTreeMap::new(),
    };

    let mut completed_secs = Vec::new();
    for deployment in deployments {
        match deployment.status {
            DeploymentStatus::Completed => metrics.successful_deployments += 1,
            DeploymentStatus::Failed => metrics.failed_deployments += 1,
            DeploymentStatus::RolledBack => metrics.rolled_back_deployments += 1,
            status if status.is_active() => metrics.active_deployments += 1,
            _ => {}
        }
        *metrics
            .deployments_by_platform
            .entry(deployment.platform.to_string())
            .or_default() += 1;
        *metrics
            .deployments_by_environment
            .entry(deployment.environment.clone())
            .or_default() += 1;

        if deployment.status == DeploymentStatus::Completed {
            completed_secs.extend(seconds(deployment));
        }

        if metrics.recent_deployments.len() < RECENT_LIMIT {
            metrics.recent_deployments.push(DeploymentSummary {
                id: deployment.id.clone(),
                name: deployment.name.clone(),
                version: deployment.version.clone(),
                platform: deployment.platform,
                environment: deployment.environment.clone(),
                status: deployment.status,
                start_time: deployment.start_time,
                duration_secs: seconds(deployment),
                progress: deployment.progress.as_ref().map_or(0.0, |p| p.percentage),
                health_status: HealthStatus::overall(&deployment.health_checks),
            });
        }

        let checks = &deployment.health_checks;
        if !checks.is_empty() {
            let count = |status: HealthStatus| checks.iter().filter(|c| c.status == status).count();
            metrics.health_summary.insert(
                deployment.id.clone(),
                HealthSummary {
                    total_checks: checks.len(),
                    healthy_checks: count(HealthStatus::Healthy),
                    unhealthy_checks: count(HealthStatus::Unhealthy),
                    degraded_checks: count(HealthStatus::Degraded),
                    overall_status: HealthStatus::overall(checks),
                    last_checked: checks.iter().map(|c| c.last_checked).max(),
                },
            );
        }
    }

    if !completed_secs.is_empty() {
        metrics.average_deployment_secs =
            Some(completed_secs.iter().sum::<f64>() / completed_secs.len() as f64);
    }
    metrics
}

type Labels = BTreeMap<&'static str, String>;

fn base_labels(deployment: &Deployment) -> Labels {
    BTreeMap::from([
        ("environment", deployment.environment.clone()),
        ("platform", deployment.platform.to_string()),
        ("version", deployment.version.clone()),
    ])
}

fn render_labels(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(name, value)| {
            let escaped = value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n");
            format!("{}=\"{}\"", name, escaped)
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn health_value(status: HealthStatus) -> i32 {
    match status {
        HealthStatus::Healthy => 1,
        HealthStatus::Degraded => 2,
        HealthStatus::Unhealthy => 0,
        HealthStatus::Unknown => -1,
    }
}

/// Prometheus text exposition. Series are sorted by label set so output is
/// stable for identical input.
pub fn render_prometheus(deployments: &[Deployment]) -> String {
    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    let mut durations: BTreeMap<String, f64> = BTreeMap::new();
    let mut statuses: BTreeMap<String, u64> = BTreeMap::new();
    let mut health: BTreeMap<String, u64> = BTreeMap::new();
    let mut rollbacks: BTreeMap<String, u64> = BTreeMap::new();

    for deployment in deployments {
        let labels = base_labels(deployment);
        let key = render_labels(&labels);
        *totals.entry(key.clone()).or_default() += 1;

        let mut with_status = labels.clone();
        with_status.insert("status", deployment.status.to_string());
        *statuses.entry(render_labels(&with_status)).or_default() += 1;

        if deployment.status == DeploymentStatus::Completed {
            if let Some(secs) = seconds(deployment) {
                durations.insert(key.clone(), secs);
            }
        }

        for check in &deployment.health_checks {
            let mut with_check = labels.clone();
            with_check.insert("check_type", check.check_type.as_str().to_string());
            with_check.insert("status", check.status.as_str().to_string());
            *health.entry(render_labels(&with_check)).or_default() += 1;
        }

        if deployment.status == DeploymentStatus::RolledBack {
            *rollbacks.entry(key).or_default() += 1;
        }
    }

    let mut out = String::new();
    let mut family = |name: &str, help: &str, kind: &str, series: Vec<(String, String)>| {
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} {}", name, kind);
        for (labels, value) in series {
            let _ = writeln!(out, "{}{{{}}} {}", name, labels, value);
        }
    };

    let counts = |map: BTreeMap<String, u64>| {
        map.into_iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect::<Vec<_>>()
    };
    family(
        "deployment_total",
        "Total number of deployments",
        "counter",
        counts(totals),
    );
    family(
        "deployment_duration_seconds",
        "Duration of deployments in seconds",
        "gauge",
        durations
            .into_iter()
            .map(|(k, v)| (k, format!("{:.2}", v)))
            .collect(),
    );
    family(
        "deployment_status",
        "Current deployment status",
        "gauge",
        counts(statuses),
    );
    family(
        "deployment_health_check_status",
        "Health check status",
        "gauge",
        counts(health),
    );
    family(
        "deployment_rollback_total",
        "Total number of rollbacks",
        "counter",
        counts(rollbacks),
    );
    out
}

impl DeploymentService {
    pub async fn dashboard_metrics(&self, range: Duration) -> Result<DashboardMetrics> {
        let deployments = self.recent_deployments(range).await?;
        Ok(summarize(&deployments, range))
    }

    pub async fn prometheus_metrics(&self) -> Result<String> {
        let deployments = self.recent_deployments(PROMETHEUS_WINDOW).await?;
        Ok(render_prometheus(&deployments))
    }

    async fn recent_deployments(&self, range: Duration) -> Result<Vec<Deployment>> {
        let end = Utc::now();
        let start = chrono::Duration::from_std(range)
            .ok()
            .and_then(|range| end.checked_sub_signed(range))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.get_deployments(&DeploymentFilters {
            start_time: Some(start),
            end_time: Some(end),
            limit: Some(QUERY_LIMIT),
            ..DeploymentFilters::default()
        })
        .await
    }
}
