use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use std::time::Duration;

use super::error::ApiError;
use super::server::AppState;
use crate::models::{
    Deployment, DeploymentFilters, DeploymentHistory, DeploymentRequest, HealthCheck,
    HistoryFilters, RollbackCommand, RollbackInfo,
};
use crate::service::DashboardMetrics;

type ApiResult<T> = Result<Json<T>, ApiError>;

const DEFAULT_DASHBOARD_RANGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    #[serde(default)]
    pub reason: String,
    pub target_version: Option<String>,
    pub initiated_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackCommandsQuery {
    pub target_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DashboardQuery {
    pub range_secs: Option<u64>,
}

pub async fn start_deployment(
    State(state): State<AppState>,
    Json(request): Json<DeploymentRequest>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    let deployment = state.service.start_deployment(request).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

pub async fn list_deployments(
    State(state): State<AppState>,
    Query(filters): Query<DeploymentFilters>,
) -> ApiResult<Vec<Deployment>> {
    Ok(Json(state.service.get_deployments(&filters).await?))
}

pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Deployment> {
    state
        .service
        .get_deployment_status(&id)
        .await
        .map(Json)
        .map_err(|e| ApiError::for_deployment(&id, e))
}

pub async fn stop_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Deployment> {
    state
        .service
        .stop_deployment(&id)
        .await
        .map(Json)
        .map_err(|e| ApiError::for_deployment(&id, e))
}

pub async fn check_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<HealthCheck>> {
    state
        .service
        .check_deployment_health(&id)
        .await
        .map(Json)
        .map_err(|e| ApiError::for_deployment(&id, e))
}

pub async fn initiate_rollback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Result<(StatusCode, Json<RollbackInfo>), ApiError> {
    let rollback = state
        .service
        .initiate_rollback(
            &id,
            &request.reason,
            request.target_version.as_deref(),
            request.initiated_by.as_deref(),
        )
        .await
        .map_err(|e| ApiError::for_deployment(&id, e))?;
    Ok((StatusCode::ACCEPTED, Json(rollback)))
}

pub async fn get_rollback_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<RollbackInfo> {
    state
        .service
        .get_rollback_status(&id)
        .await
        .map(Json)
        .map_err(|e| ApiError::for_deployment(&id, e))
}

pub async fn get_rollback_commands(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RollbackCommandsQuery>,
) -> ApiResult<Vec<RollbackCommand>> {
    state
        .service
        .get_rollback_commands(&id, query.target_version.as_deref())
        .await
        .map(Json)
        .map_err(|e| ApiError::for_deployment(&id, e))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(mut filters): Query<HistoryFilters>,
) -> ApiResult<Vec<DeploymentHistory>> {
    filters.deployment_id = Some(id.clone());
    state
        .service
        .get_deployment_history(&filters)
        .await
        .map(Json)
        .map_err(|e| ApiError::for_deployment(&id, e))
}

pub async fn dashboard(
    State(state): State<AppState>,
    Query(query): Query<DashboardQuery>,
) -> ApiResult<DashboardMetrics> {
    let range = query
        .range_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_DASHBOARD_RANGE);
    Ok(Json(state.service.dashboard_metrics(range).await?))
}

pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let body = state.service.prometheus_metrics().await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
