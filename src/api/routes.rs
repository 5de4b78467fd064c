use axum::{
    routing::{get, post},
    Router,
};

use super::handlers;
use super::server::AppState;
use super::ws;

pub fn deployment_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/deployments",
            get(handlers::list_deployments).post(handlers::start_deployment),
        )
        .route(
            "/deployments/:id",
            get(handlers::get_deployment).delete(handlers::stop_deployment),
        )
        .route("/deployments/:id/health", get(handlers::check_health))
        .route(
            "/deployments/:id/rollback",
            post(handlers::initiate_rollback).get(handlers::get_rollback_status),
        )
        .route(
            "/deployments/:id/rollback-commands",
            get(handlers::get_rollback_commands),
        )
        .route("/deployments/:id/history", get(handlers::get_history))
        .route("/dashboard", get(handlers::dashboard))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(ws::subscribe))
}
