use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::DeployError;

/// A service error paired with the deployment it concerns.
#[derive(Debug)]
pub struct ApiError {
    pub error: DeployError,
    pub deployment_id: Option<String>,
}

impl ApiError {
    pub fn for_deployment(deployment_id: &str, error: DeployError) -> Self {
        Self {
            error,
            deployment_id: Some(deployment_id.to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match &self.error {
            DeployError::Configuration(_) | DeployError::UnsupportedPlatform(_) => {
                StatusCode::BAD_REQUEST
            }
            DeployError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployError::RollbackNotApplicable(_) => StatusCode::CONFLICT,
            DeployError::Cluster(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(error: DeployError) -> Self {
        Self {
            error,
            deployment_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(deployment = ?self.deployment_id, "Request failed: {}", self.error);
        }
        (
            status,
            Json(json!({
                "error": self.error.to_string(),
                "deployment_id": self.deployment_id,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (DeployError::Configuration("bad".into()), StatusCode::BAD_REQUEST),
            (DeployError::UnsupportedPlatform(Platform::Gcp), StatusCode::BAD_REQUEST),
            (DeployError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (DeployError::RollbackNotApplicable("no".into()), StatusCode::CONFLICT),
            (DeployError::Transient("hub".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(ApiError::from(error).status(), expected);
        }
    }
}
