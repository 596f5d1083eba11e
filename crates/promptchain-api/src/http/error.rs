//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use promptchain_core::workflow::EngineError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Errors surfaced by the execution controller.
    Engine(EngineError),
    /// Malformed request.
    Validation(String),
    /// Generic internal error.
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl AppError {
    /// HTTP status and machine-readable code for this error.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Engine(e) => match e {
                EngineError::WorkflowNotFound(_) | EngineError::ExecutionNotFound(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                }
                EngineError::EmptyWorkflow(_) | EngineError::InvalidDefinition(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                }
                EngineError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
                EngineError::ImmutableDefinition(_) | EngineError::RunInProgress { .. } => {
                    (StatusCode::CONFLICT, "CONFLICT")
                }
                EngineError::LeaseUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
                }
                EngineError::ProviderTransport { .. } => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
                EngineError::Checkpoint(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Engine(e) => e.to_string(),
            AppError::Validation(msg) | AppError::Internal(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.message();

        if status.is_server_error() {
            tracing::error!(code, error = message.as_str(), "request failed");
        }

        let mut response =
            ApiResponse::error(code, &message, uuid::Uuid::now_v7().to_string(), 0).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptchain_types::workflow::ExecutionStatus;
    use uuid::Uuid;

    #[test]
    fn test_not_found_mapping() {
        let err = AppError::from(EngineError::ExecutionNotFound(Uuid::now_v7()));
        assert_eq!(err.status_and_code(), (StatusCode::NOT_FOUND, "NOT_FOUND"));
    }

    #[test]
    fn test_invalid_state_is_conflict() {
        let err = AppError::from(EngineError::InvalidState {
            execution_id: Uuid::now_v7(),
            status: ExecutionStatus::Running,
            reason: "only paused executions can be approved".to_string(),
        });
        assert_eq!(err.status_and_code(), (StatusCode::CONFLICT, "INVALID_STATE"));
        assert!(err.message().contains("is running"));
    }

    #[test]
    fn test_lease_unavailable_is_503() {
        let err = AppError::from(EngineError::LeaseUnavailable(Uuid::now_v7()));
        assert_eq!(err.status_and_code().0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_into_response_status() {
        let resp = AppError::Validation("bad".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = AppError::from(EngineError::EmptyWorkflow("w".to_string())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
