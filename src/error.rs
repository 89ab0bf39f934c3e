use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;

use crate::executions::ExecutionStoreError;
use crate::storage::StorageError;

pub type AppResult<T> = Result<T, AppError>;

pub const UNAUTHORIZED_MESSAGE: &str = "Unauthorized request!";
pub const INVALID_PAYLOAD_MESSAGE: &str = "Data provided is invalid.";

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, UNAUTHORIZED_MESSAGE)
    }

    pub fn invalid_payload() -> Self {
        Self::new(StatusCode::NOT_ACCEPTABLE, INVALID_PAYLOAD_MESSAGE)
    }

    pub fn not_acceptable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_ACCEPTABLE, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        }
        let status = self.status;
        let body = Json(ErrorResponse {
            success: false,
            message: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    message: String,
}

impl From<diesel::result::Error> for AppError {
    fn from(value: diesel::result::Error) -> Self {
        match value {
            diesel::result::Error::NotFound => AppError::not_found("Resource does not exist."),
            _ => AppError::internal(value),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<StorageError> for AppError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(path) => {
                AppError::not_found(format!("Object {path} does not exist."))
            }
            other => AppError::internal(other),
        }
    }
}

impl From<ExecutionStoreError> for AppError {
    fn from(value: ExecutionStoreError) -> Self {
        AppError::internal(value)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn renders_failure_envelope() {
        let response = AppError::invalid_payload().into_response();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(
            value,
            serde_json::json!({"success": false, "message": "Data provided is invalid."})
        );
    }

    #[test]
    fn missing_object_maps_to_not_found() {
        let err: AppError = StorageError::NotFound("a/b".into()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
