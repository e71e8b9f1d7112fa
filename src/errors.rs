use crate::api::ApiResponse;
use axum::{http::StatusCode, response::Json};
use std::time::Duration;
use tracing::{error, info, warn};

/// Centralized error types for consistent API error handling
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Failures of a single external grading call. These never reach the
/// student; the grader recovers with the lexical fallback score.
#[derive(Debug, thiserror::Error)]
pub enum GradingError {
    #[error("LLM API key is not configured")]
    MissingApiKey,

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM provider error: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("LLM returned an empty response")]
    EmptyResponse,

    #[error("Failed to parse LLM response: {0}")]
    Parse(String),
}

/// Error context for structured logging
#[derive(Debug)]
pub struct ErrorContext {
    pub operation: String,
    pub resource_id: Option<String>,
    pub resource_type: String,
    pub user_friendly_message: Option<String>,
}

impl ErrorContext {
    pub fn new(operation: &str, resource_type: &str) -> Self {
        Self {
            operation: operation.to_string(),
            resource_id: None,
            resource_type: resource_type.to_string(),
            user_friendly_message: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.resource_id = Some(id.to_string());
        self
    }

    pub fn with_user_message(mut self, message: &str) -> Self {
        self.user_friendly_message = Some(message.to_string());
        self
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::DatabaseError(_) | ApiError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Convert API error to HTTP response with consistent structure and logging
    pub fn to_response_with_context(
        self,
        context: ErrorContext,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        let status = self.status_code();
        let message = match &self {
            ApiError::NotFound(message) => {
                info!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "Resource not found"
                );
                context.user_friendly_message.unwrap_or_else(|| message.clone())
            }
            ApiError::ValidationError(_) => {
                warn!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "Validation error"
                );
                self.to_string()
            }
            ApiError::Unauthorized(_) | ApiError::Forbidden(_) => {
                warn!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "Access denied"
                );
                context
                    .user_friendly_message
                    .unwrap_or_else(|| match status {
                        StatusCode::UNAUTHORIZED => "Unauthorized".to_string(),
                        _ => "Forbidden".to_string(),
                    })
            }
            ApiError::DatabaseError(_) => {
                error!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "Database error"
                );
                "Database operation failed. Please try again.".to_string()
            }
            ApiError::InternalError(_) => {
                error!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "Internal server error"
                );
                "Internal server error".to_string()
            }
        };

        (status, Json(ApiResponse::error(message)))
    }

    /// Simple conversion without context
    pub fn to_response(self) -> (StatusCode, Json<ApiResponse<()>>) {
        let context = ErrorContext::new("unknown", "resource");
        self.to_response_with_context(context)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(anyhow::Error::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context_creation() {
        let context = ErrorContext::new("submit_quiz", "quiz")
            .with_id("quiz-1")
            .with_user_message("Custom message");

        assert_eq!(context.operation, "submit_quiz");
        assert_eq!(context.resource_type, "quiz");
        assert_eq!(context.resource_id, Some("quiz-1".to_string()));
        assert_eq!(
            context.user_friendly_message,
            Some("Custom message".to_string())
        );
    }

    #[test]
    fn test_api_error_responses() {
        let error = ApiError::NotFound("Quiz not found".to_string());
        let context = ErrorContext::new("submit_quiz", "quiz").with_id("quiz-1");
        let (status, Json(body)) = error.to_response_with_context(context);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error.as_deref(), Some("Quiz not found"));
        assert!(!body.success);

        let (status, _) = ApiError::ValidationError("bad".to_string()).to_response();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = ApiError::Unauthorized("no session".to_string()).to_response();
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = ApiError::Forbidden("student".to_string()).to_response();
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, Json(body)) =
            ApiError::DatabaseError(anyhow::anyhow!("disk full")).to_response();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        // internals stay out of the response body
        assert!(!body.error.unwrap_or_default().contains("disk full"));
    }

    #[test]
    fn test_grading_error_messages() {
        let err = GradingError::Timeout(Duration::from_secs(25));
        assert!(err.to_string().contains("25s"));
        assert_eq!(
            GradingError::MissingApiKey.to_string(),
            "LLM API key is not configured"
        );
    }
}
