use crate::api::ApiResponse;
use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use tracing::{error, info, warn};

/// Centralized error types for consistent API error handling
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Resource already exists: {0}")]
    DuplicateResource(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

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
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::DuplicateResource(_) => StatusCode::CONFLICT,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::DatabaseError(_) | ApiError::StorageError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Convert API error to HTTP response with consistent structure and logging
    pub fn to_response_with_context(
        self,
        context: ErrorContext,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        let status = self.status();
        let message = match &self {
            ApiError::NotFound(msg) => {
                info!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "Resource not found"
                );
                context
                    .user_friendly_message
                    .unwrap_or_else(|| msg.clone())
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
            ApiError::DuplicateResource(msg) => {
                warn!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "Duplicate resource"
                );
                context
                    .user_friendly_message
                    .unwrap_or_else(|| msg.clone())
            }
            ApiError::Unauthorized(msg) => {
                warn!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    error = %self,
                    "Unauthorized request"
                );
                msg.clone()
            }
            ApiError::Forbidden(msg) => {
                warn!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "Forbidden request"
                );
                msg.clone()
            }
            ApiError::PayloadTooLarge(_) => {
                warn!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    error = %self,
                    "Request body too large"
                );
                self.to_string()
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
            ApiError::StorageError(_) => {
                error!(
                    operation = %context.operation,
                    resource_type = %context.resource_type,
                    resource_id = ?context.resource_id,
                    error = %self,
                    "File storage error"
                );
                "File storage operation failed. Please try again.".to_string()
            }
        };

        (status, Json(ApiResponse::error(message)))
    }

    /// Conversion without a handler context, used by extractor rejections
    pub fn to_response(self) -> (StatusCode, Json<ApiResponse<()>>) {
        let context = ErrorContext::new("unknown", "resource");
        self.to_response_with_context(context)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.to_response().into_response()
    }
}

/// Helper macro for structured error responses
#[macro_export]
macro_rules! api_error {
    (not_found, $operation:expr, $resource_type:expr, $id:expr) => {
        $crate::errors::ApiError::NotFound(format!("{} with id '{}' not found", $resource_type, $id))
            .to_response_with_context(
                $crate::errors::ErrorContext::new($operation, $resource_type).with_id(&$id.to_string()),
            )
    };

    (validation, $operation:expr, $resource_type:expr, $message:expr) => {
        $crate::errors::ApiError::ValidationError($message.to_string())
            .to_response_with_context($crate::errors::ErrorContext::new($operation, $resource_type))
    };
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::ValidationError(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::ValidationError(rejection.body_text())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        classify_database_error(&err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        classify_database_error(&anyhow::Error::from(err))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::StorageError(err.to_string())
    }
}

/// Map store failures onto the typed taxonomy.
///
/// Unique-constraint violations become `DuplicateResource`; a missing row becomes
/// `NotFound`; anything else stays a `DatabaseError`.
pub fn classify_database_error(error: &anyhow::Error) -> ApiError {
    if let Some(sqlx_error) = error.downcast_ref::<sqlx::Error>() {
        match sqlx_error {
            sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
                return ApiError::DuplicateResource("id already used".to_string());
            }
            sqlx::Error::RowNotFound => {
                return ApiError::NotFound("Resource not found".to_string());
            }
            _ => {}
        }
    }
    ApiError::DatabaseError(anyhow::anyhow!("{:#}", error))
}
