use http::StatusCode;
use thiserror::Error;

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Idempotency key '{key}' reused for '{operation}' with a different request body (stored {existing_hash}, received {requested_hash})")]
    IdempotencyConflict {
        key: String,
        operation: String,
        existing_hash: String,
        requested_hash: String,
    },

    #[error("Idempotency record not found for key '{key}' and operation '{operation}'")]
    RecordNotFound { key: String, operation: String },

    #[error("Request with key '{key}' for '{operation}' is still being processed")]
    RequestInProgress { key: String, operation: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Outbound request to '{url}' blocked: {reason}")]
    UnsafeUrl { url: String, reason: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn conflict(
        key: impl Into<String>,
        operation: impl Into<String>,
        existing_hash: impl Into<String>,
        requested_hash: impl Into<String>,
    ) -> Self {
        Self::IdempotencyConflict {
            key: key.into(),
            operation: operation.into(),
            existing_hash: existing_hash.into(),
            requested_hash: requested_hash.into(),
        }
    }

    pub fn not_found(key: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::RecordNotFound {
            key: key.into(),
            operation: operation.into(),
        }
    }

    /// Returns true if the caller may retry the whole request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::StorageUnavailable(_) | AppError::Database(_) | AppError::Redis(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::IdempotencyConflict { .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::IdempotencyConflict { .. } | AppError::RequestInProgress { .. } => {
                StatusCode::CONFLICT
            }
            AppError::RecordNotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::UnsafeUrl { .. } => StatusCode::FORBIDDEN,
            e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for API error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            AppError::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            AppError::RequestInProgress { .. } => "REQUEST_IN_PROGRESS",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::StorageUnavailable(_) | AppError::Database(_) | AppError::Redis(_) => {
                "STORAGE_UNAVAILABLE"
            }
            AppError::Config(_) => "CONFIGURATION_ERROR",
            AppError::UnsafeUrl { .. } => "UNSAFE_URL",
            AppError::Http(_) => "UPSTREAM_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
