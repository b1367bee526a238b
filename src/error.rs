use http::StatusCode;
use thiserror::Error;

/// Errors produced by the idempotency engine.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad or missing setup: unknown selector, missing lock location,
    /// mutually exclusive request flags. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Idempotency key required")]
    KeyRequired,

    #[error("Could not acquire lease '{name}'")]
    LockUnavailable { name: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Settings error: {0}")]
    Config(#[from] config::ConfigError),

    /// Error returned by the downstream handler wrapped by the coordinator.
    #[error("Handler error: {0}")]
    Handler(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status the calling middleware should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::KeyRequired => StatusCode::BAD_REQUEST,
            AppError::LockUnavailable { .. }
            | AppError::Storage(_)
            | AppError::Database(_)
            | AppError::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Configuration(_)
            | AppError::Config(_)
            | AppError::Handler(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the whole request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::LockUnavailable { .. }
                | AppError::Storage(_)
                | AppError::Database(_)
                | AppError::Redis(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
