//! Error types for the Comet backend
//!
//! All errors in the application are converted to `AppError`.
//! The upstream client keeps its own error type (`crate::reddit::Error`)
//! because workers branch on revocation and rate-limit outcomes.

use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Expected absence of an entity; callers treat this silently
    #[error("Resource not found")]
    NotFound,

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis error (locks or queues)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Upstream API error
    #[error("Upstream error: {0}")]
    Upstream(#[from] crate::reddit::Error),

    /// APNs delivery error
    #[error("APNs error: {0}")]
    Apns(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed queue payload or entity state
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// True for absences that are part of normal operation.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound)
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
