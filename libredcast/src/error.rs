//! Error types for Redcast

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RedcastError>;

#[derive(Error, Debug)]
pub enum RedcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Reddit API error: {0}")]
    Api(#[from] ApiError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl RedcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            RedcastError::Config(_) => 2,
            RedcastError::Api(ApiError::Auth(_)) => 3,
            RedcastError::Api(_) => 1,
            RedcastError::Database(_) => 1,
            RedcastError::InvalidInput(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Classified upstream failures.
///
/// Every outcome of a Reddit API call maps onto one of these variants; the
/// retry executor consults [`ApiError::is_retryable`] to decide whether a
/// failed attempt is worth repeating.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Transient upstream failure: {0}")]
    Transient(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Upstream quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Upstream rejected request: {0}")]
    Rejected(String),
}

impl ApiError {
    /// Whether a failed attempt with this error may succeed if repeated.
    ///
    /// Rate limiting and 5xx/network/timeout failures are transient; auth
    /// failures, validation failures, billing exhaustion, and other 4xx
    /// rejections are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::RateLimit(_) | ApiError::Transient(_))
    }

    /// Classify an HTTP status code together with an extracted error detail.
    pub fn from_status(status: u16, detail: String) -> Self {
        match status {
            402 => ApiError::QuotaExhausted(detail),
            429 => ApiError::RateLimit(detail),
            401 | 403 => ApiError::Auth(detail),
            s if s >= 500 => ApiError::Transient(detail),
            _ => ApiError::Rejected(detail),
        }
    }
}
