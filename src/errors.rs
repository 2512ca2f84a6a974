use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("AWS SDK S3 error: {0}")]
    S3Sdk(String),

    #[error("Backup operation failed: {0}")]
    Backup(String),

    #[error("Restore operation failed: {0}")]
    Restore(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid encryption password")]
    InvalidPassword,

    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Remote storage is not configured: {0}")]
    MissingConfig(String),

    #[error("Data integrity error: {0}")]
    Integrity(String),
}

impl AppError {
    /// Whether this error is the caller's fault. The HTTP layer maps these
    /// to 4xx responses (`NotFound` to 404, `MissingConfig` to 503).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::InvalidInput(_)
                | AppError::NotFound(_)
                | AppError::InvalidPassword
                | AppError::ChecksumMismatch(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
