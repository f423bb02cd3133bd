use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("DATABASE: {0}")]
    Database(#[from] sqlx::Error),
    #[error("MIGRATION: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("IO_FAILURE: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;
