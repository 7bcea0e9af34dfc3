// Foreman Error Types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Planner error: {0}")]
    Planner(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, ForemanError>;
