use thiserror::Error;

use crate::capture::CaptureError;
use crate::db::StoreError;
use crate::embeddings::EmbeddingError;

#[derive(Error, Debug)]
pub enum SmarnError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Other error: {0}")]
    Other(String),
}
