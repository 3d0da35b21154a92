//! Dripcast error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DripError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DripError>;
