use crate::outbox::OutboxError;
use crate::seed::SeedError;
use crate::sources::SourceError;
use crate::vector::VectorStoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("SeedError: {0}")]
    SeedError(#[from] SeedError),

    #[error("VectorStoreError: {0}")]
    VectorStoreError(#[from] VectorStoreError),

    #[error("OutboxError: {0}")]
    OutboxError(#[from] OutboxError),

    #[error("SourceError: {0}")]
    SourceError(#[from] SourceError),

    #[error("ConfigError: {0}")]
    ConfigError(#[from] serde_yaml::Error),

    #[error("JsonError: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),

    #[error("ReqwestError: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("Cancelled")]
    Cancelled(),

    #[error("AnyhowError: {0}")]
    AnyhowError(#[from] anyhow::Error),
}
