//! Error types for azclone.

use thiserror::Error;

use crate::cloud::CloudError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("deployment timed out: {0}")]
    DeploymentTimeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
