//! Error types for the Storage Version Migrator

use thiserror::Error;

use crate::migrator::ApiError;

/// Result type alias using the migrator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Migrator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Structured control-plane error returned by the resource client
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Discovery failed; fatal for the whole run
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Progress store error
    #[error("Progress store error: {0}")]
    Progress(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// The run was cancelled before the work finished
    #[error("migration cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a discovery error
    pub fn discovery(msg: impl Into<String>) -> Self {
        Error::Discovery(msg.into())
    }

    /// Create a progress store error
    pub fn progress(msg: impl Into<String>) -> Self {
        Error::Progress(msg.into())
    }

    /// The structured API error, if this error carries one
    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Error::Api(e) => Some(e),
            _ => None,
        }
    }
}
