//! Crate-level error type

use crate::consumer::ConsumerError;
use thiserror::Error;

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading settings or running the worker
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed settings file
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Consumer failure
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
