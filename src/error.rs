use crate::proxy::registry::RegistryError;
use thiserror::Error;

/// llm_relay application error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Filter configuration error: {0}")]
    Filters(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bind address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Application error: {0}")]
    Application(String),
}

impl Error {
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
