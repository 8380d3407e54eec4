use std::fmt;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to dial upstream {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {timeout:?} dialing upstream {addr}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_config<T: fmt::Display>(msg: T) -> Self {
        Error::InvalidConfig(msg.to_string())
    }

    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        Error::Internal(msg.to_string())
    }

    /// Only listener-level failures may end the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Bind { .. })
    }

    /// True for errors produced while opening the upstream leg.
    pub fn is_dial_error(&self) -> bool {
        matches!(self, Error::Dial { .. } | Error::DialTimeout { .. })
    }
}
