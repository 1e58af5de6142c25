//! Error types for Shadowmux

use thiserror::Error;

/// Main error type for Shadowmux
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Result type alias for Shadowmux
pub type Result<T> = std::result::Result<T, Error>;
