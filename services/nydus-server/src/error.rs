//! Daemon-level error types

use thiserror::Error;

/// Errors raised while bringing the daemon up.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("accounts file error: {0}")]
    Accounts(String),
}

/// Result alias.
pub type Result<T> = std::result::Result<T, Error>;
