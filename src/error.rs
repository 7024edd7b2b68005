//! Error types.

use thiserror::Error;

/// Errors returned by the resolver API.
///
/// Failures of individual questions are not errors in this sense; they are
/// delivered to the requester as a [`Status`](crate::dispatch::Status).
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid domain name: {0}")]
    InvalidName(String),

    #[error("unknown record type: {0}")]
    UnknownType(String),

    #[error("resolver has stopped")]
    Stopped,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for resolver operations.
pub type Result<T> = std::result::Result<T, Error>;
