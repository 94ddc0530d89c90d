//! Client error types

use latchkey_api::CodecError;
use latchkey_common::LatchkeyError;

/// Error type for client connection and lock operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Lock(#[from] LatchkeyError),

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection not ready")]
    NotConnected,

    #[error("request timeout")]
    Timeout,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
