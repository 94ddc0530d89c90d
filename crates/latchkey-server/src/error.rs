//! Server error types

use latchkey_api::CodecError;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
