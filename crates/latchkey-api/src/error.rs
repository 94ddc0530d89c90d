//! Codec and framing errors

/// Error raised while decoding or transporting protocol messages
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated message: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unknown message tag: {0:#04x}")]
    UnknownMessageTag(u8),

    #[error("unknown lock id tag: {0}")]
    UnknownLockIdTag(u8),

    #[error("unknown lock level ordinal: {0}")]
    UnknownLevel(u8),

    #[error("unknown reject reason: {0}")]
    UnknownRejectReason(u8),

    #[error("invalid utf-8 in lock id: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;
