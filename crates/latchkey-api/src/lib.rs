//! Latchkey API - the client/server lock protocol
//!
//! This crate provides:
//! - Typed protocol messages in both directions
//! - A compact binary codec (one-byte message tag, type-tagged lock ids)
//! - Length-prefixed framing over async byte streams

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::WireMessage;
pub use error::{CodecError, Result};
pub use frame::{MAX_FRAME_LEN, MessageReader, MessageWriter};
pub use message::{ClientMessage, HolderInfo, ServerMessage, UnlockEntry};
