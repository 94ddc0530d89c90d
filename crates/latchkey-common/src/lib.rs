//! Latchkey Common - shared value types for the distributed lock manager
//!
//! This crate provides the leaf types used by every other Latchkey component:
//! - `LockId`: the type-tagged name of a protected resource
//! - `NodeId`, `ThreadId`, `SessionId`: who is asking
//! - `LockLevel`: what kind of access is asked for
//! - `GreedyLease`: a node-wide grant fenced by an epoch
//! - `LatchkeyError`: failures surfaced to lock callers

pub mod error;
pub mod id;
pub mod lease;
pub mod level;

// Re-exports for convenience
pub use error::{LatchkeyError, RejectReason, Result};
pub use id::{LockId, NodeId, SessionId, ThreadId};
pub use lease::{Epoch, GreedyLease};
pub use level::LockLevel;

/// Default TCP port the lock server listens on
pub const DEFAULT_SERVER_PORT: u16 = 9420;
