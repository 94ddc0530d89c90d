//! Error types surfaced by lock operations
//!
//! This module defines:
//! - `LatchkeyError`: failures returned to lock callers
//! - `RejectReason`: why the server refused a request

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::{Epoch, LockId, LockLevel, ThreadId};

/// Why the server refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A zero-timeout try-lock could not be granted immediately
    Unavailable,
    /// A try-lock timed out while queued on the server
    TimedOut,
    /// The message referred to a lease that has since been superseded
    StaleEpoch(Epoch),
    /// wait/notify was issued by a thread that is not the WRITE holder of record
    IllegalMonitorState,
}

impl RejectReason {
    pub fn code(self) -> u8 {
        match self {
            RejectReason::Unavailable => 1,
            RejectReason::TimedOut => 2,
            RejectReason::StaleEpoch(_) => 3,
            RejectReason::IllegalMonitorState => 4,
        }
    }
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Unavailable => write!(f, "lock unavailable"),
            RejectReason::TimedOut => write!(f, "timed out on server"),
            RejectReason::StaleEpoch(epoch) => write!(f, "stale epoch {}", epoch),
            RejectReason::IllegalMonitorState => write!(f, "not the write holder of record"),
        }
    }
}

/// Lock operation failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LatchkeyError {
    #[error("lock upgrade not supported: {thread} holds READ on {lock_id}")]
    UpgradeNotSupported { lock_id: LockId, thread: ThreadId },

    #[error("illegal monitor state: {thread} does not hold WRITE on {lock_id}")]
    IllegalMonitorState { lock_id: LockId, thread: ThreadId },

    #[error("{thread} does not hold {level} on {lock_id}")]
    NotHeld {
        lock_id: LockId,
        thread: ThreadId,
        level: LockLevel,
    },

    #[error("{thread} already has a request outstanding on {lock_id}")]
    RequestOutstanding { lock_id: LockId, thread: ThreadId },

    #[error("interrupted while waiting on {lock_id}")]
    Interrupted { lock_id: LockId },

    #[error("timed out after {timeout:?} waiting on {lock_id}")]
    Timeout { lock_id: LockId, timeout: Duration },

    #[error("request on {lock_id} rejected: {reason}")]
    Rejected { lock_id: LockId, reason: RejectReason },

    #[error("not connected to lock server")]
    Disconnected,

    #[error("lock manager is shut down")]
    Shutdown,
}

impl LatchkeyError {
    /// Programming errors are never retried and never caused by the network.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            LatchkeyError::UpgradeNotSupported { .. }
                | LatchkeyError::IllegalMonitorState { .. }
                | LatchkeyError::NotHeld { .. }
                | LatchkeyError::RequestOutstanding { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LatchkeyError>;
