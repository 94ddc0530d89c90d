//! Protocol messages exchanged between client nodes and the lock server

use latchkey_common::{Epoch, LockId, LockLevel, NodeId, RejectReason, SessionId, ThreadId};

/// One released hold inside a (possibly batched) UNLOCK.
///
/// `thread == ThreadId::NODE` releases the node's greedy lease; `epoch` must
/// then match the lease being surrendered. Per-thread releases carry the
/// epoch of the award they release for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockEntry {
    pub lock_id: LockId,
    pub thread: ThreadId,
    pub level: LockLevel,
    pub epoch: Epoch,
}

/// A current holder as reported by QUERY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderInfo {
    pub node: NodeId,
    pub thread: ThreadId,
    pub level: LockLevel,
}

/// Messages sent from a client node to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// First message on every connection
    Hello { node: NodeId },
    LockRequest {
        lock_id: LockId,
        thread: ThreadId,
        level: LockLevel,
        /// `None` blocks until granted; `Some(0)` fails fast; otherwise the
        /// server refuses the request once this many millis elapse.
        try_timeout_millis: Option<u64>,
    },
    Unlock { entries: Vec<UnlockEntry> },
    /// `timeout_millis == 0` waits until notified
    Wait {
        lock_id: LockId,
        thread: ThreadId,
        timeout_millis: u64,
    },
    Notify {
        lock_id: LockId,
        thread: ThreadId,
        all: bool,
    },
    Query { lock_id: LockId, thread: ThreadId },
    Interrupt { lock_id: LockId, thread: ThreadId },
}

/// Messages sent from the server to a client node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Reply to HELLO
    Welcome { session: SessionId },
    LockAward {
        lock_id: LockId,
        thread: ThreadId,
        level: LockLevel,
        greedy: bool,
        epoch: Epoch,
    },
    LockReject {
        lock_id: LockId,
        thread: ThreadId,
        reason: RejectReason,
    },
    LockRecall { lock_id: LockId, epoch: Epoch },
    /// Wake instruction for a parked waiter. When `reacquire_pending` is set
    /// the server has already queued the waiter's WRITE re-acquisition.
    Notified {
        lock_id: LockId,
        thread: ThreadId,
        reacquire_pending: bool,
    },
    QueryResponse {
        lock_id: LockId,
        thread: ThreadId,
        holders: Vec<HolderInfo>,
        pending: u32,
        waiters: u32,
    },
}

impl ClientMessage {
    pub fn lock_id(&self) -> Option<&LockId> {
        match self {
            ClientMessage::Hello { .. } | ClientMessage::Unlock { .. } => None,
            ClientMessage::LockRequest { lock_id, .. }
            | ClientMessage::Wait { lock_id, .. }
            | ClientMessage::Notify { lock_id, .. }
            | ClientMessage::Query { lock_id, .. }
            | ClientMessage::Interrupt { lock_id, .. } => Some(lock_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "HELLO",
            ClientMessage::LockRequest { .. } => "LOCK_REQUEST",
            ClientMessage::Unlock { .. } => "UNLOCK",
            ClientMessage::Wait { .. } => "WAIT",
            ClientMessage::Notify { .. } => "NOTIFY",
            ClientMessage::Query { .. } => "QUERY",
            ClientMessage::Interrupt { .. } => "INTERRUPT",
        }
    }
}

impl ServerMessage {
    pub fn lock_id(&self) -> Option<&LockId> {
        match self {
            ServerMessage::Welcome { .. } => None,
            ServerMessage::LockAward { lock_id, .. }
            | ServerMessage::LockReject { lock_id, .. }
            | ServerMessage::LockRecall { lock_id, .. }
            | ServerMessage::Notified { lock_id, .. }
            | ServerMessage::QueryResponse { lock_id, .. } => Some(lock_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "WELCOME",
            ServerMessage::LockAward { .. } => "LOCK_AWARD",
            ServerMessage::LockReject { .. } => "LOCK_REJECT",
            ServerMessage::LockRecall { .. } => "LOCK_RECALL",
            ServerMessage::Notified { .. } => "NOTIFIED",
            ServerMessage::QueryResponse { .. } => "QUERY_RESPONSE",
        }
    }
}
