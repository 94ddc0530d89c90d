//! Greedy leases and their fencing epochs

use crate::{LockId, LockLevel, NodeId};

/// Fencing token minted by the server. Strictly increasing across the server.
pub type Epoch = u64;

/// A node-wide grant that lets one node arbitrate a lock among its own threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreedyLease {
    pub lock_id: LockId,
    pub node: NodeId,
    /// READ or WRITE
    pub level: LockLevel,
    pub epoch: Epoch,
}

impl GreedyLease {
    pub fn new(lock_id: LockId, node: NodeId, level: LockLevel, epoch: Epoch) -> Self {
        Self {
            lock_id,
            node,
            level: level.lease_level(),
            epoch,
        }
    }

    /// Whether a local request at `level` can be served under this lease.
    pub fn covers(&self, level: LockLevel) -> bool {
        self.level.covers(level)
    }

    /// Whether a message bearing `epoch` refers to this lease.
    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.epoch == epoch
    }
}
