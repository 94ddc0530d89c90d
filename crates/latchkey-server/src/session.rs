//! Node session registry
//!
//! Tracks the live connection of every node and the outbound channel its
//! writer task drains. A node has at most one current session; a HELLO on a
//! new connection replaces the previous one.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use latchkey_api::ServerMessage;
use latchkey_common::{NodeId, SessionId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// The live connection of one node.
#[derive(Debug)]
pub struct NodeSession {
    pub session: SessionId,
    pub connected_at: Instant,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<NodeId, NodeSession>,
    /// Last session of nodes that went away and have not come back
    departures: DashMap<NodeId, SessionId>,
    next_session: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Make `session` the node's current session, returning the one it replaces.
    pub fn register(
        &self,
        node: NodeId,
        session: SessionId,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Option<SessionId> {
        self.departures.remove(&node);
        self.sessions
            .insert(
                node,
                NodeSession {
                    session,
                    connected_at: Instant::now(),
                    tx,
                },
            )
            .map(|previous| previous.session)
    }

    /// Remove the node's session if it is still `session`.
    pub fn unregister(&self, node: NodeId, session: SessionId) -> bool {
        let removed = self
            .sessions
            .remove_if(&node, |_, current| current.session == session)
            .is_some();
        if removed {
            self.departures.insert(node, session);
        }
        removed
    }

    pub fn is_current(&self, node: NodeId, session: SessionId) -> bool {
        self.sessions
            .get(&node)
            .is_some_and(|current| current.session == session)
    }

    pub fn session_of(&self, node: NodeId) -> Option<SessionId> {
        self.sessions.get(&node).map(|current| current.session)
    }

    /// Whether `session` was the node's last session and it has not reconnected.
    pub fn has_departed(&self, node: NodeId, session: SessionId) -> bool {
        self.departures
            .get(&node)
            .is_some_and(|departed| *departed == session)
    }

    /// Forget a departure once its state has been cleaned up.
    pub fn forget(&self, node: NodeId, session: SessionId) {
        self.departures
            .remove_if(&node, |_, departed| *departed == session);
    }

    /// Queue a message for the node's writer. Messages to absent nodes are dropped.
    pub fn send(&self, node: NodeId, message: ServerMessage) -> bool {
        let Some(current) = self.sessions.get(&node) else {
            debug!(%node, kind = message.kind(), "Dropping message for disconnected node");
            return false;
        };
        if current.tx.send(message).is_err() {
            debug!(%node, session = %current.session, "Writer of node has stopped");
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }
}
