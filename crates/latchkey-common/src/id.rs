//! Identifiers for locks, nodes, threads, and sessions

use std::fmt::{Display, Formatter};
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Name of a protected resource.
///
/// Each variant serializes with a distinct one-byte type tag (see
/// [`LockId::type_tag`]) so that `Named("7")` and `Long(7)` never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockId {
    /// Application chosen string name
    Named(String),
    /// 64-bit numeric lock
    Long(i64),
    /// Identity of a literal value (interned string, boxed primitive, enum constant)
    Literal(String),
    /// Identity of a shared object, as assigned by the object-identity collaborator
    Object(u64),
}

impl LockId {
    pub const TAG_NAMED: u8 = 1;
    pub const TAG_LONG: u8 = 2;
    pub const TAG_LITERAL: u8 = 3;
    pub const TAG_OBJECT: u8 = 4;

    pub fn named(name: impl Into<String>) -> Self {
        LockId::Named(name.into())
    }

    pub fn literal(value: impl Into<String>) -> Self {
        LockId::Literal(value.into())
    }

    /// The one-byte wire tag for this variant.
    pub fn type_tag(&self) -> u8 {
        match self {
            LockId::Named(_) => Self::TAG_NAMED,
            LockId::Long(_) => Self::TAG_LONG,
            LockId::Literal(_) => Self::TAG_LITERAL,
            LockId::Object(_) => Self::TAG_OBJECT,
        }
    }

    /// Stable shard index for `shards` partitions.
    pub fn shard_index(&self, shards: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        (hasher.finish() as usize) % shards.max(1)
    }
}

impl Display for LockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LockId::Named(name) => write!(f, "named:{}", name),
            LockId::Long(value) => write!(f, "long:{}", value),
            LockId::Literal(value) => write!(f, "literal:{}", value),
            LockId::Object(id) => write!(f, "object:{:#x}", id),
        }
    }
}

impl From<&str> for LockId {
    fn from(value: &str) -> Self {
        LockId::Named(value.to_string())
    }
}

impl From<String> for LockId {
    fn from(value: String) -> Self {
        LockId::Named(value)
    }
}

impl From<i64> for LockId {
    fn from(value: i64) -> Self {
        LockId::Long(value)
    }
}

/// Identity of a client node. Stable across reconnects of the same process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{:x}", self.0)
    }
}

/// A logical thread of execution within one node.
///
/// [`ThreadId::NODE`] stands for the whole node; the server uses it when a
/// grant is greedy and the node arbitrates among its own threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Sentinel for node-wide (greedy) holds
    pub const NODE: ThreadId = ThreadId(0);

    pub fn new(id: u64) -> Self {
        ThreadId(id)
    }

    pub fn is_node(self) -> bool {
        self == Self::NODE
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_node() {
            write!(f, "thread-node")
        } else {
            write!(f, "thread-{}", self.0)
        }
    }
}

/// One connection lifetime of a node, assigned by the server on handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}
