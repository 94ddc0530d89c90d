//! Latchkey Client - distributed lock client for cluster nodes
//!
//! This crate provides:
//! - A sharded client lock table with local arbitration between threads
//! - The client lock manager API (lock / try_lock / unlock / wait / notify)
//! - Greedy lease handling with recall draining and epoch fencing
//! - A remote lock manager that owns the server connection, reconnects and
//!   resynchronizes lock state

pub mod config;
pub mod error;
pub mod manager;
pub mod remote;
pub mod table;

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use manager::{ClientLockManager, GlobalLockInfo};
pub use remote::RemoteLockManager;
pub use table::{ClientLockState, LockHold};

pub use latchkey_common::{LatchkeyError, LockId, LockLevel, NodeId, ThreadId};
