//! Latchkey Server - distributed lock server
//!
//! This crate provides:
//! - The per-lock arbitration state machine (FIFO with read batching,
//!   greedy leases, recall with a liveness window, cluster-wide wait sets)
//! - The server lock manager that runs locks independently of each other
//! - Node sessions and the TCP transport
//! - Configuration, logging and shutdown helpers for the server binary

pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod session;
pub mod startup;
pub mod transport;

pub use config::{Configuration, ServerConfig};
pub use error::{Result, ServerError};
pub use lock::{GreedyPolicy, LockSnapshot, ServerLockManager};
pub use session::SessionRegistry;
pub use transport::LockServer;
