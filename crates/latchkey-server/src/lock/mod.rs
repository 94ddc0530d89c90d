//! Server-side lock arbitration
//!
//! - `state`: the per-lock state machine (holders, FIFO queue, wait set, lease)
//! - `greedy`: promotion policy, request windows and the server-wide epoch counter
//! - `manager`: the registry of live locks that applies state transitions

pub mod greedy;
pub mod manager;
pub mod state;

pub use greedy::{EpochCounter, GreedyPolicy, RequestTracker};
pub use manager::{LockSnapshot, ServerLockManager};
pub use state::{Effect, Holder, LockContext, LockTimer, ServerLock};
