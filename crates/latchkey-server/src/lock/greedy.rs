//! Greedy promotion policy and fencing epochs

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use latchkey_common::{Epoch, LockId, NodeId};
use tokio::time::Instant;

pub const DEFAULT_PROMOTION_THRESHOLD: u32 = 1;
pub const DEFAULT_PROMOTION_WINDOW: Duration = Duration::from_secs(1);

/// When the server hands a node a node-wide lease instead of a single grant.
///
/// A request is promoted once its node has issued `promotion_threshold`
/// requests for the same lock within `window`, and no other node holds or
/// awaits the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreedyPolicy {
    pub enabled: bool,
    pub promotion_threshold: u32,
    pub window: Duration,
}

impl Default for GreedyPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            window: DEFAULT_PROMOTION_WINDOW,
        }
    }
}

impl GreedyPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, promotion_threshold: u32) -> Self {
        self.promotion_threshold = promotion_threshold;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn should_promote(&self, recent_requests: u32) -> bool {
        self.enabled && recent_requests >= self.promotion_threshold.max(1)
    }
}

/// Count of the requests one node made for one lock in the current window.
#[derive(Debug, Clone)]
pub struct RequestWindow {
    started: Instant,
    count: u32,
}

impl RequestWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            count: 0,
        }
    }

    /// Record a request at `now`, restarting the window once it has elapsed.
    pub fn record(&mut self, now: Instant, window: Duration) -> u32 {
        if now.saturating_duration_since(self.started) > window {
            self.started = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.started) > window
    }
}

/// Request windows of every (node, lock) pair.
///
/// Kept by the manager rather than by the lock itself: a lock that is
/// released between two requests goes idle and is removed, but its
/// requesters' history has to survive that to reach the promotion threshold.
#[derive(Debug, Default)]
pub struct RequestTracker {
    windows: DashMap<(NodeId, LockId), RequestWindow>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request of `node` for `lock_id`, returning the count in
    /// the current window.
    pub fn record(&self, node: NodeId, lock_id: &LockId, now: Instant, window: Duration) -> u32 {
        self.windows
            .entry((node, lock_id.clone()))
            .or_insert_with(|| RequestWindow::new(now))
            .record(now, window)
    }

    /// Requests of `node` for `lock_id` in a window that is still open.
    pub fn count(&self, node: NodeId, lock_id: &LockId, now: Instant, window: Duration) -> u32 {
        self.windows
            .get(&(node, lock_id.clone()))
            .filter(|w| !w.is_expired(now, window))
            .map_or(0, |w| w.count())
    }

    pub fn forget_node(&self, node: NodeId) {
        self.windows.retain(|(owner, _), _| *owner != node);
    }

    /// Drop windows that have closed. Returns how many were dropped.
    pub fn prune(&self, now: Instant, window: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_expired(now, window));
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Server-wide source of fencing epochs. Never goes backwards.
#[derive(Debug, Default)]
pub struct EpochCounter(AtomicU64);

impl EpochCounter {
    pub fn new(start: Epoch) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn current(&self) -> Epoch {
        self.0.load(Ordering::SeqCst)
    }

    /// Mint the next epoch.
    pub fn advance(&self) -> Epoch {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_promotes_first_request() {
        let policy = GreedyPolicy::default();
        assert!(!policy.should_promote(0));
        assert!(policy.should_promote(1));
    }

    #[test]
    fn test_threshold_and_disabled() {
        let policy = GreedyPolicy::default().with_threshold(3);
        assert!(!policy.should_promote(2));
        assert!(policy.should_promote(3));
        assert!(!GreedyPolicy::disabled().should_promote(100));

        // A zero threshold behaves like one
        assert!(!GreedyPolicy::default().with_threshold(0).should_promote(0));
    }

    #[test]
    fn test_request_window_restarts() {
        let start = Instant::now();
        let window = Duration::from_millis(100);
        let mut requests = RequestWindow::new(start);
        assert_eq!(requests.record(start, window), 1);
        assert_eq!(requests.record(start + Duration::from_millis(50), window), 2);
        assert_eq!(requests.record(start + Duration::from_millis(300), window), 1);
        assert_eq!(requests.count(), 1);
    }

    #[test]
    fn test_tracker_counts_per_node_and_lock() {
        let tracker = RequestTracker::new();
        let start = Instant::now();
        let window = Duration::from_secs(1);
        let lock_id = LockId::named("L");

        assert_eq!(tracker.record(NodeId(1), &lock_id, start, window), 1);
        assert_eq!(tracker.record(NodeId(1), &lock_id, start, window), 2);
        assert_eq!(tracker.record(NodeId(2), &lock_id, start, window), 1);
        assert_eq!(tracker.count(NodeId(1), &lock_id, start, window), 2);
        assert_eq!(tracker.count(NodeId(1), &LockId::named("other"), start, window), 0);

        // A closed window no longer counts
        let later = start + Duration::from_secs(2);
        assert_eq!(tracker.count(NodeId(1), &lock_id, later, window), 0);
    }

    #[test]
    fn test_tracker_prune_and_forget() {
        let tracker = RequestTracker::new();
        let start = Instant::now();
        let window = Duration::from_secs(1);
        tracker.record(NodeId(1), &LockId::Long(1), start, window);
        tracker.record(NodeId(1), &LockId::Long(2), start + Duration::from_secs(2), window);
        tracker.record(NodeId(2), &LockId::Long(2), start + Duration::from_secs(2), window);

        assert_eq!(tracker.prune(start + Duration::from_millis(2500), window), 1);
        assert_eq!(tracker.len(), 2);

        tracker.forget_node(NodeId(1));
        assert_eq!(tracker.len(), 1);
        assert_eq!(
            tracker.count(NodeId(2), &LockId::Long(2), start + Duration::from_secs(2), window),
            1
        );
    }

    #[test]
    fn test_epochs_are_monotonic() {
        let epochs = EpochCounter::new(2);
        assert_eq!(epochs.current(), 2);
        assert_eq!(epochs.advance(), 3);
        assert_eq!(epochs.advance(), 4);
        assert_eq!(epochs.current(), 4);
    }
}
