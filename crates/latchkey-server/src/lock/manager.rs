//! Server lock manager
//!
//! Owns one [`ServerLock`] per live lock id. Locks are independent: each is
//! guarded by its own mutex, so unrelated locks never contend. Effects a
//! transition produces are applied before that mutex is released, which keeps
//! the messages and timers of one lock in order.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use latchkey_api::{ClientMessage, ServerMessage};
use latchkey_common::{Epoch, GreedyLease, LockId, NodeId, SessionId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::greedy::{EpochCounter, GreedyPolicy, RequestTracker};
use super::state::{Effect, Holder, LockContext, LockTimer, ServerLock};
use crate::config::ServerConfig;
use crate::metrics;
use crate::session::SessionRegistry;

/// Point-in-time view of one lock, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSnapshot {
    pub holders: Vec<Holder>,
    pub lease: Option<GreedyLease>,
    pub recalling: bool,
    pub pending: usize,
    pub waiters: usize,
    pub epoch: Epoch,
}

pub struct ServerLockManager {
    this: Weak<ServerLockManager>,
    locks: DashMap<LockId, Arc<Mutex<ServerLock>>>,
    sessions: SessionRegistry,
    epochs: EpochCounter,
    /// Request windows outlive the locks they count, see [`RequestTracker`]
    requests: RequestTracker,
    policy: GreedyPolicy,
    recall_timeout: Duration,
    reconnect_window: Duration,
    timers: DashMap<(LockId, LockTimer), AbortHandle>,
}

impl ServerLockManager {
    pub fn new(config: &ServerConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            locks: DashMap::new(),
            sessions: SessionRegistry::new(),
            epochs: EpochCounter::default(),
            requests: RequestTracker::new(),
            policy: config.greedy.clone(),
            recall_timeout: config.recall_timeout,
            reconnect_window: config.reconnect_window,
            timers: DashMap::new(),
        })
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn policy(&self) -> &GreedyPolicy {
        &self.policy
    }

    pub fn current_epoch(&self) -> Epoch {
        self.epochs.current()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn request_window_count(&self) -> usize {
        self.requests.len()
    }

    /// Drop request windows that have closed. Run periodically by the server.
    pub fn prune_request_windows(&self) -> usize {
        let pruned = self.requests.prune(Instant::now(), self.policy.window);
        if pruned > 0 {
            debug!(pruned, remaining = self.requests.len(), "Pruned request windows");
        }
        pruned
    }

    pub fn snapshot(&self, lock_id: &LockId) -> Option<LockSnapshot> {
        let lock = self.locks.get(lock_id)?.value().clone();
        let state = lock.lock();
        Some(LockSnapshot {
            holders: state.holders().to_vec(),
            lease: state.lease().cloned(),
            recalling: state.is_recalling(),
            pending: state.pending_count(),
            waiters: state.waiter_count(),
            epoch: state.epoch(),
        })
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Register a node that completed HELLO. WELCOME is queued on `tx` before
    /// anything else, and state left over from an earlier session is dropped.
    pub fn connect_node(&self, node: NodeId, tx: mpsc::UnboundedSender<ServerMessage>) -> SessionId {
        let session = self.sessions.next_session_id();
        let _ = tx.send(ServerMessage::Welcome { session });
        match self.sessions.register(node, session, tx) {
            Some(previous) => {
                info!(%node, %previous, %session, "Node reconnected, replacing previous session")
            }
            None => info!(%node, %session, "Node connected"),
        }
        metrics::set_connected_nodes(self.sessions.len() as f64);

        let cleared = self.clear_node(node);
        if cleared > 0 {
            info!(%node, cleared, "Discarded lock state of the node's previous session");
        }
        session
    }

    /// Forget a closed session. The node's locks survive for the reconnect
    /// window so a quick reconnect does not disturb other nodes twice.
    pub fn disconnect_node(&self, node: NodeId, session: SessionId) {
        if !self.sessions.unregister(node, session) {
            return;
        }
        metrics::set_connected_nodes(self.sessions.len() as f64);

        if self.reconnect_window.is_zero() {
            self.sessions.forget(node, session);
            let cleared = self.clear_node(node);
            info!(%node, %session, cleared, "Node disconnected, released its locks");
            return;
        }

        info!(
            %node,
            %session,
            window = ?self.reconnect_window,
            "Node disconnected, keeping its locks for the reconnect window"
        );
        let this = self.this.clone();
        let window = self.reconnect_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(manager) = this.upgrade() else {
                return;
            };
            if manager.sessions.has_departed(node, session) {
                manager.sessions.forget(node, session);
                let cleared = manager.clear_node(node);
                info!(%node, %session, cleared, "Reconnect window elapsed, released node's locks");
            }
        });
    }

    /// Drop every hold, request, waiter and lease of `node`. Returns the
    /// number of locks that referenced it.
    pub fn clear_node(&self, node: NodeId) -> usize {
        self.requests.forget_node(node);
        let lock_ids: Vec<LockId> = self.locks.iter().map(|entry| entry.key().clone()).collect();
        let mut cleared = 0;
        for lock_id in lock_ids {
            self.with_lock(&lock_id, false, |state, ctx, out| {
                if state.involves(node) {
                    cleared += 1;
                    state.clear_node(node, ctx, out);
                }
            });
        }
        cleared
    }

    // ========================================================================
    // Messages
    // ========================================================================

    pub fn handle(&self, node: NodeId, session: SessionId, message: ClientMessage) {
        if !self.sessions.is_current(node, session) {
            debug!(%node, %session, kind = message.kind(), "Dropping message from superseded session");
            return;
        }

        match message {
            ClientMessage::Hello { .. } => warn!(%node, %session, "Ignoring repeated HELLO"),
            ClientMessage::LockRequest {
                lock_id,
                thread,
                level,
                try_timeout_millis,
            } => {
                let try_timeout = try_timeout_millis.map(Duration::from_millis);
                self.with_lock(&lock_id, true, |state, ctx, out| {
                    state.request(node, thread, level, try_timeout, ctx, out)
                });
            }
            ClientMessage::Unlock { entries } => {
                for entry in &entries {
                    let found = self.with_lock(&entry.lock_id, false, |state, ctx, out| {
                        state.unlock(node, entry, ctx, out)
                    });
                    if found {
                        continue;
                    }
                    if entry.thread.is_node() {
                        warn!(
                            lock_id = %entry.lock_id,
                            %node,
                            epoch = entry.epoch,
                            "Dropping unlock for a lease that no longer exists"
                        );
                    } else {
                        debug!(lock_id = %entry.lock_id, %node, thread = %entry.thread, "Unlock for unknown lock");
                    }
                }
            }
            ClientMessage::Wait {
                lock_id,
                thread,
                timeout_millis,
            } => {
                let timeout = (timeout_millis > 0).then(|| Duration::from_millis(timeout_millis));
                self.with_lock(&lock_id, true, |state, ctx, out| {
                    state.wait(node, thread, timeout, ctx, out)
                });
            }
            ClientMessage::Notify {
                lock_id,
                thread,
                all,
            } => {
                self.with_lock(&lock_id, true, |state, ctx, out| {
                    state.notify(node, thread, all, ctx, out)
                });
            }
            ClientMessage::Query { lock_id, thread } => {
                self.with_lock(&lock_id, true, |state, _, out| state.query(node, thread, out));
            }
            ClientMessage::Interrupt { lock_id, thread } => {
                self.with_lock(&lock_id, false, |state, ctx, out| {
                    state.interrupt(node, thread, ctx, out)
                });
            }
        }
    }

    pub fn on_timer(&self, lock_id: &LockId, timer: LockTimer) {
        let key = (lock_id.clone(), timer);
        let found = self.with_lock(lock_id, false, |state, ctx, out| {
            self.timers.remove(&key);
            state.timer_fired(timer, ctx, out);
        });
        if !found {
            self.timers.remove(&key);
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn context(&self) -> LockContext<'_> {
        LockContext {
            policy: &self.policy,
            epochs: &self.epochs,
            requests: &self.requests,
            recall_timeout: self.recall_timeout,
            now: Instant::now(),
        }
    }

    /// Run one transition on a lock and apply its effects. Returns false if
    /// the lock does not exist and `create` is not set.
    fn with_lock(
        &self,
        lock_id: &LockId,
        create: bool,
        f: impl FnOnce(&mut ServerLock, &LockContext<'_>, &mut Vec<Effect>),
    ) -> bool {
        let mut f = Some(f);
        loop {
            let lock = if create {
                self.locks
                    .entry(lock_id.clone())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(ServerLock::new(
                            lock_id.clone(),
                            self.epochs.current(),
                        )))
                    })
                    .value()
                    .clone()
            } else {
                match self.locks.get(lock_id) {
                    Some(entry) => entry.value().clone(),
                    None => return false,
                }
            };

            let mut state = lock.lock();
            // Lost a race with removal; look the lock up again
            if state.is_retired() {
                continue;
            }
            let Some(f) = f.take() else {
                return false;
            };

            let mut effects = Vec::new();
            f(&mut state, &self.context(), &mut effects);
            self.apply(lock_id, effects);

            let idle = state.is_idle();
            if idle {
                state.retire();
            }
            drop(state);
            if idle {
                self.locks
                    .remove_if(lock_id, |_, current| Arc::ptr_eq(current, &lock));
            }
            metrics::set_live_locks(self.locks.len() as f64);
            return true;
        }
    }

    fn apply(&self, lock_id: &LockId, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(node, message) => {
                    self.sessions.send(node, message);
                }
                Effect::StartTimer { timer, after } => self.start_timer(lock_id, timer, after),
                Effect::CancelTimer(timer) => {
                    if let Some((_, handle)) = self.timers.remove(&(lock_id.clone(), timer)) {
                        handle.abort();
                    }
                }
            }
        }
    }

    fn start_timer(&self, lock_id: &LockId, timer: LockTimer, after: Duration) {
        let this = self.this.clone();
        let target = lock_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(manager) = this.upgrade() {
                manager.on_timer(&target, timer);
            }
        });
        if let Some(previous) = self
            .timers
            .insert((lock_id.clone(), timer), task.abort_handle())
        {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_api::UnlockEntry;
    use latchkey_common::{LockLevel, RejectReason, ThreadId};

    struct TestNode {
        node: NodeId,
        session: SessionId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl TestNode {
        fn connect(manager: &ServerLockManager, id: u64) -> Self {
            let node = NodeId::new(id);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let session = manager.connect_node(node, tx);
            assert_eq!(rx.try_recv().ok(), Some(ServerMessage::Welcome { session }));
            Self { node, session, rx }
        }

        fn send(&self, manager: &ServerLockManager, message: ClientMessage) {
            manager.handle(self.node, self.session, message);
        }

        fn next(&mut self) -> Option<ServerMessage> {
            self.rx.try_recv().ok()
        }
    }

    fn request(lock_id: &LockId, thread: u64, level: LockLevel) -> ClientMessage {
        ClientMessage::LockRequest {
            lock_id: lock_id.clone(),
            thread: ThreadId::new(thread),
            level,
            try_timeout_millis: None,
        }
    }

    fn surrender(lock_id: &LockId, epoch: Epoch) -> ClientMessage {
        ClientMessage::Unlock {
            entries: vec![UnlockEntry {
                lock_id: lock_id.clone(),
                thread: ThreadId::NODE,
                level: LockLevel::Write,
                epoch,
            }],
        }
    }

    fn unlock(lock_id: &LockId, thread: u64) -> ClientMessage {
        ClientMessage::Unlock {
            entries: vec![UnlockEntry {
                lock_id: lock_id.clone(),
                thread: ThreadId::new(thread),
                level: LockLevel::Write,
                epoch: 0,
            }],
        }
    }

    fn config() -> ServerConfig {
        ServerConfig::default()
            .with_recall_timeout(Duration::from_millis(500))
            .with_reconnect_window(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_greedy_recall_between_nodes() {
        let manager = ServerLockManager::new(&config());
        let lock_id = LockId::named("L");
        let mut a = TestNode::connect(&manager, 1);
        let mut b = TestNode::connect(&manager, 2);

        a.send(&manager, request(&lock_id, 1, LockLevel::Write));
        let Some(ServerMessage::LockAward { greedy: true, epoch, .. }) = a.next() else {
            panic!("expected greedy award");
        };

        b.send(&manager, request(&lock_id, 5, LockLevel::Write));
        assert_eq!(
            a.next(),
            Some(ServerMessage::LockRecall {
                lock_id: lock_id.clone(),
                epoch
            })
        );
        assert_eq!(b.next(), None);
        assert_eq!(manager.timer_count(), 1);

        a.send(&manager, surrender(&lock_id, epoch));
        match b.next() {
            Some(ServerMessage::LockAward {
                thread,
                epoch: awarded,
                ..
            }) => {
                assert_eq!(thread, ThreadId::new(5));
                assert!(awarded > epoch);
            }
            other => panic!("expected award, got {:?}", other),
        }
        assert_eq!(manager.timer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_recall_reclaims_lease() {
        let manager = ServerLockManager::new(&config());
        let lock_id = LockId::Long(4);
        let mut a = TestNode::connect(&manager, 1);
        let mut b = TestNode::connect(&manager, 2);

        a.send(&manager, request(&lock_id, 1, LockLevel::Write));
        a.next();
        b.send(&manager, request(&lock_id, 2, LockLevel::Write));
        assert!(matches!(a.next(), Some(ServerMessage::LockRecall { .. })));

        let award = b.rx.recv().await;
        assert!(matches!(award, Some(ServerMessage::LockAward { .. })));
        assert!(matches!(
            a.next(),
            Some(ServerMessage::LockReject {
                thread: ThreadId::NODE,
                reason: RejectReason::StaleEpoch(_),
                ..
            })
        ));
        assert_eq!(
            manager.snapshot(&lock_id).and_then(|s| s.lease).map(|l| l.node),
            Some(b.node)
        );
    }

    #[tokio::test]
    async fn test_idle_locks_are_removed() {
        let manager = ServerLockManager::new(&config());
        let lock_id = LockId::named("transient");
        let mut a = TestNode::connect(&manager, 1);

        a.send(&manager, request(&lock_id, 1, LockLevel::Read));
        let Some(ServerMessage::LockAward { epoch, .. }) = a.next() else {
            panic!("expected award");
        };
        assert_eq!(manager.lock_count(), 1);

        a.send(&manager, surrender(&lock_id, epoch));
        assert_eq!(manager.lock_count(), 0);
        assert!(manager.snapshot(&lock_id).is_none());
    }

    #[tokio::test]
    async fn test_disconnect_releases_locks() {
        let manager = ServerLockManager::new(&config());
        let lock_id = LockId::named("L");
        let mut a = TestNode::connect(&manager, 1);
        let mut b = TestNode::connect(&manager, 2);

        a.send(&manager, request(&lock_id, 1, LockLevel::Write));
        a.next();
        b.send(&manager, request(&lock_id, 2, LockLevel::Write));

        manager.disconnect_node(a.node, a.session);
        assert!(matches!(b.next(), Some(ServerMessage::LockAward { .. })));
        assert!(manager.sessions().session_of(a.node).is_none());
    }

    #[tokio::test]
    async fn test_reconnect_discards_previous_state() {
        let manager = ServerLockManager::new(&config());
        let lock_id = LockId::named("L");
        let first = TestNode::connect(&manager, 1);
        first.send(&manager, request(&lock_id, 1, LockLevel::Write));
        assert!(manager.snapshot(&lock_id).is_some());

        let second = TestNode::connect(&manager, 1);
        assert_ne!(first.session, second.session);
        assert!(manager.snapshot(&lock_id).is_none());

        // Traffic from the replaced session is ignored
        first.send(&manager, request(&lock_id, 1, LockLevel::Write));
        assert!(manager.snapshot(&lock_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_window_keeps_state() {
        let config = config().with_reconnect_window(Duration::from_secs(10));
        let manager = ServerLockManager::new(&config);
        let lock_id = LockId::named("L");
        let a = TestNode::connect(&manager, 1);
        a.send(&manager, request(&lock_id, 1, LockLevel::Write));

        manager.disconnect_node(a.node, a.session);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(manager.snapshot(&lock_id).is_some());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(manager.snapshot(&lock_id).is_none());
    }

    #[tokio::test]
    async fn test_repeated_requests_promote_across_idle_periods() {
        let policy = GreedyPolicy::default()
            .with_threshold(3)
            .with_window(Duration::from_secs(60));
        let manager = ServerLockManager::new(&config().with_greedy(policy));
        let lock_id = LockId::named("hot");
        let mut a = TestNode::connect(&manager, 1);

        for thread in 1..=2 {
            a.send(&manager, request(&lock_id, thread, LockLevel::Write));
            assert!(matches!(
                a.next(),
                Some(ServerMessage::LockAward { greedy: false, .. })
            ));
            a.send(&manager, unlock(&lock_id, thread));
            assert_eq!(manager.lock_count(), 0);
        }

        a.send(&manager, request(&lock_id, 3, LockLevel::Write));
        assert!(matches!(
            a.next(),
            Some(ServerMessage::LockAward { greedy: true, .. })
        ));
        assert_eq!(
            manager.snapshot(&lock_id).and_then(|s| s.lease).map(|l| l.node),
            Some(a.node)
        );
    }

    #[tokio::test]
    async fn test_reconnect_restarts_request_count() {
        let policy = GreedyPolicy::default()
            .with_threshold(2)
            .with_window(Duration::from_secs(60));
        let manager = ServerLockManager::new(&config().with_greedy(policy));
        let lock_id = LockId::named("hot");

        let mut first = TestNode::connect(&manager, 1);
        first.send(&manager, request(&lock_id, 1, LockLevel::Write));
        first.next();
        first.send(&manager, unlock(&lock_id, 1));
        assert_eq!(manager.request_window_count(), 1);

        let mut second = TestNode::connect(&manager, 1);
        assert_eq!(manager.request_window_count(), 0);
        second.send(&manager, request(&lock_id, 2, LockLevel::Write));
        assert!(matches!(
            second.next(),
            Some(ServerMessage::LockAward { greedy: false, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_request_windows_are_pruned() {
        let policy = GreedyPolicy::default()
            .with_threshold(2)
            .with_window(Duration::from_secs(1));
        let manager = ServerLockManager::new(&config().with_greedy(policy));
        let lock_id = LockId::named("cold");
        let mut a = TestNode::connect(&manager, 1);

        a.send(&manager, request(&lock_id, 1, LockLevel::Write));
        a.next();
        a.send(&manager, unlock(&lock_id, 1));
        assert_eq!(manager.prune_request_windows(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(manager.prune_request_windows(), 1);
        assert_eq!(manager.request_window_count(), 0);

        // The window closed, so the next request starts counting from one
        a.send(&manager, request(&lock_id, 2, LockLevel::Write));
        assert!(matches!(
            a.next(),
            Some(ServerMessage::LockAward { greedy: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_query_and_wait_round_trip() {
        let manager = ServerLockManager::new(&config());
        let lock_id = LockId::named("monitor");
        let mut a = TestNode::connect(&manager, 1);

        a.send(
            &manager,
            ClientMessage::Wait {
                lock_id: lock_id.clone(),
                thread: ThreadId::new(1),
                timeout_millis: 0,
            },
        );
        assert!(matches!(
            a.next(),
            Some(ServerMessage::LockReject {
                reason: RejectReason::IllegalMonitorState,
                ..
            })
        ));

        a.send(
            &manager,
            ClientMessage::Query {
                lock_id: lock_id.clone(),
                thread: ThreadId::new(1),
            },
        );
        assert_eq!(
            a.next(),
            Some(ServerMessage::QueryResponse {
                lock_id: lock_id.clone(),
                thread: ThreadId::new(1),
                holders: vec![],
                pending: 0,
                waiters: 0,
            })
        );
        assert_eq!(manager.lock_count(), 0);
    }
}
