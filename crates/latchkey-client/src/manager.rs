//! Client lock manager
//!
//! The public lock API of a node. Requests are arbitrated against the
//! [`ClientLockTable`] first; only requests the node cannot serve locally are
//! forwarded to the server through the outbound channel. Parked callers wait
//! on the lock's change notifications and re-check their request on every
//! wakeup.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use latchkey_api::{ClientMessage, HolderInfo, ServerMessage};
use latchkey_common::{LatchkeyError, LockId, LockLevel, NodeId, Result, ThreadId};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::table::{
    Acquire, ClientLock, ClientLockState, ClientLockTable, Outbox, RequestOptions, RequestPoll,
};

/// Cluster-wide view of a lock as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalLockInfo {
    pub holders: Vec<HolderInfo>,
    pub pending: u32,
    pub waiters: u32,
}

/// Node-local lock manager.
pub struct ClientLockManager {
    node: NodeId,
    table: ClientLockTable,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    /// Only changed while every table shard is locked
    connected: AtomicBool,
    shutdown: AtomicBool,
    next_thread: AtomicU64,
    next_sequence: AtomicU64,
    queries: DashMap<(LockId, ThreadId), oneshot::Sender<GlobalLockInfo>>,
    request_timeout: Duration,
}

impl ClientLockManager {
    /// Create a manager whose protocol messages are written to `outbound`.
    /// The manager starts paused; call [`resync`](Self::resync) once a
    /// server session is established.
    pub fn new(
        node: NodeId,
        shard_count: usize,
        request_timeout: Duration,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        Self {
            node,
            table: ClientLockTable::new(node, shard_count),
            outbound,
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            next_thread: AtomicU64::new(1),
            next_sequence: AtomicU64::new(1),
            queries: DashMap::new(),
            request_timeout,
        }
    }

    pub fn from_config(
        config: &ClientConfig,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        Self::new(
            config.resolve_node_id(),
            config.shard_count,
            config.request_timeout(),
            outbound,
        )
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Allocate a thread id unique within this node.
    pub fn new_thread_id(&self) -> ThreadId {
        ThreadId::new(self.next_thread.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of lock entries currently tracked.
    pub fn lock_count(&self) -> usize {
        self.table.len()
    }

    fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(LatchkeyError::Shutdown);
        }
        Ok(())
    }

    /// Hand messages to the network. Must run under the shard lock of the
    /// lock that produced them.
    fn dispatch(&self, out: Outbox) {
        if out.is_empty() {
            return;
        }
        if !self.is_connected() {
            debug!(messages = out.len(), "Dropping messages while paused");
            return;
        }
        for message in out.into_messages() {
            if self.outbound.send(message).is_err() {
                debug!("Outbound channel closed");
                return;
            }
        }
    }

    fn apply<R>(&self, lock_id: &LockId, f: impl FnOnce(&mut ClientLock, bool, &mut Outbox) -> R) -> R {
        self.table.with_lock(lock_id, |lock| {
            let mut out = Outbox::new();
            let result = f(lock, self.is_connected(), &mut out);
            self.dispatch(out);
            result
        })
    }

    fn apply_existing<R>(
        &self,
        lock_id: &LockId,
        f: impl FnOnce(&mut ClientLock, bool, &mut Outbox) -> R,
    ) -> Option<R> {
        self.table.with_existing(lock_id, |lock| {
            let mut out = Outbox::new();
            let result = f(lock, self.is_connected(), &mut out);
            self.dispatch(out);
            result
        })
    }

    // ============== Lock / Unlock ==============

    /// Acquire `lock_id` at `level`, blocking until granted.
    pub async fn lock(&self, lock_id: &LockId, thread: ThreadId, level: LockLevel) -> Result<()> {
        self.acquire(lock_id, thread, level, RequestOptions::default())
            .await
            .map(|_| ())
    }

    /// Like [`lock`](Self::lock) but gives up with `Interrupted` when
    /// [`interrupt`](Self::interrupt) is called for the thread.
    pub async fn lock_interruptibly(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        level: LockLevel,
    ) -> Result<()> {
        let options = RequestOptions {
            deadline: None,
            interruptible: true,
        };
        self.acquire(lock_id, thread, level, options).await.map(|_| ())
    }

    /// Try to acquire within `timeout`. A zero timeout succeeds only if the
    /// lock is available right away.
    pub async fn try_lock(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        level: LockLevel,
        timeout: Duration,
    ) -> Result<bool> {
        let options = RequestOptions {
            deadline: Some(tokio::time::Instant::now() + timeout),
            interruptible: true,
        };
        self.acquire(lock_id, thread, level, options).await
    }

    async fn acquire(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        level: LockLevel,
        options: RequestOptions,
    ) -> Result<bool> {
        self.ensure_running()?;
        let sequence = self.next_sequence();
        let acquired = self.apply(lock_id, |lock, connected, out| {
            lock.request(thread, level, sequence, options, connected, out)
        })?;
        if acquired == Acquire::Granted {
            return Ok(true);
        }

        let mut guard = ParkGuard::new(self, lock_id, sequence);
        let mut expired = false;
        loop {
            let (poll, changes) = self.poll(lock_id, sequence);
            match poll {
                RequestPoll::Awarded { .. } => {
                    guard.disarm();
                    return Ok(true);
                }
                RequestPoll::Rejected(reason) => {
                    guard.disarm();
                    if options.deadline.is_some() {
                        return Ok(false);
                    }
                    return Err(LatchkeyError::Rejected {
                        lock_id: lock_id.clone(),
                        reason,
                    });
                }
                RequestPoll::Missing => {
                    guard.disarm();
                    return Err(LatchkeyError::Disconnected);
                }
                RequestPoll::Waiting {
                    interrupted: true, ..
                } => {
                    return Err(LatchkeyError::Interrupted {
                        lock_id: lock_id.clone(),
                    });
                }
                RequestPoll::Waiting { .. } if self.is_shutdown() => {
                    return Err(LatchkeyError::Shutdown);
                }
                RequestPoll::Waiting { .. } if expired => return Ok(false),
                RequestPoll::Waiting { sent, .. } => {
                    let Some(mut changes) = changes else {
                        continue;
                    };
                    let limit = options.deadline.map(|deadline| {
                        if sent {
                            deadline + self.request_timeout
                        } else {
                            deadline
                        }
                    });
                    match limit {
                        Some(limit) => {
                            if tokio::time::timeout_at(limit, changes.changed())
                                .await
                                .is_err()
                            {
                                expired = true;
                            }
                        }
                        None => {
                            let _ = changes.changed().await;
                        }
                    }
                }
            }
        }
    }

    fn poll(&self, lock_id: &LockId, sequence: u64) -> (RequestPoll, Option<watch::Receiver<u64>>) {
        self.table
            .with_existing(lock_id, |lock| {
                let poll = lock.poll(sequence);
                let changes = matches!(poll, RequestPoll::Waiting { .. }).then(|| lock.subscribe());
                (poll, changes)
            })
            .unwrap_or((RequestPoll::Missing, None))
    }

    fn cancel(&self, lock_id: &LockId, sequence: u64) {
        self.apply_existing(lock_id, |lock, connected, out| {
            lock.cancel(sequence, connected, out)
        });
    }

    /// Release one hold of `thread` on `lock_id` at `level`.
    pub fn unlock(&self, lock_id: &LockId, thread: ThreadId, level: LockLevel) -> Result<()> {
        self.apply_existing(lock_id, |lock, connected, out| {
            lock.release(thread, level, connected, out)
        })
        .unwrap_or_else(|| {
            Err(LatchkeyError::NotHeld {
                lock_id: lock_id.clone(),
                thread,
                level,
            })
        })
    }

    // ============== Wait / Notify ==============

    /// Release the thread's WRITE hold, park until notified (or until the
    /// server-side `timeout` elapses), then re-acquire the previous holds.
    pub async fn wait(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ensure_running()?;
        let illegal = || LatchkeyError::IllegalMonitorState {
            lock_id: lock_id.clone(),
            thread,
        };
        let sequence = self.next_sequence();
        let timeout_millis = timeout.map_or(0, |t| (t.as_millis() as u64).max(1));
        self.apply_existing(lock_id, |lock, connected, out| {
            lock.wait(thread, timeout_millis, sequence, connected, out)
        })
        .unwrap_or_else(|| Err(illegal()))?;

        let mut guard = ParkGuard::new(self, lock_id, sequence);
        loop {
            let (poll, changes) = self.poll(lock_id, sequence);
            match poll {
                RequestPoll::Awarded { interrupted } => {
                    guard.disarm();
                    if interrupted {
                        return Err(LatchkeyError::Interrupted {
                            lock_id: lock_id.clone(),
                        });
                    }
                    return Ok(());
                }
                RequestPoll::Rejected(reason) => {
                    guard.disarm();
                    return Err(LatchkeyError::Rejected {
                        lock_id: lock_id.clone(),
                        reason,
                    });
                }
                RequestPoll::Missing => {
                    guard.disarm();
                    return Err(LatchkeyError::Disconnected);
                }
                RequestPoll::Waiting { .. } if self.is_shutdown() => {
                    return Err(LatchkeyError::Shutdown);
                }
                RequestPoll::Waiting { .. } => {
                    if let Some(mut changes) = changes {
                        let _ = changes.changed().await;
                    }
                }
            }
        }
    }

    /// Wake the oldest waiter on `lock_id` anywhere in the cluster.
    pub fn notify(&self, lock_id: &LockId, thread: ThreadId) -> Result<()> {
        self.send_notify(lock_id, thread, false)
    }

    /// Wake every waiter on `lock_id` anywhere in the cluster.
    pub fn notify_all(&self, lock_id: &LockId, thread: ThreadId) -> Result<()> {
        self.send_notify(lock_id, thread, true)
    }

    fn send_notify(&self, lock_id: &LockId, thread: ThreadId, all: bool) -> Result<()> {
        self.apply_existing(lock_id, |lock, _, out| lock.notify(thread, all, out))
            .unwrap_or_else(|| {
                Err(LatchkeyError::IllegalMonitorState {
                    lock_id: lock_id.clone(),
                    thread,
                })
            })
    }

    /// Interrupt a waiting or interruptibly-locking thread. Returns false
    /// when the thread was not parked on `lock_id`.
    pub fn interrupt(&self, lock_id: &LockId, thread: ThreadId) -> bool {
        self.apply_existing(lock_id, |lock, connected, out| {
            lock.interrupt(thread, connected, out)
        })
        .unwrap_or(false)
    }

    // ============== Introspection ==============

    pub fn is_locked(&self, lock_id: &LockId) -> bool {
        self.table
            .with_existing(lock_id, |lock| lock.is_held())
            .unwrap_or(false)
    }

    pub fn is_locked_by_thread(&self, lock_id: &LockId, thread: ThreadId, level: LockLevel) -> bool {
        self.table
            .with_existing(lock_id, |lock| lock.is_held_by(thread, level))
            .unwrap_or(false)
    }

    /// Holds of all local threads, at `level` or at every level.
    pub fn local_hold_count(&self, lock_id: &LockId, level: Option<LockLevel>) -> u32 {
        self.table
            .with_existing(lock_id, |lock| lock.local_hold_count(level))
            .unwrap_or(0)
    }

    pub fn thread_hold_count(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        level: Option<LockLevel>,
    ) -> u32 {
        self.table
            .with_existing(lock_id, |lock| lock.thread_hold_count(thread, level))
            .unwrap_or(0)
    }

    pub fn local_pending_count(&self, lock_id: &LockId) -> usize {
        self.table
            .with_existing(lock_id, |lock| lock.pending_count())
            .unwrap_or(0)
    }

    pub fn local_waiting_count(&self, lock_id: &LockId) -> usize {
        self.table
            .with_existing(lock_id, |lock| lock.waiter_count())
            .unwrap_or(0)
    }

    pub fn lock_state(&self, lock_id: &LockId) -> ClientLockState {
        self.table
            .with_existing(lock_id, |lock| lock.state())
            .unwrap_or(ClientLockState::Unheld)
    }

    /// Ask the server for the cluster-wide state of `lock_id`.
    pub async fn query(&self, lock_id: &LockId, thread: ThreadId) -> Result<GlobalLockInfo> {
        self.ensure_running()?;
        if !self.is_connected() {
            return Err(LatchkeyError::Disconnected);
        }
        let key = (lock_id.clone(), thread);
        let (tx, rx) = oneshot::channel();
        self.queries.insert(key.clone(), tx);

        let message = ClientMessage::Query {
            lock_id: lock_id.clone(),
            thread,
        };
        if self.outbound.send(message).is_err() {
            self.queries.remove(&key);
            return Err(LatchkeyError::Disconnected);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(_)) => Err(LatchkeyError::Disconnected),
            Err(_) => {
                self.queries.remove(&key);
                Err(LatchkeyError::Timeout {
                    lock_id: lock_id.clone(),
                    timeout: self.request_timeout,
                })
            }
        }
    }

    pub async fn global_hold_count(&self, lock_id: &LockId, thread: ThreadId) -> Result<usize> {
        Ok(self.query(lock_id, thread).await?.holders.len())
    }

    pub async fn global_pending_count(&self, lock_id: &LockId, thread: ThreadId) -> Result<u32> {
        Ok(self.query(lock_id, thread).await?.pending)
    }

    pub async fn global_waiting_count(&self, lock_id: &LockId, thread: ThreadId) -> Result<u32> {
        Ok(self.query(lock_id, thread).await?.waiters)
    }

    // ============== Pinning / Flush / GC ==============

    /// Keep the lock's entry (and its idle lease) out of lock GC.
    pub fn pin(&self, lock_id: &LockId) {
        self.table.with_lock(lock_id, |lock| lock.pin());
    }

    pub fn unpin(&self, lock_id: &LockId) {
        self.table.with_existing(lock_id, |lock| lock.unpin());
    }

    /// Surrender the node's lease on `lock_id` once its local holders
    /// drain. Returns true when it was surrendered right away.
    pub fn flush(&self, lock_id: &LockId) -> bool {
        self.apply_existing(lock_id, |lock, connected, out| lock.flush(connected, out))
            .unwrap_or(false)
    }

    /// Flush every lease. Idle leases are surrendered in one batched UNLOCK.
    pub fn flush_all(&self) -> usize {
        let connected = self.is_connected();
        let mut shards = self.table.lock_all();
        let mut out = Outbox::new();
        let mut surrendered = 0;
        for shard in shards.iter_mut() {
            for lock in shard.values_mut() {
                if lock.flush(connected, &mut out) {
                    surrendered += 1;
                }
            }
        }
        self.dispatch(out);
        surrendered
    }

    /// Drop idle, unpinned entries and surrender their leases.
    pub fn run_lock_gc(&self) -> usize {
        let mut shards = self.table.lock_all();
        let mut out = Outbox::new();
        let mut removed = 0;
        for shard in shards.iter_mut() {
            shard.retain(|_, lock| {
                let collect = lock.collect(&mut out);
                if collect {
                    removed += 1;
                }
                !collect
            });
        }
        self.dispatch(out);
        removed
    }

    // ============== Server Messages ==============

    /// Apply a message received from the server.
    pub fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { session } => {
                debug!(%session, "Ignoring WELCOME outside of handshake");
            }
            ServerMessage::LockAward {
                lock_id,
                thread,
                level,
                greedy,
                epoch,
            } => self.apply(&lock_id, |lock, connected, out| {
                lock.on_award(thread, level, greedy, epoch, connected, out)
            }),
            ServerMessage::LockReject {
                lock_id,
                thread,
                reason,
            } => {
                self.apply_existing(&lock_id, |lock, connected, out| {
                    lock.on_reject(thread, reason, connected, out)
                });
            }
            ServerMessage::LockRecall { lock_id, epoch } => {
                let known = self.apply_existing(&lock_id, |lock, connected, out| {
                    lock.on_recall(epoch, connected, out)
                });
                if known.is_none() {
                    debug!(%lock_id, epoch, "Recall for unknown lock");
                }
            }
            ServerMessage::Notified {
                lock_id,
                thread,
                reacquire_pending,
            } => {
                self.apply_existing(&lock_id, |lock, connected, out| {
                    lock.on_notified(thread, reacquire_pending, connected, out)
                });
            }
            ServerMessage::QueryResponse {
                lock_id,
                thread,
                holders,
                pending,
                waiters,
            } => match self.queries.remove(&(lock_id, thread)) {
                Some((_, tx)) => {
                    let _ = tx.send(GlobalLockInfo {
                        holders,
                        pending,
                        waiters,
                    });
                }
                None => debug!(%thread, "Query response without a caller"),
            },
        }
    }

    // ============== Session Lifecycle ==============

    /// Stop remote traffic after the connection was lost.
    pub fn pause(&self) {
        {
            let _shards = self.table.lock_all();
            if self.connected.swap(false, Ordering::AcqRel) {
                info!(node = %self.node, "Lock manager paused");
            }
        }
        // Outstanding queries fail with Disconnected
        self.queries.clear();
    }

    /// Rebuild state for a fresh server session and resume remote traffic.
    pub fn resync(&self) {
        let mut shards = self.table.lock_all();
        self.connected.store(true, Ordering::Release);
        let mut out = Outbox::new();
        let mut locks = 0;
        for shard in shards.iter_mut() {
            for lock in shard.values_mut() {
                lock.resync(&mut out);
                locks += 1;
            }
        }
        info!(node = %self.node, locks, messages = out.len(), "Lock manager resynchronized");
        self.dispatch(out);
    }

    /// Refuse new operations, surrender idle leases and wake parked callers.
    /// Returns the number of leases surrendered.
    pub fn shutdown(&self) -> usize {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let surrendered = self.flush_all();
        for shard in self.table.lock_all().iter() {
            for lock in shard.values() {
                lock.touch();
            }
        }
        if surrendered > 0 {
            info!(node = %self.node, surrendered, "Surrendered greedy leases on shutdown");
        }
        surrendered
    }
}

/// Cancels a parked request if the waiting future is dropped or gives up.
struct ParkGuard<'a> {
    manager: &'a ClientLockManager,
    lock_id: &'a LockId,
    sequence: u64,
    armed: bool,
}

impl<'a> ParkGuard<'a> {
    fn new(manager: &'a ClientLockManager, lock_id: &'a LockId, sequence: u64) -> Self {
        Self {
            manager,
            lock_id,
            sequence,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ParkGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(lock_id = %self.lock_id, sequence = self.sequence, "Abandoning parked lock request");
            self.manager.cancel(self.lock_id, self.sequence);
        }
    }
}
