//! Client lock table
//!
//! Per-node lock state, sharded by lock id so that unrelated locks never
//! contend. Every mutation of a [`ClientLock`] happens under its shard mutex;
//! the protocol messages a mutation produces are collected in an [`Outbox`]
//! and handed to the network before the shard is released, which keeps the
//! per-lock message order identical to the order of state changes.

use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};

use latchkey_api::{ClientMessage, UnlockEntry};
use latchkey_common::{
    Epoch, GreedyLease, LatchkeyError, LockId, LockLevel, NodeId, RejectReason, Result, ThreadId,
};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Client-side lifecycle of a single lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLockState {
    Unheld,
    /// A request is outstanding and no local thread holds the lock
    Pending,
    Held,
    /// The node holds a greedy lease
    Greedy,
    /// The greedy lease is being drained for the server
    Recalled,
}

impl ClientLockState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientLockState::Unheld => "UNHELD",
            ClientLockState::Pending => "PENDING",
            ClientLockState::Held => "HELD",
            ClientLockState::Greedy => "GREEDY",
            ClientLockState::Recalled => "RECALLED",
        }
    }
}

impl Display for ClientLockState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A thread's reentrant hold at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockHold {
    pub level: LockLevel,
    pub count: u32,
}

/// What the server knows about a thread's holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    /// The server records this thread as a holder at the given level
    Remote(LockLevel),
    /// Served by the node's greedy lease; the server has no per-thread record
    Lease,
}

#[derive(Debug)]
struct ThreadHolds {
    holds: Vec<LockHold>,
    backing: Backing,
}

impl ThreadHolds {
    fn new(holds: Vec<LockHold>, backing: Backing) -> Self {
        Self { holds, backing }
    }

    fn count(&self, level: LockLevel) -> u32 {
        self.holds
            .iter()
            .find(|h| h.level == level)
            .map_or(0, |h| h.count)
    }

    fn total(&self) -> u32 {
        self.holds.iter().map(|h| h.count).sum()
    }

    fn has_write(&self) -> bool {
        self.holds.iter().any(|h| h.level.is_write())
    }

    fn strongest(&self) -> LockLevel {
        if self.has_write() {
            LockLevel::Write
        } else {
            LockLevel::Read
        }
    }

    fn conflicts_with(&self, level: LockLevel) -> bool {
        self.holds.iter().any(|h| h.level.conflicts_with(level))
    }

    fn add(&mut self, level: LockLevel) {
        match self.holds.iter_mut().find(|h| h.level == level) {
            Some(hold) => hold.count += 1,
            None => self.holds.push(LockHold { level, count: 1 }),
        }
    }

    fn merge(&mut self, holds: Vec<LockHold>) {
        for hold in holds {
            match self.holds.iter_mut().find(|h| h.level == hold.level) {
                Some(existing) => existing.count += hold.count,
                None => self.holds.push(hold),
            }
        }
    }

    /// Drop one hold at `level`; false when none is held.
    fn remove_one(&mut self, level: LockLevel) -> bool {
        let Some(pos) = self.holds.iter().position(|h| h.level == level) else {
            return false;
        };
        self.holds[pos].count -= 1;
        if self.holds[pos].count == 0 {
            self.holds.remove(pos);
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestStatus {
    /// Waiting on local arbitration, not sent to the server
    Local,
    Sent,
    Awarded,
    Rejected(RejectReason),
}

#[derive(Debug)]
enum RequestKind {
    Acquire,
    /// A woken waiter re-acquiring WRITE; restores the saved holds
    Reacquire(Vec<LockHold>),
    /// Re-announces an existing hold to the server after resync
    Reannounce,
}

#[derive(Debug)]
struct PendingRequest {
    thread: ThreadId,
    level: LockLevel,
    sequence: u64,
    status: RequestStatus,
    kind: RequestKind,
    /// Try-lock deadline; try requests fail instead of re-issuing after resync
    deadline: Option<Instant>,
    interruptible: bool,
    interrupted: bool,
}

#[derive(Debug)]
struct Waiter {
    thread: ThreadId,
    saved: Vec<LockHold>,
    sequence: u64,
    interrupted: bool,
}

/// Options for a new lock request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Local deadline of a try-lock; `None` blocks until granted
    pub deadline: Option<Instant>,
    pub interruptible: bool,
}

/// Result of [`ClientLock::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    /// Parked; poll with the returned sequence
    Queued(u64),
}

/// Observed state of a parked request or waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPoll {
    Waiting { sent: bool, interrupted: bool },
    Awarded { interrupted: bool },
    Rejected(RejectReason),
    Missing,
}

/// Messages produced by lock mutations, in emission order.
///
/// Consecutive unlock entries are coalesced into one batched UNLOCK.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<ClientMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ClientMessage) {
        self.messages.push(message);
    }

    pub fn push_unlock(&mut self, entry: UnlockEntry) {
        if let Some(ClientMessage::Unlock { entries }) = self.messages.last_mut() {
            entries.push(entry);
            return;
        }
        self.messages.push(ClientMessage::Unlock {
            entries: vec![entry],
        });
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, ClientMessage> {
        self.messages.drain(..)
    }

    pub fn into_messages(self) -> Vec<ClientMessage> {
        self.messages
    }
}

/// Client state for one lock.
pub struct ClientLock {
    lock_id: LockId,
    node: NodeId,
    threads: HashMap<ThreadId, ThreadHolds>,
    concurrent: HashMap<ThreadId, u32>,
    pending: VecDeque<PendingRequest>,
    waiters: VecDeque<Waiter>,
    lease: Option<GreedyLease>,
    recalled: bool,
    epoch_seen: Epoch,
    pins: u32,
    version: watch::Sender<u64>,
}

impl ClientLock {
    pub fn new(lock_id: LockId, node: NodeId) -> Self {
        Self {
            lock_id,
            node,
            threads: HashMap::new(),
            concurrent: HashMap::new(),
            pending: VecDeque::new(),
            waiters: VecDeque::new(),
            lease: None,
            recalled: false,
            epoch_seen: 0,
            pins: 0,
            version: watch::Sender::new(0),
        }
    }

    pub fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    pub fn state(&self) -> ClientLockState {
        if self.lease.is_some() {
            if self.recalled {
                ClientLockState::Recalled
            } else {
                ClientLockState::Greedy
            }
        } else if !self.threads.is_empty() || !self.concurrent.is_empty() {
            ClientLockState::Held
        } else if !self.pending.is_empty() || !self.waiters.is_empty() {
            ClientLockState::Pending
        } else {
            ClientLockState::Unheld
        }
    }

    pub fn lease(&self) -> Option<&GreedyLease> {
        self.lease.as_ref()
    }

    /// A receiver that observes every subsequent change to this lock.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn is_held(&self) -> bool {
        !self.threads.is_empty() || !self.concurrent.is_empty()
    }

    pub fn is_held_by(&self, thread: ThreadId, level: LockLevel) -> bool {
        self.thread_hold_count(thread, Some(level)) > 0
    }

    /// Holds of one thread, at `level` or at all levels.
    pub fn thread_hold_count(&self, thread: ThreadId, level: Option<LockLevel>) -> u32 {
        let concurrent = self.concurrent.get(&thread).copied().unwrap_or(0);
        let holds = self.threads.get(&thread);
        match level {
            Some(level) if level.is_concurrent() => concurrent,
            Some(level) => holds.map_or(0, |h| h.count(level)),
            None => holds.map_or(0, |h| h.total()) + concurrent,
        }
    }

    /// Holds of all local threads at `level` or at all levels.
    pub fn local_hold_count(&self, level: Option<LockLevel>) -> u32 {
        let threads: u32 = self
            .threads
            .values()
            .map(|h| match level {
                Some(level) => h.count(level),
                None => h.total(),
            })
            .sum();
        let concurrent: u32 = match level {
            Some(level) if !level.is_concurrent() => 0,
            _ => self.concurrent.values().sum(),
        };
        threads + concurrent
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .iter()
            .filter(|p| matches!(p.status, RequestStatus::Local | RequestStatus::Sent))
            .count()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn pin(&mut self) {
        self.pins += 1;
    }

    pub fn unpin(&mut self) {
        self.pins = self.pins.saturating_sub(1);
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub fn is_idle(&self) -> bool {
        self.threads.is_empty()
            && self.concurrent.is_empty()
            && self.pending.is_empty()
            && self.waiters.is_empty()
    }

    /// Start an acquisition. Reentrant and nested acquisitions are served
    /// immediately; anything else is parked as a pending request.
    pub fn request(
        &mut self,
        thread: ThreadId,
        level: LockLevel,
        sequence: u64,
        options: RequestOptions,
        connected: bool,
        out: &mut Outbox,
    ) -> Result<Acquire> {
        if level.is_concurrent() {
            *self.concurrent.entry(thread).or_default() += 1;
            self.bump();
            return Ok(Acquire::Granted);
        }

        if let Some(holds) = self.threads.get_mut(&thread) {
            if !holds.has_write() && level.is_write() {
                return Err(LatchkeyError::UpgradeNotSupported {
                    lock_id: self.lock_id.clone(),
                    thread,
                });
            }
            holds.add(level);
            self.bump();
            return Ok(Acquire::Granted);
        }

        let outstanding = self
            .pending
            .iter()
            .any(|p| p.thread == thread && !matches!(p.kind, RequestKind::Reannounce))
            || self.waiters.iter().any(|w| w.thread == thread);
        if outstanding {
            return Err(LatchkeyError::RequestOutstanding {
                lock_id: self.lock_id.clone(),
                thread,
            });
        }

        self.pending.push_back(PendingRequest {
            thread,
            level,
            sequence,
            status: RequestStatus::Local,
            kind: RequestKind::Acquire,
            deadline: options.deadline,
            interruptible: options.interruptible,
            interrupted: false,
        });
        self.evaluate(connected, out);

        let granted = matches!(
            self.pending.back(),
            Some(p) if p.sequence == sequence && p.status == RequestStatus::Awarded
        );
        if granted {
            self.pending.pop_back();
            return Ok(Acquire::Granted);
        }
        Ok(Acquire::Queued(sequence))
    }

    /// Inspect a parked request; resolved requests are removed.
    pub fn poll(&mut self, sequence: u64) -> RequestPoll {
        if let Some(waiter) = self.waiters.iter().find(|w| w.sequence == sequence) {
            return RequestPoll::Waiting {
                sent: true,
                interrupted: waiter.interrupted,
            };
        }
        let Some(pos) = self.pending.iter().position(|p| p.sequence == sequence) else {
            return RequestPoll::Missing;
        };
        let request = &self.pending[pos];
        let poll = match request.status {
            RequestStatus::Local => RequestPoll::Waiting {
                sent: false,
                interrupted: request.interrupted,
            },
            RequestStatus::Sent => RequestPoll::Waiting {
                sent: true,
                interrupted: request.interrupted,
            },
            RequestStatus::Awarded => RequestPoll::Awarded {
                interrupted: request.interrupted,
            },
            RequestStatus::Rejected(reason) => RequestPoll::Rejected(reason),
        };
        if matches!(poll, RequestPoll::Awarded { .. } | RequestPoll::Rejected(_)) {
            self.pending.remove(pos);
        }
        poll
    }

    /// Abandon a parked request or waiter, undoing any grant that raced in.
    pub fn cancel(&mut self, sequence: u64, connected: bool, out: &mut Outbox) {
        if let Some(pos) = self.waiters.iter().position(|w| w.sequence == sequence) {
            if let Some(waiter) = self.waiters.remove(pos) {
                if connected {
                    out.push(ClientMessage::Interrupt {
                        lock_id: self.lock_id.clone(),
                        thread: waiter.thread,
                    });
                }
            }
        } else if let Some(pos) = self.pending.iter().position(|p| p.sequence == sequence) {
            if let Some(request) = self.pending.remove(pos) {
                if request.status == RequestStatus::Awarded {
                    self.release_thread(request.thread, out);
                }
            }
        } else {
            return;
        }
        self.evaluate(connected, out);
        self.bump();
    }

    /// Release one hold of `thread` at `level`.
    pub fn release(
        &mut self,
        thread: ThreadId,
        level: LockLevel,
        connected: bool,
        out: &mut Outbox,
    ) -> Result<()> {
        let not_held = || LatchkeyError::NotHeld {
            lock_id: self.lock_id.clone(),
            thread,
            level,
        };

        if level.is_concurrent() {
            let count = self.concurrent.get_mut(&thread).ok_or_else(not_held)?;
            *count -= 1;
            if *count == 0 {
                self.concurrent.remove(&thread);
            }
            self.bump();
            return Ok(());
        }

        let holds = self.threads.get_mut(&thread).ok_or_else(not_held)?;
        if !holds.remove_one(level) {
            return Err(not_held());
        }
        if holds.holds.is_empty() {
            self.release_thread(thread, out);
        }
        self.evaluate(connected, out);
        self.bump();
        Ok(())
    }

    fn release_thread(&mut self, thread: ThreadId, out: &mut Outbox) {
        let Some(holds) = self.threads.remove(&thread) else {
            return;
        };
        match holds.backing {
            Backing::Remote(level) => {
                if !self.forget_reannounce(thread) {
                    out.push_unlock(UnlockEntry {
                        lock_id: self.lock_id.clone(),
                        thread,
                        level,
                        epoch: self.epoch_seen,
                    });
                }
            }
            Backing::Lease => self.surrender_if_drained(out),
        }
    }

    /// Drop a thread's unanswered re-announcement; its award will be bounced.
    fn forget_reannounce(&mut self, thread: ThreadId) -> bool {
        let pos = self
            .pending
            .iter()
            .position(|p| p.thread == thread && matches!(p.kind, RequestKind::Reannounce));
        pos.and_then(|pos| self.pending.remove(pos)).is_some()
    }

    fn has_lease_holders(&self) -> bool {
        self.threads.values().any(|h| h.backing == Backing::Lease)
    }

    fn surrender_if_drained(&mut self, out: &mut Outbox) {
        if self.recalled && !self.has_lease_holders() {
            self.surrender(out);
        }
    }

    fn surrender(&mut self, out: &mut Outbox) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        self.recalled = false;
        debug!(
            lock_id = %self.lock_id,
            epoch = lease.epoch,
            level = %lease.level,
            "Surrendering greedy lease"
        );
        out.push_unlock(UnlockEntry {
            lock_id: self.lock_id.clone(),
            thread: ThreadId::NODE,
            level: lease.level,
            epoch: lease.epoch,
        });
    }

    fn local_conflict(&self, thread: ThreadId, level: LockLevel) -> bool {
        self.threads
            .iter()
            .any(|(t, h)| *t != thread && h.conflicts_with(level))
    }

    /// Holders left behind by a revoked lease are unknown to the server, so
    /// they still have to be arbitrated locally.
    fn orphan_conflict(&self, thread: ThreadId, level: LockLevel) -> bool {
        self.lease.is_none()
            && self
                .threads
                .iter()
                .any(|(t, h)| *t != thread && h.backing == Backing::Lease && h.conflicts_with(level))
    }

    /// Advance local requests: grant from the lease where possible (in
    /// arrival order), otherwise forward to the server.
    fn evaluate(&mut self, connected: bool, out: &mut Outbox) {
        if self.recalled {
            return;
        }
        let now = Instant::now();
        let mut lease_blocked = false;
        for index in 0..self.pending.len() {
            let request = &self.pending[index];
            if request.status != RequestStatus::Local {
                continue;
            }
            let (thread, level, deadline) = (request.thread, request.level, request.deadline);

            if self.lease.as_ref().is_some_and(|l| l.covers(level)) {
                if lease_blocked || self.local_conflict(thread, level) {
                    lease_blocked = true;
                    continue;
                }
                self.complete(index, Backing::Lease);
                continue;
            }

            if !connected || self.orphan_conflict(thread, level) {
                continue;
            }
            let try_timeout_millis =
                deadline.map(|d| d.saturating_duration_since(now).as_millis() as u64);
            self.pending[index].status = RequestStatus::Sent;
            out.push(ClientMessage::LockRequest {
                lock_id: self.lock_id.clone(),
                thread,
                level,
                try_timeout_millis,
            });
        }
    }

    /// Turn the request at `index` into holds with the given backing.
    fn complete(&mut self, index: usize, backing: Backing) {
        let request = &mut self.pending[index];
        let thread = request.thread;
        let holds = match &mut request.kind {
            RequestKind::Acquire => vec![LockHold {
                level: request.level,
                count: 1,
            }],
            RequestKind::Reacquire(saved) => std::mem::take(saved),
            RequestKind::Reannounce => {
                if let Some(holds) = self.threads.get_mut(&thread) {
                    holds.backing = backing;
                }
                self.pending.remove(index);
                return;
            }
        };
        request.status = RequestStatus::Awarded;
        match self.threads.get_mut(&thread) {
            Some(existing) => existing.merge(holds),
            None => {
                self.threads.insert(thread, ThreadHolds::new(holds, backing));
            }
        }
    }

    pub fn on_award(
        &mut self,
        thread: ThreadId,
        level: LockLevel,
        greedy: bool,
        epoch: Epoch,
        connected: bool,
        out: &mut Outbox,
    ) {
        if epoch < self.epoch_seen {
            warn!(
                lock_id = %self.lock_id,
                %thread,
                epoch,
                current = self.epoch_seen,
                "Dropping award with stale epoch"
            );
            return;
        }
        self.epoch_seen = epoch;

        if greedy {
            let lease = GreedyLease::new(self.lock_id.clone(), self.node, level, epoch);
            debug!(lock_id = %self.lock_id, epoch, level = %lease.level, "Greedy lease granted");
            let mut index = 0;
            while index < self.pending.len() {
                let request = &mut self.pending[index];
                if request.status == RequestStatus::Sent && lease.covers(request.level) {
                    if matches!(request.kind, RequestKind::Reannounce) {
                        self.complete(index, Backing::Lease);
                        continue;
                    }
                    request.status = RequestStatus::Local;
                }
                index += 1;
            }
            self.lease = Some(lease);
            self.recalled = false;
        } else {
            let sent = self
                .pending
                .iter()
                .position(|p| p.thread == thread && p.status == RequestStatus::Sent);
            match sent {
                Some(index) => {
                    debug!(lock_id = %self.lock_id, %thread, %level, epoch, "Lock awarded");
                    self.complete(index, Backing::Remote(level));
                }
                None => {
                    debug!(lock_id = %self.lock_id, %thread, "Returning unclaimed award");
                    out.push_unlock(UnlockEntry {
                        lock_id: self.lock_id.clone(),
                        thread,
                        level,
                        epoch,
                    });
                }
            }
        }
        self.evaluate(connected, out);
        self.bump();
    }

    pub fn on_recall(&mut self, epoch: Epoch, connected: bool, out: &mut Outbox) {
        match &self.lease {
            Some(lease) if lease.epoch == epoch => {
                info!(lock_id = %self.lock_id, epoch, "Greedy lease recalled");
                self.recalled = true;
                self.surrender_if_drained(out);
                self.evaluate(connected, out);
                self.bump();
            }
            _ => debug!(lock_id = %self.lock_id, epoch, "Ignoring recall for superseded lease"),
        }
    }

    pub fn on_reject(
        &mut self,
        thread: ThreadId,
        reason: RejectReason,
        connected: bool,
        out: &mut Outbox,
    ) {
        if thread.is_node() {
            if let RejectReason::StaleEpoch(epoch) = reason {
                if self.lease.as_ref().is_some_and(|l| l.epoch <= epoch) {
                    warn!(lock_id = %self.lock_id, epoch, "Greedy lease revoked by server");
                    self.lease = None;
                    self.recalled = false;
                    self.evaluate(connected, out);
                    self.bump();
                }
            }
            return;
        }

        let sent = self.pending.iter_mut().find(|p| {
            p.thread == thread
                && p.status == RequestStatus::Sent
                && !matches!(p.kind, RequestKind::Reannounce)
        });
        if let Some(request) = sent {
            request.status = RequestStatus::Rejected(reason);
            self.bump();
            return;
        }

        if reason == RejectReason::IllegalMonitorState {
            if let Some(pos) = self.waiters.iter().position(|w| w.thread == thread) {
                warn!(lock_id = %self.lock_id, %thread, "Server refused wait, waking thread");
                self.wake(pos, false, connected, out);
                return;
            }
            // The caller of notify has already returned
            warn!(
                lock_id = %self.lock_id,
                %thread,
                "Server refused notify, no waiter was woken"
            );
            return;
        }
        debug!(lock_id = %self.lock_id, %thread, %reason, "Unmatched rejection");
    }

    /// Park `thread` on the lock's wait set, releasing all of its holds.
    pub fn wait(
        &mut self,
        thread: ThreadId,
        timeout_millis: u64,
        sequence: u64,
        connected: bool,
        out: &mut Outbox,
    ) -> Result<()> {
        if !self.threads.get(&thread).is_some_and(|h| h.has_write()) {
            return Err(LatchkeyError::IllegalMonitorState {
                lock_id: self.lock_id.clone(),
                thread,
            });
        }
        let Some(holds) = self.threads.remove(&thread) else {
            return Ok(());
        };
        self.forget_reannounce(thread);

        out.push(ClientMessage::Wait {
            lock_id: self.lock_id.clone(),
            thread,
            timeout_millis,
        });
        self.waiters.push_back(Waiter {
            thread,
            saved: holds.holds,
            sequence,
            interrupted: false,
        });
        if holds.backing == Backing::Lease {
            self.surrender_if_drained(out);
        }
        self.evaluate(connected, out);
        self.bump();
        Ok(())
    }

    pub fn notify(&mut self, thread: ThreadId, all: bool, out: &mut Outbox) -> Result<()> {
        if !self.threads.get(&thread).is_some_and(|h| h.has_write()) {
            return Err(LatchkeyError::IllegalMonitorState {
                lock_id: self.lock_id.clone(),
                thread,
            });
        }
        out.push(ClientMessage::Notify {
            lock_id: self.lock_id.clone(),
            thread,
            all,
        });
        Ok(())
    }

    pub fn on_notified(
        &mut self,
        thread: ThreadId,
        reacquire_pending: bool,
        connected: bool,
        out: &mut Outbox,
    ) {
        match self.waiters.iter().position(|w| w.thread == thread) {
            Some(pos) => self.wake(pos, reacquire_pending && connected, connected, out),
            None => debug!(lock_id = %self.lock_id, %thread, "Wake for unknown waiter"),
        }
    }

    /// Turn a waiter into a WRITE re-acquisition.
    fn wake(&mut self, pos: usize, sent: bool, connected: bool, out: &mut Outbox) {
        let Some(waiter) = self.waiters.remove(pos) else {
            return;
        };
        self.pending.push_back(PendingRequest {
            thread: waiter.thread,
            level: LockLevel::Write,
            sequence: waiter.sequence,
            status: if sent {
                RequestStatus::Sent
            } else {
                RequestStatus::Local
            },
            kind: RequestKind::Reacquire(waiter.saved),
            deadline: None,
            interruptible: false,
            interrupted: waiter.interrupted,
        });
        self.evaluate(connected, out);
        self.bump();
    }

    /// Interrupt a parked waiter or an interruptible request of `thread`.
    pub fn interrupt(&mut self, thread: ThreadId, connected: bool, out: &mut Outbox) -> bool {
        if let Some(waiter) = self.waiters.iter_mut().find(|w| w.thread == thread) {
            if !waiter.interrupted {
                waiter.interrupted = true;
                if connected {
                    out.push(ClientMessage::Interrupt {
                        lock_id: self.lock_id.clone(),
                        thread,
                    });
                }
                self.bump();
            }
            return true;
        }

        let request = self.pending.iter_mut().find(|p| {
            p.thread == thread
                && matches!(p.status, RequestStatus::Local | RequestStatus::Sent)
                && (p.interruptible || matches!(p.kind, RequestKind::Reacquire(_)))
        });
        match request {
            Some(request) => {
                request.interrupted = true;
                self.bump();
                true
            }
            None => false,
        }
    }

    /// Surrender the lease as soon as its local holders drain. Returns true
    /// when it was surrendered immediately.
    pub fn flush(&mut self, connected: bool, out: &mut Outbox) -> bool {
        if self.lease.is_none() {
            return false;
        }
        self.recalled = true;
        self.surrender_if_drained(out);
        let surrendered = self.lease.is_none();
        self.evaluate(connected, out);
        self.bump();
        surrendered
    }

    /// Called by lock GC: surrender an idle lease and report whether the
    /// entry can be dropped.
    pub fn collect(&mut self, out: &mut Outbox) -> bool {
        if !self.is_idle() || self.is_pinned() {
            return false;
        }
        self.surrender(out);
        true
    }

    /// Rebuild this lock's state for a fresh server session.
    ///
    /// Local holds are kept and re-announced as fresh requests. Until the
    /// server awards a re-announcement the hold is unconfirmed: the server
    /// may already have granted the lock to another node, so a thread that
    /// still holds WRITE here can overlap with that grant. See
    /// [`unconfirmed_holds`](Self::unconfirmed_holds).
    pub fn resync(&mut self, out: &mut Outbox) {
        self.lease = None;
        self.recalled = false;
        self.epoch_seen = 0;

        self.pending
            .retain(|p| !matches!(p.kind, RequestKind::Reannounce));
        for request in self.pending.iter_mut() {
            if request.status != RequestStatus::Sent {
                continue;
            }
            request.status = match (&request.kind, request.deadline) {
                (RequestKind::Acquire, Some(_)) => RequestStatus::Rejected(RejectReason::TimedOut),
                _ => RequestStatus::Local,
            };
        }

        while let Some(waiter) = self.waiters.pop_front() {
            self.pending.push_back(PendingRequest {
                thread: waiter.thread,
                level: LockLevel::Write,
                sequence: waiter.sequence,
                status: RequestStatus::Local,
                kind: RequestKind::Reacquire(waiter.saved),
                deadline: None,
                interruptible: false,
                interrupted: waiter.interrupted,
            });
        }

        let mut threads: Vec<_> = self.threads.iter_mut().collect();
        threads.sort_by_key(|(thread, _)| **thread);
        for (thread, holds) in threads {
            let level = holds.strongest();
            holds.backing = Backing::Remote(level);
            self.pending.push_front(PendingRequest {
                thread: *thread,
                level,
                sequence: 0,
                status: RequestStatus::Sent,
                kind: RequestKind::Reannounce,
                deadline: None,
                interruptible: false,
                interrupted: false,
            });
            out.push(ClientMessage::LockRequest {
                lock_id: self.lock_id.clone(),
                thread: *thread,
                level,
                try_timeout_millis: None,
            });
        }

        let unconfirmed = self.unconfirmed_holds();
        if unconfirmed > 0 {
            warn!(
                lock_id = %self.lock_id,
                threads = unconfirmed,
                "Re-announced local holds, unconfirmed until the server awards them"
            );
        }

        self.evaluate(true, out);
        self.bump();
    }

    /// Threads whose local hold was re-announced and not yet awarded again.
    pub fn unconfirmed_holds(&self) -> usize {
        self.pending
            .iter()
            .filter(|p| matches!(p.kind, RequestKind::Reannounce) && p.status == RequestStatus::Sent)
            .count()
    }

    /// Wake parked tasks without changing state, so they re-check shutdown.
    pub fn touch(&self) {
        self.bump();
    }
}

type Shard = HashMap<LockId, ClientLock>;

/// Sharded map of lock id to [`ClientLock`].
pub struct ClientLockTable {
    node: NodeId,
    shards: Vec<Mutex<Shard>>,
}

impl ClientLockTable {
    pub fn new(node: NodeId, shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { node, shards }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, lock_id: &LockId) -> &Mutex<Shard> {
        &self.shards[lock_id.shard_index(self.shards.len())]
    }

    /// Run `f` on the lock's entry, creating it if needed.
    pub fn with_lock<R>(&self, lock_id: &LockId, f: impl FnOnce(&mut ClientLock) -> R) -> R {
        let mut shard = self.shard(lock_id).lock();
        if let Some(lock) = shard.get_mut(lock_id) {
            return f(lock);
        }
        let lock = shard
            .entry(lock_id.clone())
            .or_insert_with(|| ClientLock::new(lock_id.clone(), self.node));
        f(lock)
    }

    /// Run `f` on the lock's entry if one exists.
    pub fn with_existing<R>(
        &self,
        lock_id: &LockId,
        f: impl FnOnce(&mut ClientLock) -> R,
    ) -> Option<R> {
        let mut shard = self.shard(lock_id).lock();
        shard.get_mut(lock_id).map(f)
    }

    /// Lock every shard in index order.
    pub fn lock_all(&self) -> Vec<MutexGuard<'_, Shard>> {
        self.shards.iter().map(|s| s.lock()).collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE: NodeId = NodeId(1);
    const T1: ThreadId = ThreadId(1);
    const T2: ThreadId = ThreadId(2);
    const T3: ThreadId = ThreadId(3);

    fn new_lock() -> ClientLock {
        ClientLock::new(LockId::named("L"), NODE)
    }

    fn blocking() -> RequestOptions {
        RequestOptions::default()
    }

    fn unlock_entries(out: Outbox) -> Vec<UnlockEntry> {
        out.into_messages()
            .into_iter()
            .flat_map(|m| match m {
                ClientMessage::Unlock { entries } => entries,
                other => panic!("unexpected message {:?}", other),
            })
            .collect()
    }

    /// Grant `thread` a WRITE lease on a fresh lock.
    fn greedy_lock(epoch: Epoch) -> ClientLock {
        let mut lock = new_lock();
        let mut out = Outbox::new();
        let queued = lock
            .request(T1, LockLevel::Write, 1, blocking(), true, &mut out)
            .unwrap();
        assert_eq!(queued, Acquire::Queued(1));
        lock.on_award(T1, LockLevel::Write, true, epoch, true, &mut out);
        assert_eq!(lock.poll(1), RequestPoll::Awarded { interrupted: false });
        lock
    }

    // ============== Acquire / Release Tests ==============

    #[test]
    fn test_remote_acquire_and_reentrant_release() {
        let mut lock = new_lock();
        let mut out = Outbox::new();

        let queued = lock
            .request(T1, LockLevel::Write, 1, blocking(), true, &mut out)
            .unwrap();
        assert_eq!(queued, Acquire::Queued(1));
        assert_eq!(lock.state(), ClientLockState::Pending);
        let sent = out.into_messages();
        assert!(matches!(
            sent.as_slice(),
            [ClientMessage::LockRequest { thread: T1, level: LockLevel::Write, try_timeout_millis: None, .. }]
        ));

        let mut out = Outbox::new();
        lock.on_award(T1, LockLevel::Write, false, 0, true, &mut out);
        assert!(out.is_empty());
        assert_eq!(lock.poll(1), RequestPoll::Awarded { interrupted: false });

        for seq in 2..5 {
            let granted = lock
                .request(T1, LockLevel::Write, seq, blocking(), true, &mut out)
                .unwrap();
            assert_eq!(granted, Acquire::Granted);
        }
        assert_eq!(lock.thread_hold_count(T1, Some(LockLevel::Write)), 4);

        for _ in 0..3 {
            lock.release(T1, LockLevel::Write, true, &mut out).unwrap();
        }
        assert!(out.is_empty());
        lock.release(T1, LockLevel::Write, true, &mut out).unwrap();

        let entries = unlock_entries(out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].thread, T1);
        assert_eq!(lock.state(), ClientLockState::Unheld);
    }

    #[test]
    fn test_upgrade_refused_nested_read_allowed() {
        let mut lock = greedy_lock(1);
        let mut out = Outbox::new();

        let granted = lock
            .request(T1, LockLevel::Read, 2, blocking(), true, &mut out)
            .unwrap();
        assert_eq!(granted, Acquire::Granted);

        let granted = lock
            .request(T2, LockLevel::Read, 3, blocking(), true, &mut out);
        assert_eq!(granted.unwrap(), Acquire::Queued(3));

        let mut reader = new_lock();
        reader
            .request(T3, LockLevel::Read, 1, blocking(), true, &mut out)
            .unwrap();
        reader.on_award(T3, LockLevel::Read, false, 0, true, &mut out);
        reader.poll(1);
        let err = reader
            .request(T3, LockLevel::Write, 2, blocking(), true, &mut out)
            .unwrap_err();
        assert!(matches!(err, LatchkeyError::UpgradeNotSupported { .. }));
    }

    #[test]
    fn test_release_without_hold() {
        let mut lock = new_lock();
        let mut out = Outbox::new();
        let err = lock
            .release(T1, LockLevel::Read, true, &mut out)
            .unwrap_err();
        assert!(matches!(err, LatchkeyError::NotHeld { .. }));
        assert!(out.is_empty());
    }

    #[test]
    fn test_concurrent_level_is_local() {
        let mut lock = new_lock();
        let mut out = Outbox::new();
        for seq in 0..2 {
            let granted = lock
                .request(T1, LockLevel::Concurrent, seq, blocking(), true, &mut out)
                .unwrap();
            assert_eq!(granted, Acquire::Granted);
        }
        lock.request(T2, LockLevel::Concurrent, 9, blocking(), true, &mut out)
            .unwrap();
        assert_eq!(lock.local_hold_count(Some(LockLevel::Concurrent)), 3);
        lock.release(T1, LockLevel::Concurrent, true, &mut out)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_second_request_from_same_thread_refused() {
        let mut lock = new_lock();
        let mut out = Outbox::new();
        lock.request(T1, LockLevel::Write, 1, blocking(), true, &mut out)
            .unwrap();
        let err = lock
            .request(T1, LockLevel::Read, 2, blocking(), true, &mut out)
            .unwrap_err();
        assert!(matches!(err, LatchkeyError::RequestOutstanding { .. }));
    }

    // ============== Greedy Lease Tests ==============

    #[test]
    fn test_fast_path_under_lease() {
        let mut lock = greedy_lock(3);
        let mut out = Outbox::new();

        let queued = lock
            .request(T2, LockLevel::Write, 2, blocking(), true, &mut out)
            .unwrap();
        assert_eq!(queued, Acquire::Queued(2));
        assert!(out.is_empty());

        lock.release(T1, LockLevel::Write, true, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(lock.poll(2), RequestPoll::Awarded { interrupted: false });
        assert!(lock.is_held_by(T2, LockLevel::Write));
        assert_eq!(lock.state(), ClientLockState::Greedy);
    }

    #[test]
    fn test_recall_drains_before_surrender() {
        let mut lock = greedy_lock(3);
        let mut out = Outbox::new();
        lock.request(T1, LockLevel::Read, 2, blocking(), true, &mut out)
            .unwrap();

        lock.on_recall(3, true, &mut out);
        assert_eq!(lock.state(), ClientLockState::Recalled);
        assert!(out.is_empty());

        // New local requests queue behind the drain
        let queued = lock
            .request(T2, LockLevel::Read, 3, blocking(), true, &mut out)
            .unwrap();
        assert_eq!(queued, Acquire::Queued(3));

        lock.release(T1, LockLevel::Read, true, &mut out).unwrap();
        assert!(out.is_empty());
        lock.release(T1, LockLevel::Write, true, &mut out).unwrap();

        let messages = out.into_messages();
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            ClientMessage::Unlock { entries } => {
                assert_eq!(entries.len(), 1);
                assert!(entries[0].thread.is_node());
                assert_eq!(entries[0].epoch, 3);
            }
            other => panic!("expected unlock, got {:?}", other),
        }
        assert!(matches!(
            &messages[1],
            ClientMessage::LockRequest { thread: T2, level: LockLevel::Read, .. }
        ));
        assert!(lock.lease().is_none());
    }

    #[test]
    fn test_stale_recall_and_award_ignored() {
        let mut lock = greedy_lock(5);
        let mut out = Outbox::new();

        lock.on_recall(4, true, &mut out);
        assert_eq!(lock.state(), ClientLockState::Greedy);

        lock.on_award(T2, LockLevel::Write, false, 4, true, &mut out);
        assert!(out.is_empty());
        assert!(!lock.is_held_by(T2, LockLevel::Write));
    }

    #[test]
    fn test_unclaimed_award_is_returned() {
        let mut lock = new_lock();
        let mut out = Outbox::new();
        lock.on_award(T2, LockLevel::Read, false, 2, true, &mut out);
        let entries = unlock_entries(out);
        assert_eq!(entries[0].thread, T2);
        assert_eq!(entries[0].level, LockLevel::Read);
    }

    #[test]
    fn test_lease_revocation() {
        let mut lock = greedy_lock(5);
        let mut out = Outbox::new();
        lock.release(T1, LockLevel::Write, true, &mut out).unwrap();

        lock.on_reject(ThreadId::NODE, RejectReason::StaleEpoch(5), true, &mut out);
        assert!(lock.lease().is_none());

        lock.request(T2, LockLevel::Write, 2, blocking(), true, &mut out)
            .unwrap();
        assert!(matches!(
            out.into_messages().as_slice(),
            [ClientMessage::LockRequest { thread: T2, .. }]
        ));
    }

    #[test]
    fn test_collect_surrenders_idle_lease_unless_pinned() {
        let mut lock = greedy_lock(2);
        let mut out = Outbox::new();
        assert!(!lock.collect(&mut out));

        lock.release(T1, LockLevel::Write, true, &mut out).unwrap();
        lock.pin();
        assert!(!lock.collect(&mut out));
        lock.unpin();
        assert!(lock.collect(&mut out));

        let entries = unlock_entries(out);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].thread.is_node());
    }

    // ============== Wait / Notify Tests ==============

    #[test]
    fn test_wait_without_write_is_illegal() {
        let mut lock = new_lock();
        let mut out = Outbox::new();
        let err = lock.wait(T1, 0, 1, true, &mut out).unwrap_err();
        assert!(matches!(err, LatchkeyError::IllegalMonitorState { .. }));
        let err = lock.notify(T1, true, &mut out).unwrap_err();
        assert!(matches!(err, LatchkeyError::IllegalMonitorState { .. }));
        assert!(out.is_empty());
    }

    #[test]
    fn test_wait_under_lease_reacquires_locally() {
        let mut lock = greedy_lock(1);
        let mut out = Outbox::new();
        lock.request(T1, LockLevel::Write, 2, blocking(), true, &mut out)
            .unwrap();

        lock.wait(T1, 0, 7, true, &mut out).unwrap();
        assert!(matches!(
            out.into_messages().as_slice(),
            [ClientMessage::Wait { thread: T1, timeout_millis: 0, .. }]
        ));
        assert_eq!(lock.thread_hold_count(T1, None), 0);
        assert_eq!(
            lock.poll(7),
            RequestPoll::Waiting {
                sent: true,
                interrupted: false
            }
        );

        let mut out = Outbox::new();
        lock.request(T2, LockLevel::Write, 8, blocking(), true, &mut out)
            .unwrap();
        lock.on_notified(T1, false, true, &mut out);
        assert!(matches!(lock.poll(7), RequestPoll::Waiting { sent: false, .. }));

        lock.release(T2, LockLevel::Write, true, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(lock.poll(7), RequestPoll::Awarded { interrupted: false });
        assert_eq!(lock.thread_hold_count(T1, Some(LockLevel::Write)), 2);
    }

    #[test]
    fn test_refused_wait_wakes_spuriously() {
        let mut lock = new_lock();
        let mut out = Outbox::new();
        lock.request(T1, LockLevel::Write, 1, blocking(), true, &mut out)
            .unwrap();
        lock.on_award(T1, LockLevel::Write, false, 0, true, &mut out);
        lock.poll(1);
        lock.wait(T1, 0, 2, true, &mut out).unwrap();

        let mut out = Outbox::new();
        lock.on_reject(T1, RejectReason::IllegalMonitorState, true, &mut out);
        assert!(matches!(
            out.into_messages().as_slice(),
            [ClientMessage::LockRequest { thread: T1, level: LockLevel::Write, .. }]
        ));
    }

    #[test]
    fn test_interrupt_waiter() {
        let mut lock = greedy_lock(1);
        let mut out = Outbox::new();
        lock.wait(T1, 0, 4, true, &mut out).unwrap();

        let mut out = Outbox::new();
        assert!(lock.interrupt(T1, true, &mut out));
        assert!(matches!(
            out.into_messages().as_slice(),
            [ClientMessage::Interrupt { thread: T1, .. }]
        ));

        let mut out = Outbox::new();
        lock.on_notified(T1, false, true, &mut out);
        assert_eq!(lock.poll(4), RequestPoll::Awarded { interrupted: true });
        assert!(lock.is_held_by(T1, LockLevel::Write));
    }

    // ============== Resync Tests ==============

    #[test]
    fn test_resync_reannounces_holds_and_fails_try_requests() {
        let mut lock = greedy_lock(4);
        let mut out = Outbox::new();
        lock.request(T1, LockLevel::Read, 2, blocking(), true, &mut out)
            .unwrap();
        lock.on_recall(4, true, &mut out);
        let try_options = RequestOptions {
            deadline: Some(Instant::now() + std::time::Duration::from_secs(5)),
            interruptible: false,
        };
        lock.request(T2, LockLevel::Read, 3, try_options, true, &mut out)
            .unwrap();

        let mut out = Outbox::new();
        lock.resync(&mut out);
        assert!(lock.lease().is_none());
        let messages = out.into_messages();
        assert!(matches!(
            &messages[0],
            ClientMessage::LockRequest { thread: T1, level: LockLevel::Write, try_timeout_millis: None, .. }
        ));
        // The local try request is forwarded once connected
        assert!(matches!(
            &messages[1],
            ClientMessage::LockRequest { thread: T2, try_timeout_millis: Some(_), .. }
        ));

        let mut out = Outbox::new();
        lock.resync(&mut out);
        assert_eq!(
            lock.poll(3),
            RequestPoll::Rejected(RejectReason::TimedOut)
        );

        // Re-announced hold is released before its award arrives
        lock.release(T1, LockLevel::Read, true, &mut out).unwrap();
        lock.release(T1, LockLevel::Write, true, &mut out).unwrap();
        assert!(out.into_messages().iter().all(|m| matches!(m, ClientMessage::LockRequest { .. })));

        let mut out = Outbox::new();
        lock.on_award(T1, LockLevel::Write, false, 1, true, &mut out);
        assert_eq!(unlock_entries(out)[0].thread, T1);
    }

    #[test]
    fn test_reannounced_hold_unconfirmed_until_awarded() {
        let mut lock = new_lock();
        let mut out = Outbox::new();
        lock.request(T1, LockLevel::Write, 1, blocking(), true, &mut out)
            .unwrap();
        lock.on_award(T1, LockLevel::Write, false, 2, true, &mut out);
        lock.poll(1);
        assert_eq!(lock.unconfirmed_holds(), 0);

        let mut out = Outbox::new();
        lock.resync(&mut out);
        assert_eq!(lock.unconfirmed_holds(), 1);
        assert!(lock.is_held_by(T1, LockLevel::Write));

        let mut out = Outbox::new();
        lock.on_award(T1, LockLevel::Write, false, 3, true, &mut out);
        assert!(out.is_empty());
        assert_eq!(lock.unconfirmed_holds(), 0);
        assert!(lock.is_held_by(T1, LockLevel::Write));
    }

    #[test]
    fn test_refused_notify_leaves_state_alone() {
        let mut lock = new_lock();
        let mut out = Outbox::new();
        lock.request(T1, LockLevel::Write, 1, blocking(), true, &mut out)
            .unwrap();
        lock.on_award(T1, LockLevel::Write, false, 0, true, &mut out);
        lock.poll(1);
        lock.notify(T1, false, &mut out).unwrap();

        let mut out = Outbox::new();
        lock.on_reject(T1, RejectReason::IllegalMonitorState, true, &mut out);
        assert!(out.is_empty());
        assert!(lock.is_held_by(T1, LockLevel::Write));
        assert_eq!(lock.waiter_count(), 0);
    }

    #[test]
    fn test_resync_wakes_waiters() {
        let mut lock = greedy_lock(1);
        let mut out = Outbox::new();
        lock.wait(T1, 0, 5, true, &mut out).unwrap();

        let mut out = Outbox::new();
        lock.resync(&mut out);
        assert!(matches!(
            out.into_messages().as_slice(),
            [ClientMessage::LockRequest { thread: T1, level: LockLevel::Write, .. }]
        ));
        assert!(matches!(lock.poll(5), RequestPoll::Waiting { sent: true, .. }));
    }

    // ============== Table Tests ==============

    #[test]
    fn test_table_sharding() {
        let table = ClientLockTable::new(NODE, 8);
        assert_eq!(table.shard_count(), 8);
        assert!(table.is_empty());

        for i in 0..32 {
            table.with_lock(&LockId::Long(i), |lock| lock.pin());
        }
        assert_eq!(table.len(), 32);
        assert_eq!(
            table.with_existing(&LockId::Long(3), |lock| lock.is_pinned()),
            Some(true)
        );
        assert_eq!(table.with_existing(&LockId::Long(99), |_| ()), None);
        assert_eq!(table.lock_all().len(), 8);
    }
}
