//! Per-lock server state machine
//!
//! A [`ServerLock`] owns the holder set, FIFO request queue, wait set and
//! greedy lease of one lock. It never touches the network or the clock
//! directly: every operation appends [`Effect`]s that the
//! [`ServerLockManager`](super::ServerLockManager) applies while it still
//! holds the lock's mutex, so effects of one lock are observed in order.

use std::collections::VecDeque;
use std::time::Duration;

use latchkey_api::{HolderInfo, ServerMessage, UnlockEntry};
use latchkey_common::{Epoch, GreedyLease, LockId, LockLevel, NodeId, RejectReason, ThreadId};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::greedy::{EpochCounter, GreedyPolicy, RequestTracker};
use crate::metrics;

/// Timers a lock can arm. Each is unique per lock for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTimer {
    /// Liveness window of an outstanding recall
    Recall { epoch: Epoch },
    /// Server-side try-lock timeout of a queued request
    TryLock {
        node: NodeId,
        thread: ThreadId,
        sequence: u64,
    },
    /// Timed wait of a parked waiter
    Wait {
        node: NodeId,
        thread: ThreadId,
        sequence: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(NodeId, ServerMessage),
    StartTimer { timer: LockTimer, after: Duration },
    CancelTimer(LockTimer),
}

/// Shared inputs for one state transition.
pub struct LockContext<'a> {
    pub policy: &'a GreedyPolicy,
    pub epochs: &'a EpochCounter,
    pub requests: &'a RequestTracker,
    pub recall_timeout: Duration,
    pub now: Instant,
}

/// A per-thread hold of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    pub node: NodeId,
    pub thread: ThreadId,
    pub level: LockLevel,
}

#[derive(Debug, Clone)]
struct Request {
    node: NodeId,
    thread: ThreadId,
    level: LockLevel,
    sequence: u64,
    timed: bool,
}

impl Request {
    fn timer(&self) -> LockTimer {
        LockTimer::TryLock {
            node: self.node,
            thread: self.thread,
            sequence: self.sequence,
        }
    }
}

#[derive(Debug, Clone)]
struct Waiter {
    node: NodeId,
    thread: ThreadId,
    sequence: u64,
    timed: bool,
}

impl Waiter {
    fn timer(&self) -> LockTimer {
        LockTimer::Wait {
            node: self.node,
            thread: self.thread,
            sequence: self.sequence,
        }
    }
}

#[derive(Debug)]
pub struct ServerLock {
    lock_id: LockId,
    holders: Vec<Holder>,
    lease: Option<GreedyLease>,
    /// Epoch of the lease currently being recalled
    recall: Option<Epoch>,
    queue: VecDeque<Request>,
    waiters: VecDeque<Waiter>,
    epoch: Epoch,
    /// Whether `epoch` already fenced a lease on this lock
    epoch_leased: bool,
    next_sequence: u64,
    retired: bool,
}

impl ServerLock {
    pub fn new(lock_id: LockId, epoch: Epoch) -> Self {
        Self {
            lock_id,
            holders: Vec::new(),
            lease: None,
            recall: None,
            queue: VecDeque::new(),
            waiters: VecDeque::new(),
            epoch,
            epoch_leased: false,
            next_sequence: 0,
            retired: false,
        }
    }

    pub fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn lease(&self) -> Option<&GreedyLease> {
        self.lease.as_ref()
    }

    pub fn is_recalling(&self) -> bool {
        self.recall.is_some()
    }

    pub fn holders(&self) -> &[Holder] {
        &self.holders
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_idle(&self) -> bool {
        self.holders.is_empty()
            && self.lease.is_none()
            && self.queue.is_empty()
            && self.waiters.is_empty()
    }

    /// Whether `node` holds, awaits, waits on or leases this lock.
    pub fn involves(&self, node: NodeId) -> bool {
        self.holders.iter().any(|h| h.node == node)
            || self.queue.iter().any(|q| q.node == node)
            || self.waiters.iter().any(|w| w.node == node)
            || self.lease.as_ref().is_some_and(|l| l.node == node)
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Mark the lock as removed from the manager's map.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    // ========================================================================
    // Requests and awards
    // ========================================================================

    /// Handle a LOCK_REQUEST. `try_timeout` of zero fails fast, `None` blocks.
    pub fn request(
        &mut self,
        node: NodeId,
        thread: ThreadId,
        level: LockLevel,
        try_timeout: Option<Duration>,
        ctx: &LockContext<'_>,
        out: &mut Vec<Effect>,
    ) {
        if level.is_concurrent() {
            out.push(Effect::Send(
                node,
                self.award_message(thread, level, false, self.epoch),
            ));
            return;
        }
        if self
            .lease
            .as_ref()
            .is_some_and(|l| l.node == node && l.covers(level))
        {
            // The node already self-serves this level; the award crossed the request
            debug!(lock_id = %self.lock_id, %node, %thread, "Request covered by the node's own lease");
            return;
        }

        ctx.requests
            .record(node, &self.lock_id, ctx.now, ctx.policy.window);
        let sequence = self.next_sequence();
        let mut request = Request {
            node,
            thread,
            level,
            sequence,
            timed: false,
        };

        if self.queue.is_empty() && self.awardable(node, thread, level) {
            self.award(request, ctx, out);
            return;
        }

        match try_timeout {
            Some(timeout) if timeout.is_zero() => {
                self.recall_lease(ctx, out);
                out.push(Effect::Send(
                    node,
                    self.reject_message(thread, RejectReason::Unavailable),
                ));
                return;
            }
            Some(timeout) => {
                request.timed = true;
                out.push(Effect::StartTimer {
                    timer: request.timer(),
                    after: timeout,
                });
            }
            None => {}
        }
        debug!(lock_id = %self.lock_id, %node, %thread, %level, sequence, "Request queued");
        self.queue.push_back(request);
        self.process(ctx, out);
    }

    fn holders_conflict(&self, node: NodeId, thread: ThreadId, level: LockLevel) -> bool {
        self.holders
            .iter()
            .any(|h| !(h.node == node && h.thread == thread) && h.level.conflicts_with(level))
    }

    /// Per-thread grants are never made while any lease is outstanding: the
    /// server cannot see what the lease holder has handed out locally.
    fn awardable(&self, node: NodeId, thread: ThreadId, level: LockLevel) -> bool {
        self.lease.is_none() && !self.holders_conflict(node, thread, level)
    }

    /// Grant queued requests in arrival order until the head is blocked.
    fn process(&mut self, ctx: &LockContext<'_>, out: &mut Vec<Effect>) {
        while let Some(head) = self.queue.front() {
            if self.lease.is_some() {
                self.recall_lease(ctx, out);
                return;
            }
            if self.holders_conflict(head.node, head.thread, head.level) {
                return;
            }
            let Some(request) = self.queue.pop_front() else {
                return;
            };
            self.award(request, ctx, out);
        }
    }

    fn can_promote(&self, request: &Request, ctx: &LockContext<'_>) -> bool {
        // The request being awarded counts even if its window closed while it queued
        let recent = ctx
            .requests
            .count(request.node, &self.lock_id, ctx.now, ctx.policy.window)
            .max(1);
        let lease_level = request.level.lease_level();
        ctx.policy.should_promote(recent)
            && self.lease.is_none()
            && self.holders.iter().all(|h| h.node == request.node)
            && self
                .queue
                .iter()
                .all(|q| q.node == request.node && lease_level.covers(q.level))
    }

    fn award(&mut self, request: Request, ctx: &LockContext<'_>, out: &mut Vec<Effect>) {
        if request.timed {
            out.push(Effect::CancelTimer(request.timer()));
        }

        if self.can_promote(&request, ctx) {
            if self.epoch_leased {
                self.epoch = ctx.epochs.advance();
            }
            self.epoch_leased = true;
            let lease = GreedyLease::new(
                self.lock_id.clone(),
                request.node,
                request.level,
                self.epoch,
            );

            // Queued requests of the same node are now served locally
            self.queue.retain(|queued| {
                if queued.node == lease.node && lease.covers(queued.level) {
                    if queued.timed {
                        out.push(Effect::CancelTimer(queued.timer()));
                    }
                    false
                } else {
                    true
                }
            });

            debug!(
                lock_id = %self.lock_id,
                node = %lease.node,
                level = %lease.level,
                epoch = lease.epoch,
                "Greedy lease granted"
            );
            metrics::record_greedy_grant();
            out.push(Effect::Send(
                request.node,
                self.award_message(request.thread, lease.level, true, lease.epoch),
            ));
            self.lease = Some(lease);
            return;
        }

        debug!(
            lock_id = %self.lock_id,
            node = %request.node,
            thread = %request.thread,
            level = %request.level,
            epoch = self.epoch,
            "Lock awarded"
        );
        self.holders.push(Holder {
            node: request.node,
            thread: request.thread,
            level: request.level,
        });
        out.push(Effect::Send(
            request.node,
            self.award_message(request.thread, request.level, false, self.epoch),
        ));
    }

    fn award_message(
        &self,
        thread: ThreadId,
        level: LockLevel,
        greedy: bool,
        epoch: Epoch,
    ) -> ServerMessage {
        ServerMessage::LockAward {
            lock_id: self.lock_id.clone(),
            thread,
            level,
            greedy,
            epoch,
        }
    }

    fn reject_message(&self, thread: ThreadId, reason: RejectReason) -> ServerMessage {
        ServerMessage::LockReject {
            lock_id: self.lock_id.clone(),
            thread,
            reason,
        }
    }

    // ========================================================================
    // Leases
    // ========================================================================

    /// Ask the lease holder to surrender. Sent at most once per lease.
    fn recall_lease(&mut self, ctx: &LockContext<'_>, out: &mut Vec<Effect>) {
        let Some(lease) = &self.lease else {
            return;
        };
        if self.recall.is_some() {
            return;
        }
        let (node, epoch) = (lease.node, lease.epoch);
        info!(lock_id = %self.lock_id, %node, epoch, "Recalling greedy lease");
        metrics::record_recall();
        self.recall = Some(epoch);
        out.push(Effect::Send(
            node,
            ServerMessage::LockRecall {
                lock_id: self.lock_id.clone(),
                epoch,
            },
        ));
        out.push(Effect::StartTimer {
            timer: LockTimer::Recall { epoch },
            after: ctx.recall_timeout,
        });
    }

    /// Drop the lease and advance the epoch so later messages about it are fenced.
    fn end_lease(&mut self, ctx: &LockContext<'_>, out: &mut Vec<Effect>) -> Option<GreedyLease> {
        let lease = self.lease.take()?;
        if let Some(epoch) = self.recall.take() {
            out.push(Effect::CancelTimer(LockTimer::Recall { epoch }));
        }
        self.epoch = ctx.epochs.advance();
        self.epoch_leased = false;
        Some(lease)
    }

    /// Handle one entry of an UNLOCK from `node`.
    pub fn unlock(
        &mut self,
        node: NodeId,
        entry: &UnlockEntry,
        ctx: &LockContext<'_>,
        out: &mut Vec<Effect>,
    ) {
        if entry.thread.is_node() {
            let current = self
                .lease
                .as_ref()
                .is_some_and(|l| l.node == node && l.is_current(entry.epoch));
            if !current {
                warn!(
                    lock_id = %self.lock_id,
                    %node,
                    epoch = entry.epoch,
                    current = self.epoch,
                    "Dropping unlock for superseded lease"
                );
                return;
            }
            self.end_lease(ctx, out);
            debug!(lock_id = %self.lock_id, %node, epoch = entry.epoch, "Greedy lease surrendered");
        } else {
            let held = self
                .holders
                .iter()
                .position(|h| h.node == node && h.thread == entry.thread);
            match held {
                Some(pos) => {
                    self.holders.remove(pos);
                }
                None => {
                    debug!(lock_id = %self.lock_id, %node, thread = %entry.thread, "Unlock for unknown holder");
                    return;
                }
            }
        }
        self.process(ctx, out);
    }

    // ========================================================================
    // Wait / notify
    // ========================================================================

    fn is_write_holder_of_record(&self, node: NodeId, thread: ThreadId) -> bool {
        self.holders
            .iter()
            .any(|h| h.node == node && h.thread == thread && h.level.is_write())
            || self
                .lease
                .as_ref()
                .is_some_and(|l| l.node == node && l.level.is_write())
    }

    /// Park `thread` on the wait set, releasing its WRITE hold of record.
    pub fn wait(
        &mut self,
        node: NodeId,
        thread: ThreadId,
        timeout: Option<Duration>,
        ctx: &LockContext<'_>,
        out: &mut Vec<Effect>,
    ) {
        if !self.is_write_holder_of_record(node, thread) {
            warn!(lock_id = %self.lock_id, %node, %thread, "Wait from a thread that does not hold WRITE");
            out.push(Effect::Send(
                node,
                self.reject_message(thread, RejectReason::IllegalMonitorState),
            ));
            return;
        }
        self.holders
            .retain(|h| !(h.node == node && h.thread == thread));

        let waiter = Waiter {
            node,
            thread,
            sequence: self.next_sequence(),
            timed: timeout.is_some(),
        };
        if let Some(timeout) = timeout {
            out.push(Effect::StartTimer {
                timer: waiter.timer(),
                after: timeout,
            });
        }
        debug!(lock_id = %self.lock_id, %node, %thread, "Thread waiting");
        self.waiters.push_back(waiter);
        self.process(ctx, out);
    }

    /// Wake the oldest waiter, or all of them.
    pub fn notify(
        &mut self,
        node: NodeId,
        thread: ThreadId,
        all: bool,
        ctx: &LockContext<'_>,
        out: &mut Vec<Effect>,
    ) {
        if !self.is_write_holder_of_record(node, thread) {
            warn!(lock_id = %self.lock_id, %node, %thread, "Notify from a thread that does not hold WRITE");
            out.push(Effect::Send(
                node,
                self.reject_message(thread, RejectReason::IllegalMonitorState),
            ));
            return;
        }
        let count = if all {
            self.waiters.len()
        } else {
            self.waiters.len().min(1)
        };
        for _ in 0..count {
            if let Some(waiter) = self.waiters.pop_front() {
                self.wake(waiter, out);
            }
        }
        self.process(ctx, out);
    }

    /// Remove a parked waiter of `thread` and wake it.
    pub fn interrupt(
        &mut self,
        node: NodeId,
        thread: ThreadId,
        ctx: &LockContext<'_>,
        out: &mut Vec<Effect>,
    ) {
        let parked = self
            .waiters
            .iter()
            .position(|w| w.node == node && w.thread == thread);
        match parked.and_then(|pos| self.waiters.remove(pos)) {
            Some(waiter) => {
                debug!(lock_id = %self.lock_id, %node, %thread, "Waiter interrupted");
                self.wake(waiter, out);
                self.process(ctx, out);
            }
            None => debug!(lock_id = %self.lock_id, %node, %thread, "Interrupt for unknown waiter"),
        }
    }

    /// Tell the waiter's node to resume it. Unless the node can re-acquire
    /// WRITE under its own unrecalled lease, the re-acquisition is queued here.
    fn wake(&mut self, waiter: Waiter, out: &mut Vec<Effect>) {
        if waiter.timed {
            out.push(Effect::CancelTimer(waiter.timer()));
        }
        let served_by_lease = self.recall.is_none()
            && self
                .lease
                .as_ref()
                .is_some_and(|l| l.node == waiter.node && l.level.is_write());

        out.push(Effect::Send(
            waiter.node,
            ServerMessage::Notified {
                lock_id: self.lock_id.clone(),
                thread: waiter.thread,
                reacquire_pending: !served_by_lease,
            },
        ));
        if !served_by_lease {
            let sequence = self.next_sequence();
            self.queue.push_back(Request {
                node: waiter.node,
                thread: waiter.thread,
                level: LockLevel::Write,
                sequence,
                timed: false,
            });
        }
    }

    // ========================================================================
    // Timers, queries and node cleanup
    // ========================================================================

    pub fn timer_fired(&mut self, timer: LockTimer, ctx: &LockContext<'_>, out: &mut Vec<Effect>) {
        match timer {
            LockTimer::Recall { epoch } => {
                if self.recall != Some(epoch) {
                    return;
                }
                self.recall = None;
                let Some(lease) = self.end_lease(ctx, out) else {
                    return;
                };
                warn!(
                    lock_id = %self.lock_id,
                    node = %lease.node,
                    epoch,
                    new_epoch = self.epoch,
                    "Recall timed out, reclaiming greedy lease"
                );
                metrics::record_lease_reclaim();
                out.push(Effect::Send(
                    lease.node,
                    self.reject_message(ThreadId::NODE, RejectReason::StaleEpoch(epoch)),
                ));
            }
            LockTimer::TryLock {
                node,
                thread,
                sequence,
            } => {
                let queued = self
                    .queue
                    .iter()
                    .position(|q| q.node == node && q.thread == thread && q.sequence == sequence);
                if queued.and_then(|pos| self.queue.remove(pos)).is_none() {
                    return;
                }
                debug!(lock_id = %self.lock_id, %node, %thread, "Try-lock timed out on server");
                out.push(Effect::Send(
                    node,
                    self.reject_message(thread, RejectReason::TimedOut),
                ));
            }
            LockTimer::Wait {
                node,
                thread,
                sequence,
            } => {
                let parked = self
                    .waiters
                    .iter()
                    .position(|w| w.node == node && w.thread == thread && w.sequence == sequence);
                let Some(mut waiter) = parked.and_then(|pos| self.waiters.remove(pos)) else {
                    return;
                };
                debug!(lock_id = %self.lock_id, %node, %thread, "Wait timed out");
                waiter.timed = false;
                self.wake(waiter, out);
            }
        }
        self.process(ctx, out);
    }

    pub fn query(&self, node: NodeId, thread: ThreadId, out: &mut Vec<Effect>) {
        let mut holders: Vec<HolderInfo> = self
            .holders
            .iter()
            .map(|h| HolderInfo {
                node: h.node,
                thread: h.thread,
                level: h.level,
            })
            .collect();
        if let Some(lease) = &self.lease {
            holders.push(HolderInfo {
                node: lease.node,
                thread: ThreadId::NODE,
                level: lease.level,
            });
        }
        out.push(Effect::Send(
            node,
            ServerMessage::QueryResponse {
                lock_id: self.lock_id.clone(),
                thread,
                holders,
                pending: self.queue.len() as u32,
                waiters: self.waiters.len() as u32,
            },
        ));
    }

    /// Discard everything `node` holds, awaits or leases here.
    pub fn clear_node(&mut self, node: NodeId, ctx: &LockContext<'_>, out: &mut Vec<Effect>) {
        self.holders.retain(|h| h.node != node);
        self.queue.retain(|q| {
            if q.node != node {
                return true;
            }
            if q.timed {
                out.push(Effect::CancelTimer(q.timer()));
            }
            false
        });
        self.waiters.retain(|w| {
            if w.node != node {
                return true;
            }
            if w.timed {
                out.push(Effect::CancelTimer(w.timer()));
            }
            false
        });
        if self.lease.as_ref().is_some_and(|l| l.node == node) {
            if let Some(lease) = self.end_lease(ctx, out) {
                info!(
                    lock_id = %self.lock_id,
                    %node,
                    epoch = lease.epoch,
                    "Discarded greedy lease of departed node"
                );
            }
        }
        self.process(ctx, out);
    }
}
