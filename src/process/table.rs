//! Process table, ready queue and wakers.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Wake, Waker};

use crate::channel::{ChannelId, ChannelOp};
use crate::condition::ConditionId;
use crate::event::ActionResult;
use crate::time::SimTime;

/// A suspended process body.
pub(crate) type Body = Pin<Box<dyn Future<Output = ActionResult>>>;

// ── ProcessId ─────────────────────────────────────────────────────────

/// Identifier of a launched process, unique within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessId(u64);

impl ProcessId {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

// ── State ─────────────────────────────────────────────────────────────

/// Why a suspended process is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Until an absolute time (`delay` and `wait_until`).
    At(SimTime),
    /// Until a predicate holds.
    Predicate(ConditionId),
    /// On a channel operation.
    Channel { channel: ChannelId, op: ChannelOp },
    /// On a future the kernel does not know about.
    Other,
}

/// Lifecycle of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Runnable,
    Suspended(WaitReason),
    Terminated,
}

// ── Ready queue ───────────────────────────────────────────────────────

/// FIFO of processes whose wait is over.
///
/// Shared with every process waker. A process is queued at most once.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    inner: Mutex<ReadyInner>,
}

#[derive(Debug, Default)]
struct ReadyInner {
    order: VecDeque<ProcessId>,
    queued: BTreeSet<ProcessId>,
}

impl ReadyQueue {
    fn lock(&self) -> MutexGuard<'_, ReadyInner> {
        // Nothing panics while holding the lock; recover the data regardless.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, id: ProcessId) {
        let mut inner = self.lock();
        if inner.queued.insert(id) {
            inner.order.push_back(id);
        }
    }

    pub(crate) fn pop(&self) -> Option<ProcessId> {
        let mut inner = self.lock();
        let id = inner.order.pop_front()?;
        inner.queued.remove(&id);
        Some(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.lock();
        inner.order.clear();
        inner.queued.clear();
    }
}

/// Waker that puts its process back on the ready queue.
struct ProcessWaker {
    id: ProcessId,
    ready: Arc<ReadyQueue>,
}

impl Wake for ProcessWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.id);
    }
}

// ── Table ─────────────────────────────────────────────────────────────

struct ProcessSlot {
    /// `None` while the dispatcher is polling it.
    body: Option<Body>,
    state: ProcessState,
    waker: Waker,
}

/// All live processes of a session.
#[derive(Default)]
pub(crate) struct ProcessTable {
    slots: BTreeMap<ProcessId, ProcessSlot>,
    next: u64,
    ready: Arc<ReadyQueue>,
}

impl ProcessTable {
    /// Issue the id of the next process. The body is built afterwards,
    /// since it needs the id, and registered with [`insert`](Self::insert).
    pub(crate) fn reserve(&mut self) -> ProcessId {
        let id = ProcessId(self.next);
        self.next += 1;
        id
    }

    /// Register a body and queue it for its first poll.
    pub(crate) fn insert(&mut self, id: ProcessId, body: Body) {
        let waker = Waker::from(Arc::new(ProcessWaker {
            id,
            ready: Arc::clone(&self.ready),
        }));
        self.slots.insert(
            id,
            ProcessSlot {
                body: Some(body),
                state: ProcessState::Runnable,
                waker,
            },
        );
        self.ready.push(id);
    }

    pub(crate) fn ready(&self) -> &ReadyQueue {
        &self.ready
    }

    /// State of `id`, or `None` if it was never issued by this table.
    pub(crate) fn state(&self, id: ProcessId) -> Option<ProcessState> {
        match self.slots.get(&id) {
            Some(slot) => Some(slot.state),
            None if id.0 < self.next => Some(ProcessState::Terminated),
            None => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Take the body out for polling.
    pub(crate) fn checkout(&mut self, id: ProcessId) -> Option<(Body, Waker)> {
        let slot = self.slots.get_mut(&id)?;
        let body = slot.body.take()?;
        slot.state = ProcessState::Runnable;
        Some((body, slot.waker.clone()))
    }

    /// Put a pending body back. Hands it back if the process was killed
    /// while running, so the caller can drop it outside any borrow.
    pub(crate) fn checkin(&mut self, id: ProcessId, body: Body) -> Option<Body> {
        let Some(slot) = self.slots.get_mut(&id) else {
            return Some(body);
        };
        if slot.state == ProcessState::Runnable {
            slot.state = ProcessState::Suspended(WaitReason::Other);
        }
        slot.body = Some(body);
        None
    }

    pub(crate) fn mark_waiting(&mut self, id: ProcessId, reason: WaitReason) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.state = ProcessState::Suspended(reason);
        }
    }

    /// Remove a process, returning its body (if not currently running).
    pub(crate) fn remove(&mut self, id: ProcessId) -> Option<Option<Body>> {
        self.slots.remove(&id).map(|slot| slot.body)
    }

    /// Remove every process; the caller drops the bodies.
    pub(crate) fn take_all(&mut self) -> Vec<Body> {
        self.ready.clear();
        std::mem::take(&mut self.slots)
            .into_values()
            .filter_map(|slot| slot.body)
            .collect()
    }
}
