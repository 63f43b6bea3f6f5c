//! Deterministic event queue.
//!
//! Uses a `BinaryHeap` with reversed `Ord` on `TimedEvent` to act as a
//! min-heap keyed by `(due, id)`. Because ids are strictly increasing,
//! two runs that register the same events in the same order always
//! dispatch them in the same order.

use std::collections::{BTreeSet, BinaryHeap};

use crate::error::{KernelError, KernelResult};
use crate::event::{Action, EventId, SequenceGen, TimedEvent, Timing};
use crate::time::SimTime;

/// Resolve a [`Timing`] against the current time into an absolute due time.
pub fn resolve_due(now: SimTime, timing: Timing) -> KernelResult<SimTime> {
    match timing {
        Timing::At(at) => {
            let at = at.validated()?;
            if at < now {
                return Err(KernelError::PastSchedule { requested: at, now });
            }
            Ok(at)
        }
        Timing::After(delay) => now.plus(delay),
    }
}

/// The timed-event store.
///
/// Owns the heap and the id generator. Cancellation is lazy: a
/// cancelled id leaves the live set at once, and its heap entry is
/// discarded when it reaches the top.
#[derive(Debug, Default)]
pub struct EventQueue {
    /// Min-heap (via reversed Ord on TimedEvent).
    heap: BinaryHeap<TimedEvent>,

    /// Ids scheduled but not yet fired or cancelled.
    live: BTreeSet<EventId>,

    /// Monotonic id generator.
    seq: SequenceGen,
}

impl EventQueue {
    /// Create a new, empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` according to `timing`, relative to `now`.
    pub fn schedule(&mut self, now: SimTime, timing: Timing, action: Action) -> KernelResult<EventId> {
        let due = resolve_due(now, timing)?;
        Ok(self.push(due, action))
    }

    /// Insert an event at an already validated due time.
    pub fn push(&mut self, due: SimTime, action: Action) -> EventId {
        let id = self.seq.next_id();
        self.live.insert(id);
        self.heap.push(TimedEvent::new(id, due, action));
        id
    }

    /// Cancel a pending event. Returns `false` if it already fired.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.live.remove(&id)
    }

    /// Whether `id` is still waiting to fire.
    pub fn is_pending(&self, id: EventId) -> bool {
        self.live.contains(&id)
    }

    /// Peek at the next live event without removing it.
    pub fn peek_next(&mut self) -> Option<&TimedEvent> {
        self.discard_cancelled();
        self.heap.peek()
    }

    /// Due time of the next live event.
    pub fn next_due(&mut self) -> Option<SimTime> {
        self.peek_next().map(|event| event.due)
    }

    /// Remove and return the earliest event due at or before `t`.
    pub fn pop_due(&mut self, t: SimTime) -> Option<TimedEvent> {
        self.discard_cancelled();
        if self.heap.peek()?.due > t {
            return None;
        }
        let event = self.heap.pop()?;
        self.live.remove(&event.id);
        Some(event)
    }

    /// Returns `true` if no live events remain.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of live events.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Remove every pending event and hand them back unfired.
    ///
    /// The id generator is kept, so ids issued before the call never
    /// alias ids issued after it.
    pub fn take_all(&mut self) -> Vec<TimedEvent> {
        self.live.clear();
        std::mem::take(&mut self.heap).into_vec()
    }

    /// Discard every pending event.
    pub fn clear(&mut self) {
        self.take_all();
    }

    /// Drain all live events in dispatch order.
    /// Useful for testing and snapshotting.
    pub fn drain_ordered(&mut self) -> Vec<TimedEvent> {
        let mut events = Vec::with_capacity(self.live.len());
        while let Some(event) = self.heap.pop() {
            if self.live.remove(&event.id) {
                events.push(event);
            }
        }
        events
    }

    fn discard_cancelled(&mut self) {
        while let Some(head) = self.heap.peek() {
            if self.live.contains(&head.id) {
                break;
            }
            self.heap.pop();
        }
    }
}
