//! Timed events for the simulation kernel.
//!
//! A `TimedEvent` binds an action to a due time. Events are immutable
//! once registered, are placed on the [`EventQueue`](crate::scheduler::EventQueue)
//! and fire exactly once, in `(due, id)` order.

use std::cmp::Ordering;

use crate::simulation::Simulation;
use crate::time::SimTime;

// ── Actions ───────────────────────────────────────────────────────────

/// Result of running an action or a process body.
///
/// Collaborator code reports failures with any error type; an `Err`
/// aborts the current run with [`KernelError::ActionFailure`](crate::KernelError).
pub type ActionResult = anyhow::Result<()>;

/// A one-shot action executed when its event fires.
///
/// The action receives the session so it can read the clock and
/// schedule follow-up work.
pub type Action = Box<dyn FnOnce(&Simulation) -> ActionResult>;

// ── Event ID ──────────────────────────────────────────────────────────

/// A strictly-increasing registration sequence number.
///
/// Breaks ties between events due at the same `SimTime`: the event
/// registered first fires first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EventId(u64);

impl EventId {
    /// Wrap a raw u64 into an `EventId`.
    #[inline]
    pub fn new(raw: u64) -> Self {
        EventId(raw)
    }

    /// Return the raw value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E#{}", self.0)
    }
}

// ── Sequence generator ────────────────────────────────────────────────

/// Deterministic, strictly-increasing sequence generator.
///
/// The event queue and the condition registry each own one, so event
/// ids order timed events and condition ids order conditional events;
/// the two sequences are independent.
#[derive(Debug, Clone, Default)]
pub struct SequenceGen {
    next: u64,
}

impl SequenceGen {
    /// Create a generator starting at 0.
    pub fn new() -> Self {
        SequenceGen { next: 0 }
    }

    /// Mint the next raw sequence number.
    pub fn next_raw(&mut self) -> u64 {
        let raw = self.next;
        self.next += 1;
        raw
    }

    /// Mint the next event ID.
    pub fn next_id(&mut self) -> EventId {
        EventId(self.next_raw())
    }
}

// ── Timing ────────────────────────────────────────────────────────────

/// When a timed action should fire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timing {
    /// At an absolute simulated time (must not be before `now`).
    At(SimTime),
    /// After a relative delay `>= 0` from `now`.
    After(f64),
}

// ── Timed event ───────────────────────────────────────────────────────

/// A single timed event.
pub struct TimedEvent {
    /// Registration sequence number.
    pub id: EventId,

    /// The simulated time at which this event fires.
    pub due: SimTime,

    /// The work to run.
    pub action: Action,
}

impl TimedEvent {
    /// Convenience constructor.
    pub fn new(id: EventId, due: SimTime, action: Action) -> Self {
        TimedEvent { id, due, action }
    }
}

impl std::fmt::Debug for TimedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedEvent")
            .field("id", &self.id)
            .field("due", &self.due)
            .finish_non_exhaustive()
    }
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.due == other.due
    }
}

impl Eq for TimedEvent {}

/// Ordering: smallest `(due, id)` first.
///
/// `BinaryHeap` is a max-heap, so the natural ordering is reversed here.
impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
