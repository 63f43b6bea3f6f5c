//! Standing sample actions and repeating timed actions.
//!
//! Samplers run at every sample tick; cycles re-arm themselves on the
//! event queue with a fixed interval. Both stores hand their closures
//! out while they run, so a running action may add or cancel entries.

use std::collections::BTreeMap;

use crate::event::{ActionResult, EventId};
use crate::simulation::Simulation;

/// An action that can fire many times.
pub type Recurring = Box<dyn FnMut(&Simulation) -> ActionResult>;

/// Handle of a standing sample action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SamplerId(u64);

/// Handle of a repeating timed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleId(u64);

// ── Samplers ──────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct Samplers {
    entries: BTreeMap<SamplerId, Option<Recurring>>,
    next: u64,
}

impl Samplers {
    pub(crate) fn add(&mut self, action: Recurring) -> SamplerId {
        let id = SamplerId(self.next);
        self.next += 1;
        self.entries.insert(id, Some(action));
        id
    }

    pub(crate) fn remove(&mut self, id: SamplerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn ids(&self) -> Vec<SamplerId> {
        self.entries.keys().copied().collect()
    }

    pub(crate) fn checkout(&mut self, id: SamplerId) -> Option<Recurring> {
        self.entries.get_mut(&id)?.take()
    }

    /// Return a sampler after it ran. Hands it back if it was cancelled
    /// meanwhile, so the caller drops it outside the borrow.
    pub(crate) fn checkin(&mut self, id: SamplerId, action: Recurring) -> Option<Recurring> {
        match self.entries.get_mut(&id) {
            Some(slot) => {
                *slot = Some(action);
                None
            }
            None => Some(action),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn take_all(&mut self) -> Vec<Recurring> {
        std::mem::take(&mut self.entries).into_values().flatten().collect()
    }
}

// ── Cycles ────────────────────────────────────────────────────────────

pub(crate) struct Cycle {
    pub(crate) interval: f64,
    pub(crate) action: Option<Recurring>,
    /// The queued event that fires the next repetition.
    pub(crate) pending: Option<EventId>,
}

#[derive(Default)]
pub(crate) struct Cycles {
    entries: BTreeMap<CycleId, Cycle>,
    next: u64,
}

impl Cycles {
    pub(crate) fn add(&mut self, interval: f64, action: Recurring) -> CycleId {
        let id = CycleId(self.next);
        self.next += 1;
        self.entries.insert(
            id,
            Cycle {
                interval,
                action: Some(action),
                pending: None,
            },
        );
        id
    }

    pub(crate) fn get_mut(&mut self, id: CycleId) -> Option<&mut Cycle> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: CycleId) -> Option<Cycle> {
        self.entries.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn take_all(&mut self) -> Vec<Cycle> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
