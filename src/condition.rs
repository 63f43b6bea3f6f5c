//! Conditional events.
//!
//! A conditional event is released by a predicate rather than a
//! deadline. The registry keeps them in registration order; the
//! dispatcher calls [`evaluate_all`] at every tick.

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::error::KernelResult;
use crate::event::{Action, SequenceGen};
use crate::simulation::Simulation;

/// A predicate re-checked at every tick.
///
/// Predicates may read the session (e.g. [`Simulation::now`]) and
/// external state. They must not schedule into the condition registry.
pub type Predicate = Box<dyn FnMut(&Simulation) -> bool>;

/// Handle of a registered conditional event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ConditionId(u64);

impl ConditionId {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConditionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C#{}", self.0)
    }
}

struct PendingCondition {
    /// Taken out while the predicate runs.
    predicate: Option<Predicate>,
    action: Action,
}

/// Pending conditional events, ordered by registration.
#[derive(Default)]
pub struct ConditionRegistry {
    pending: BTreeMap<ConditionId, PendingCondition>,
    seq: SequenceGen,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` to fire once `predicate` holds.
    pub fn register(&mut self, predicate: Predicate, action: Action) -> ConditionId {
        let id = ConditionId(self.seq.next_raw());
        self.pending.insert(
            id,
            PendingCondition {
                predicate: Some(predicate),
                action,
            },
        );
        id
    }

    /// Drop a pending condition. Returns `false` if it already fired.
    pub fn cancel(&mut self, id: ConditionId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn is_pending(&self, id: ConditionId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove every pending condition, keeping the id generator.
    pub(crate) fn take_all(&mut self) -> Vec<(Option<Predicate>, Action)> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|entry| (entry.predicate, entry.action))
            .collect()
    }

    fn snapshot(&self) -> Vec<ConditionId> {
        self.pending.keys().copied().collect()
    }

    fn take_predicate(&mut self, id: ConditionId) -> Option<Predicate> {
        self.pending.get_mut(&id)?.predicate.take()
    }

    /// Put the predicate back, or remove the entry and hand out its action.
    fn settle(&mut self, id: ConditionId, predicate: Predicate, satisfied: bool) -> Option<Action> {
        if satisfied {
            return self.pending.remove(&id).map(|entry| entry.action);
        }
        if let Some(entry) = self.pending.get_mut(&id) {
            entry.predicate = Some(predicate);
        }
        None
    }
}

impl std::fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionRegistry")
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Test every condition pending at the start of the pass, in
/// registration order, handing each satisfied one to `fire`.
///
/// The registry is only borrowed between predicate calls, so predicates
/// and fired actions may freely use the session. Conditions registered
/// during the pass wait for the next one. Returns how many fired.
pub fn evaluate_all<F>(
    registry: &RefCell<ConditionRegistry>,
    sim: &Simulation,
    mut fire: F,
) -> KernelResult<usize>
where
    F: FnMut(ConditionId, Action) -> KernelResult<()>,
{
    let ids = registry.borrow().snapshot();
    let mut fired = 0;
    for id in ids {
        // Cancelled by an earlier action in this pass.
        let Some(mut predicate) = registry.borrow_mut().take_predicate(id) else {
            continue;
        };
        let satisfied = predicate(sim);
        let action = registry.borrow_mut().settle(id, predicate, satisfied);
        if let Some(action) = action {
            fired += 1;
            fire(id, action)?;
        }
    }
    Ok(fired)
}
