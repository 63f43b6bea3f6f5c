//! State machines driven by simulation events.
//!
//! A [`StateMachine`] maps `(state, event kind)` pairs to handlers. A
//! handler may change the state, update the model and schedule more
//! work through the session; it never moves the clock. Pairs without a
//! handler go to the fallback, which by default logs the
//! [`UndefinedTransition`] and leaves the state alone.
//!
//! ```rust
//! use kairos::{Dispatch, Simulation, StateMachine, Tagged};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
//! enum Door { Closed, Open }
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
//! enum Push { Open, Close }
//!
//! impl Tagged for Push {
//!     type Kind = Push;
//!     fn kind(&self) -> Push { *self }
//! }
//!
//! let sim = Simulation::new();
//! let mut door = StateMachine::new(Door::Closed, 0u32)
//!     .on(Door::Closed, Push::Open, |step, _| {
//!         *step.model_mut() += 1;
//!         step.set_state(Door::Open);
//!         Ok(())
//!     });
//!
//! assert_eq!(door.dispatch(&sim, Push::Open).unwrap(), Dispatch::Handled);
//! assert_eq!(door.dispatch(&sim, Push::Open).unwrap(), Dispatch::Undefined);
//! assert_eq!((door.state(), *door.model()), (Door::Open, 1));
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::rc::Rc;

use tracing::warn;

use crate::error::KernelResult;
use crate::event::{ActionResult, EventId};
use crate::simulation::Simulation;
use crate::time::SimTime;

/// An event with a closed set of kinds used as transition keys.
pub trait Tagged {
    type Kind: Copy + Ord + Debug + 'static;

    fn kind(&self) -> Self::Kind;
}

/// What a handler sees: the machine's state and model plus the session.
pub struct Step<'a, S, M> {
    state: &'a mut S,
    model: &'a mut M,
    sim: &'a Simulation,
}

impl<S: Copy, M> Step<'_, S, M> {
    pub fn state(&self) -> S {
        *self.state
    }

    pub fn set_state(&mut self, state: S) {
        *self.state = state;
    }

    pub fn model(&self) -> &M {
        self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        self.model
    }

    pub fn sim(&self) -> &Simulation {
        self.sim
    }

    pub fn now(&self) -> SimTime {
        self.sim.now()
    }
}

/// Report handed to the fallback for an unmapped pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UndefinedTransition<S, K> {
    pub state: S,
    pub kind: K,
    pub at: SimTime,
}

impl<S: Debug, K: Debug> std::fmt::Display for UndefinedTransition<S, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "undefined transition from {:?} on {:?} at t={}",
            self.state, self.kind, self.at
        )
    }
}

fn log_undefined<S: Debug, K: Debug, M, E>(
    _: &mut Step<'_, S, M>,
    report: UndefinedTransition<S, K>,
    _: E,
) {
    warn!("{report}");
}

/// Outcome of [`StateMachine::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Undefined,
}

type Handler<S, E, M> = Box<dyn FnMut(&mut Step<'_, S, M>, E) -> ActionResult>;
type Fallback<S, E, M> =
    Box<dyn FnMut(&mut Step<'_, S, M>, UndefinedTransition<S, <E as Tagged>::Kind>, E)>;

/// A transition table bound to a state and a model.
pub struct StateMachine<S, E: Tagged, M> {
    state: S,
    model: M,
    table: BTreeMap<(S, E::Kind), Handler<S, E, M>>,
    fallback: Fallback<S, E, M>,
    undefined: u64,
}

impl<S, E, M> StateMachine<S, E, M>
where
    S: Copy + Ord + Debug + 'static,
    E: Tagged + 'static,
    M: 'static,
{
    pub fn new(initial: S, model: M) -> Self {
        StateMachine {
            state: initial,
            model,
            table: BTreeMap::new(),
            fallback: Box::new(log_undefined::<S, E::Kind, M, E>),
            undefined: 0,
        }
    }

    /// Handle events of `kind` arriving in `state`. Replaces any
    /// handler already registered for the pair.
    pub fn on<H>(mut self, state: S, kind: E::Kind, handler: H) -> Self
    where
        H: FnMut(&mut Step<'_, S, M>, E) -> ActionResult + 'static,
    {
        self.table.insert((state, kind), Box::new(handler));
        self
    }

    /// Replace the handler for unmapped pairs.
    pub fn otherwise<H>(mut self, fallback: H) -> Self
    where
        H: FnMut(&mut Step<'_, S, M>, UndefinedTransition<S, E::Kind>, E) + 'static,
    {
        self.fallback = Box::new(fallback);
        self
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Number of events that hit the fallback.
    pub fn undefined_count(&self) -> u64 {
        self.undefined
    }

    /// Whether a handler exists for `(state, kind)`.
    pub fn handles(&self, state: S, kind: E::Kind) -> bool {
        self.table.contains_key(&(state, kind))
    }

    /// Feed `event` to the handler for the current state.
    ///
    /// Errors from the handler are returned as-is; the fallback cannot fail.
    pub fn dispatch(&mut self, sim: &Simulation, event: E) -> anyhow::Result<Dispatch> {
        let kind = event.kind();
        let mut step = Step {
            state: &mut self.state,
            model: &mut self.model,
            sim,
        };
        match self.table.get_mut(&(*step.state, kind)) {
            Some(handler) => {
                handler(&mut step, event)?;
                Ok(Dispatch::Handled)
            }
            None => {
                self.undefined += 1;
                let report = UndefinedTransition {
                    state: *step.state,
                    kind,
                    at: sim.now(),
                };
                (self.fallback)(&mut step, report, event);
                Ok(Dispatch::Undefined)
            }
        }
    }

    /// Wrap the machine for shared use from scheduled actions.
    pub fn shared(self) -> SharedMachine<S, E, M> {
        Rc::new(RefCell::new(self))
    }
}

impl<S: Debug, E: Tagged, M> Debug for StateMachine<S, E, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state)
            .field("transitions", &self.table.keys().collect::<Vec<_>>())
            .field("undefined", &self.undefined)
            .finish_non_exhaustive()
    }
}

/// A machine reachable from several scheduled actions.
pub type SharedMachine<S, E, M> = Rc<RefCell<StateMachine<S, E, M>>>;

/// Deliver `event` to `machine` after `delay`.
///
/// The delivery fails the run if the machine is already dispatching
/// when it fires.
pub fn dispatch_after<S, E, M>(
    machine: &SharedMachine<S, E, M>,
    sim: &Simulation,
    delay: f64,
    event: E,
) -> KernelResult<EventId>
where
    S: Copy + Ord + Debug + 'static,
    E: Tagged + 'static,
    M: 'static,
{
    let machine = Rc::clone(machine);
    sim.schedule_after(delay, move |sim| {
        let mut machine = machine
            .try_borrow_mut()
            .map_err(|_| anyhow::anyhow!("state machine is already dispatching"))?;
        machine.dispatch(sim, event)?;
        Ok(())
    })
}
