//! The handle a process body uses to talk to its session.

use std::rc::Weak;

use crate::error::{KernelError, KernelResult};
use crate::event::Timing;
use crate::simulation::{Kernel, Simulation};
use crate::time::SimTime;

use super::table::ProcessId;
use super::wait::{Delay, WaitFor};

/// Passed to every process body by [`Simulation::launch`].
///
/// Holds a weak reference to the session, so a body that keeps its
/// handle does not keep the session alive.
///
/// # Example
///
/// ```rust
/// use kairos::Simulation;
///
/// let sim = Simulation::new();
/// sim.launch(|p| async move {
///     p.delay(2.0).await?;
///     assert_eq!(p.now().value(), 2.0);
///     Ok(())
/// });
/// sim.run(5.0).unwrap();
/// ```
#[derive(Clone)]
pub struct Process {
    id: ProcessId,
    kernel: Weak<Kernel>,
}

impl Process {
    pub(crate) fn new(id: ProcessId, kernel: Weak<Kernel>) -> Self {
        Process { id, kernel }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Current simulated time (zero once the session is gone).
    pub fn now(&self) -> SimTime {
        self.kernel
            .upgrade()
            .map(|kernel| kernel.now())
            .unwrap_or_default()
    }

    /// Suspend for `duration` of simulated time.
    pub fn delay(&self, duration: f64) -> Delay {
        Delay::new(self.kernel.clone(), self.id, Timing::After(duration))
    }

    /// Suspend until the absolute time `at`.
    ///
    /// Resolves to `PastSchedule` if `at` is already in the past when awaited.
    pub fn wait_until(&self, at: impl Into<SimTime>) -> Delay {
        Delay::new(self.kernel.clone(), self.id, Timing::At(at.into()))
    }

    /// Suspend until `predicate` holds at a tick.
    pub fn wait_for<P>(&self, predicate: P) -> WaitFor
    where
        P: FnMut(&Simulation) -> bool + 'static,
    {
        WaitFor::new(self.kernel.clone(), self.id, Box::new(predicate))
    }

    /// Run `f` with the session, e.g. to schedule events from a body.
    ///
    /// The `Simulation` is only lent for the call; keeping a clone across
    /// an await would tie the session's lifetime to the process.
    pub fn with_sim<R>(&self, f: impl FnOnce(&Simulation) -> R) -> KernelResult<R> {
        let kernel = self.kernel.upgrade().ok_or(KernelError::SessionClosed)?;
        Ok(f(&Simulation::from_kernel(kernel)))
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("id", &self.id).finish()
    }
}
