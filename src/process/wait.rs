//! Suspension futures returned by [`Process`](super::Process).

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::condition::{ConditionId, Predicate};
use crate::error::{KernelError, KernelResult};
use crate::event::{EventId, Timing};
use crate::simulation::Kernel;

use super::table::{ProcessId, WaitReason};

// ── Delay ─────────────────────────────────────────────────────────────

enum DelayState {
    Start(Timing),
    Waiting { event: EventId, fired: Rc<Cell<bool>> },
    Done,
}

/// Resolves once simulated time reaches the requested instant.
///
/// The first poll registers a timed event that wakes the process.
/// Dropping a pending `Delay` cancels that event.
#[must_use = "futures do nothing unless awaited"]
pub struct Delay {
    kernel: Weak<Kernel>,
    pid: ProcessId,
    state: DelayState,
}

impl Delay {
    pub(crate) fn new(kernel: Weak<Kernel>, pid: ProcessId, timing: Timing) -> Self {
        Delay {
            kernel,
            pid,
            state: DelayState::Start(timing),
        }
    }
}

impl Future for Delay {
    type Output = KernelResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.state {
            DelayState::Start(timing) => {
                let timing = *timing;
                let Some(kernel) = this.kernel.upgrade() else {
                    this.state = DelayState::Done;
                    return Poll::Ready(Err(KernelError::SessionClosed));
                };
                let fired = Rc::new(Cell::new(false));
                let flag = Rc::clone(&fired);
                let waker = cx.waker().clone();
                let scheduled = kernel.schedule_timed(
                    timing,
                    Box::new(move |_| {
                        flag.set(true);
                        waker.wake();
                        Ok(())
                    }),
                );
                match scheduled {
                    Ok((event, due)) => {
                        kernel.mark_waiting(this.pid, WaitReason::At(due));
                        this.state = DelayState::Waiting { event, fired };
                        Poll::Pending
                    }
                    Err(e) => {
                        this.state = DelayState::Done;
                        Poll::Ready(Err(e))
                    }
                }
            }
            DelayState::Waiting { fired, .. } => {
                if fired.get() {
                    this.state = DelayState::Done;
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Pending
                }
            }
            DelayState::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        if let DelayState::Waiting { event, fired } = &self.state {
            if !fired.get() {
                if let Some(kernel) = self.kernel.upgrade() {
                    kernel.cancel_timed(*event);
                }
            }
        }
    }
}

// ── WaitFor ───────────────────────────────────────────────────────────

enum WaitForState {
    Start(Predicate),
    Waiting { condition: ConditionId, fired: Rc<Cell<bool>> },
    Done,
}

/// Resolves once a predicate holds at a tick.
///
/// The predicate goes to the condition registry, so it is only checked
/// when the dispatcher evaluates conditions, never at the await itself.
#[must_use = "futures do nothing unless awaited"]
pub struct WaitFor {
    kernel: Weak<Kernel>,
    pid: ProcessId,
    state: WaitForState,
}

impl WaitFor {
    pub(crate) fn new(kernel: Weak<Kernel>, pid: ProcessId, predicate: Predicate) -> Self {
        WaitFor {
            kernel,
            pid,
            state: WaitForState::Start(predicate),
        }
    }
}

impl Future for WaitFor {
    type Output = KernelResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, WaitForState::Done) {
            WaitForState::Start(predicate) => {
                let Some(kernel) = this.kernel.upgrade() else {
                    return Poll::Ready(Err(KernelError::SessionClosed));
                };
                let fired = Rc::new(Cell::new(false));
                let flag = Rc::clone(&fired);
                let waker = cx.waker().clone();
                let condition = kernel.register_condition(
                    predicate,
                    Box::new(move |_| {
                        flag.set(true);
                        waker.wake();
                        Ok(())
                    }),
                );
                kernel.mark_waiting(this.pid, WaitReason::Predicate(condition));
                this.state = WaitForState::Waiting { condition, fired };
                Poll::Pending
            }
            WaitForState::Waiting { condition, fired } => {
                if fired.get() {
                    Poll::Ready(Ok(()))
                } else {
                    this.state = WaitForState::Waiting { condition, fired };
                    Poll::Pending
                }
            }
            WaitForState::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for WaitFor {
    fn drop(&mut self) {
        if let WaitForState::Waiting { condition, fired } = &self.state {
            if !fired.get() {
                if let Some(kernel) = self.kernel.upgrade() {
                    kernel.cancel_condition(*condition);
                }
            }
        }
    }
}
