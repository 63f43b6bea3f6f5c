//! Simulation session and dispatch loop.
//!
//! [`Simulation`] is the caller-owned session: it owns the clock, the
//! event stores and the process table, and drives them from `run`.
//! Everything is single-threaded; kernel state lives in separate
//! `RefCell`s that are only borrowed for short bookkeeping, never while
//! a collaborator action, predicate or process body runs. That lets
//! actions schedule, cancel, launch and kill freely from inside a run.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll};

use tracing::{debug, error, info, info_span, warn};

use crate::channel::{Channel, ChannelId};
use crate::condition::{evaluate_all, ConditionId, ConditionRegistry, Predicate};
use crate::config::SimConfig;
use crate::error::{KernelError, KernelResult};
use crate::event::{Action, ActionResult, EventId, Timing};
use crate::periodic::{CycleId, Cycles, SamplerId, Samplers};
use crate::process::table::{ProcessTable, WaitReason};
use crate::process::{Process, ProcessId, ProcessState};
use crate::scheduler::{resolve_due, EventQueue};
use crate::time::{check_duration, SimTime, VirtualClock};
use crate::trace::{TraceEntry, TraceKind};

// ── Run summary ───────────────────────────────────────────────────────

/// What a call to [`Simulation::run`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct RunSummary {
    /// Timed events fired (including cycle repetitions).
    pub clock_events: u64,
    /// Sample ticks taken.
    pub sample_steps: u64,
    /// Conditional events released.
    pub conditions_fired: u64,
    /// Process polls.
    pub processes_resumed: u64,
    /// Clock value when the run returned.
    pub sim_time: SimTime,
}

impl RunSummary {
    #[cfg(feature = "serialize")]
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run! finished with {} clock events, {} sample steps, simulation time: {}",
            self.clock_events, self.sample_steps, self.sim_time
        )
    }
}

/// Confirmation returned by [`Simulation::reset`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResetReport {
    pub epoch: SimTime,
    pub sample_rate: f64,
}

impl std::fmt::Display for ResetReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "clock reset to t0={}, sampling rate dt={:?}.",
            self.epoch, self.sample_rate
        )
    }
}

// ── Kernel ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Status {
    Idle,
    Running,
    Failed(SimTime),
}

/// Shared session state. Process handles and channels hold it weakly.
pub(crate) struct Kernel {
    clock: RefCell<VirtualClock>,
    queue: RefCell<EventQueue>,
    conditions: RefCell<ConditionRegistry>,
    samplers: RefCell<Samplers>,
    cycles: RefCell<Cycles>,
    processes: RefCell<ProcessTable>,
    /// The process being polled, if any.
    current: Cell<Option<ProcessId>>,
    status: Cell<Status>,
    stop_requested: Cell<bool>,
    next_channel: Cell<u64>,
    trace: RefCell<Option<Vec<TraceEntry>>>,
}

impl Kernel {
    fn new(config: &SimConfig) -> Self {
        Kernel {
            clock: RefCell::new(VirtualClock::new(config.epoch, config.sample_rate)),
            queue: RefCell::new(EventQueue::new()),
            conditions: RefCell::new(ConditionRegistry::new()),
            samplers: RefCell::new(Samplers::default()),
            cycles: RefCell::new(Cycles::default()),
            processes: RefCell::new(ProcessTable::default()),
            current: Cell::new(None),
            status: Cell::new(Status::Idle),
            stop_requested: Cell::new(false),
            next_channel: Cell::new(0),
            trace: RefCell::new(config.trace.then(Vec::new)),
        }
    }

    pub(crate) fn now(&self) -> SimTime {
        self.clock.borrow().now()
    }

    /// Queue `action`, returning its id and resolved due time.
    pub(crate) fn schedule_timed(
        &self,
        timing: Timing,
        action: Action,
    ) -> KernelResult<(EventId, SimTime)> {
        let due = resolve_due(self.now(), timing)?;
        let id = self.queue.borrow_mut().push(due, action);
        Ok((id, due))
    }

    pub(crate) fn cancel_timed(&self, id: EventId) -> bool {
        self.queue.borrow_mut().cancel(id)
    }

    pub(crate) fn register_condition(&self, predicate: Predicate, action: Action) -> ConditionId {
        self.conditions.borrow_mut().register(predicate, action)
    }

    pub(crate) fn cancel_condition(&self, id: ConditionId) -> bool {
        self.conditions.borrow_mut().cancel(id)
    }

    pub(crate) fn mark_waiting(&self, pid: ProcessId, reason: WaitReason) {
        self.processes.borrow_mut().mark_waiting(pid, reason);
    }

    /// Record `reason` for the process being polled. No-op from event code.
    pub(crate) fn mark_current_waiting(&self, reason: WaitReason) {
        if let Some(pid) = self.current.get() {
            self.mark_waiting(pid, reason);
        }
    }

    pub(crate) fn next_channel_id(&self) -> ChannelId {
        let raw = self.next_channel.get();
        self.next_channel.set(raw + 1);
        ChannelId::new(raw)
    }

    fn record(&self, kind: TraceKind) {
        if let Some(trace) = self.trace.borrow_mut().as_mut() {
            trace.push(TraceEntry {
                time: self.now(),
                kind,
            });
        }
    }
}

/// Marks the session as running for the lifetime of a `run` or `step`.
struct RunGuard<'a> {
    kernel: &'a Kernel,
}

impl<'a> RunGuard<'a> {
    fn enter(kernel: &'a Kernel) -> KernelResult<Self> {
        match kernel.status.get() {
            Status::Running => Err(KernelError::AlreadyRunning),
            Status::Failed(failed_at) => Err(KernelError::NeedsReset { failed_at }),
            Status::Idle => {
                kernel.status.set(Status::Running);
                kernel.stop_requested.set(false);
                Ok(RunGuard { kernel })
            }
        }
    }

    fn finish<T>(self, result: KernelResult<T>) -> KernelResult<T> {
        if let Err(e) = &result {
            if !e.is_recoverable() {
                self.kernel.status.set(Status::Failed(self.kernel.now()));
            }
        }
        result
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.kernel.status.get() == Status::Running {
            self.kernel.status.set(Status::Idle);
        }
    }
}

// ── Simulation ────────────────────────────────────────────────────────

/// A simulation session.
///
/// Cloning yields another handle to the same session. Actions receive
/// a `&Simulation` so they can read the clock and schedule more work.
///
/// ```rust
/// use kairos::Simulation;
///
/// let sim = Simulation::new();
/// sim.schedule_after(1.0, |sim| {
///     assert_eq!(sim.now().value(), 1.0);
///     Ok(())
/// })
/// .unwrap();
/// let summary = sim.run(30.0).unwrap();
/// assert_eq!(
///     summary.to_string(),
///     "run! finished with 1 clock events, 0 sample steps, simulation time: 30.0"
/// );
/// ```
#[derive(Clone)]
pub struct Simulation {
    kernel: Rc<Kernel>,
}

impl Simulation {
    /// Create a session at time zero with sampling disabled.
    pub fn new() -> Self {
        Self::build(&SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> KernelResult<Self> {
        config.validate()?;
        Ok(Self::build(&config))
    }

    fn build(config: &SimConfig) -> Self {
        Simulation {
            kernel: Rc::new(Kernel::new(config)),
        }
    }

    pub(crate) fn from_kernel(kernel: Rc<Kernel>) -> Self {
        Simulation { kernel }
    }

    /// Current simulated time.
    #[inline]
    pub fn now(&self) -> SimTime {
        self.kernel.now()
    }

    pub fn epoch(&self) -> SimTime {
        self.kernel.clock.borrow().epoch()
    }

    pub fn sample_rate(&self) -> f64 {
        self.kernel.clock.borrow().sample_rate()
    }

    // ── Timed events ─────────────────────────────────────

    /// Register a timed action.
    pub fn schedule<F>(&self, timing: Timing, action: F) -> KernelResult<EventId>
    where
        F: FnOnce(&Simulation) -> ActionResult + 'static,
    {
        let (id, due) = self.kernel.schedule_timed(timing, Box::new(action))?;
        debug!(event = %id, due = %due, "scheduled");
        Ok(id)
    }

    /// Register an action at absolute time `at` (`PastSchedule` if `at < now`).
    pub fn schedule_at<F>(&self, at: impl Into<SimTime>, action: F) -> KernelResult<EventId>
    where
        F: FnOnce(&Simulation) -> ActionResult + 'static,
    {
        self.schedule(Timing::At(at.into()), action)
    }

    /// Register an action `delay` after now.
    pub fn schedule_after<F>(&self, delay: f64, action: F) -> KernelResult<EventId>
    where
        F: FnOnce(&Simulation) -> ActionResult + 'static,
    {
        self.schedule(Timing::After(delay), action)
    }

    /// Cancel a timed event. Returns `false` if it already fired.
    pub fn cancel(&self, id: EventId) -> bool {
        self.kernel.cancel_timed(id)
    }

    /// Run `action` every `interval`, first at `now + interval`.
    pub fn schedule_every<F>(&self, interval: f64, action: F) -> KernelResult<CycleId>
    where
        F: FnMut(&Simulation) -> ActionResult + 'static,
    {
        if check_duration(interval)? == 0.0 {
            return Err(KernelError::InvalidTime(interval));
        }
        let id = self.kernel.cycles.borrow_mut().add(interval, Box::new(action));
        self.arm_cycle(id, interval)?;
        Ok(id)
    }

    /// Stop a repeating action. Returns `false` if it was already stopped.
    pub fn cancel_cycle(&self, id: CycleId) -> bool {
        let removed = self.kernel.cycles.borrow_mut().remove(id);
        match removed {
            Some(cycle) => {
                if let Some(event) = cycle.pending {
                    self.kernel.cancel_timed(event);
                }
                true
            }
            None => false,
        }
    }

    fn arm_cycle(&self, id: CycleId, interval: f64) -> KernelResult<()> {
        let event = self.schedule(Timing::After(interval), move |sim| sim.fire_cycle(id))?;
        if let Some(cycle) = self.kernel.cycles.borrow_mut().get_mut(id) {
            cycle.pending = Some(event);
        }
        Ok(())
    }

    fn fire_cycle(&self, id: CycleId) -> ActionResult {
        let checked_out = self.kernel.cycles.borrow_mut().get_mut(id).and_then(|cycle| {
            cycle.pending = None;
            cycle.action.take().map(|action| (action, cycle.interval))
        });
        let Some((mut action, interval)) = checked_out else {
            return Ok(());
        };
        let result = action(self);
        // Cancelled by its own action: `action` is dropped after the borrow ends.
        let rearm = match self.kernel.cycles.borrow_mut().get_mut(id) {
            Some(cycle) => {
                cycle.action = Some(action);
                true
            }
            None => false,
        };
        result?;
        if rearm {
            self.arm_cycle(id, interval)?;
        }
        Ok(())
    }

    // ── Conditional events ───────────────────────────────

    /// Register `action` to fire at the first tick where `predicate` holds.
    ///
    /// The predicate is never evaluated at registration.
    pub fn schedule_when<P, F>(&self, predicate: P, action: F) -> ConditionId
    where
        P: FnMut(&Simulation) -> bool + 'static,
        F: FnOnce(&Simulation) -> ActionResult + 'static,
    {
        let id = self
            .kernel
            .register_condition(Box::new(predicate), Box::new(action));
        debug!(condition = %id, "registered");
        id
    }

    pub fn cancel_condition(&self, id: ConditionId) -> bool {
        self.kernel.cancel_condition(id)
    }

    // ── Sampling ─────────────────────────────────────────

    /// Run `action` at every sample tick.
    pub fn sample<F>(&self, action: F) -> SamplerId
    where
        F: FnMut(&Simulation) -> ActionResult + 'static,
    {
        self.kernel.samplers.borrow_mut().add(Box::new(action))
    }

    pub fn cancel_sampler(&self, id: SamplerId) -> bool {
        self.kernel.samplers.borrow_mut().remove(id)
    }

    /// Change the sampling interval; the next tick is `now + sample_rate`.
    pub fn set_sample_rate(&self, sample_rate: f64) -> KernelResult<()> {
        check_duration(sample_rate)?;
        self.kernel.clock.borrow_mut().set_sample_rate(sample_rate);
        Ok(())
    }

    // ── Processes ────────────────────────────────────────

    /// Start a cooperative process.
    ///
    /// The body is first polled at the current instant: at the start of
    /// the next `run`/`step`, or right after the running action returns.
    pub fn launch<F, Fut>(&self, body: F) -> ProcessId
    where
        F: FnOnce(Process) -> Fut,
        Fut: Future<Output = ActionResult> + 'static,
    {
        let id = self.kernel.processes.borrow_mut().reserve();
        let future = body(Process::new(id, Rc::downgrade(&self.kernel)));
        self.kernel
            .processes
            .borrow_mut()
            .insert(id, Box::pin(future));
        debug!(process = %id, t = %self.now(), "launched");
        id
    }

    /// Terminate a process from outside.
    ///
    /// Its pending delay, condition or channel operation is withdrawn.
    /// Returns `false` if it had already terminated.
    pub fn kill(&self, id: ProcessId) -> bool {
        let removed = self.kernel.processes.borrow_mut().remove(id);
        let Some(body) = removed else {
            return false;
        };
        warn!(process = %id, t = %self.now(), "process killed");
        self.kernel.record(TraceKind::Killed(id));
        drop(body);
        true
    }

    pub fn process_state(&self, id: ProcessId) -> Option<ProcessState> {
        self.kernel.processes.borrow().state(id)
    }

    /// Number of processes that have not terminated.
    pub fn process_count(&self) -> usize {
        self.kernel.processes.borrow().len()
    }

    // ── Channels ─────────────────────────────────────────

    /// Create a bounded FIFO channel. Capacity 0 makes every handoff a
    /// rendezvous.
    pub fn channel<T>(&self, capacity: usize) -> Channel<T> {
        Channel::new(
            self.kernel.next_channel_id(),
            capacity,
            Rc::downgrade(&self.kernel),
        )
    }

    // ── Running ──────────────────────────────────────────

    /// Run until simulated time `until`.
    ///
    /// On normal return `now() == until`, even if nothing was pending.
    /// A `stop()` from inside the run ends it after the current instant.
    pub fn run(&self, until: impl Into<SimTime>) -> KernelResult<RunSummary> {
        let until = until.into().validated()?;
        let now = self.now();
        if until < now {
            return Err(KernelError::PastSchedule {
                requested: until,
                now,
            });
        }
        let guard = RunGuard::enter(&self.kernel)?;
        let _span = info_span!("run", from = %now, until = %until).entered();
        info!(
            pending = self.pending_events(),
            ready = self.kernel.processes.borrow().ready().len(),
            "run started"
        );

        let mut summary = RunSummary::default();
        let result = self.run_loop(until, &mut summary);
        summary.sim_time = self.now();
        guard.finish(result)?;
        info!("{summary}");
        Ok(summary)
    }

    /// Run for `duration` of simulated time.
    pub fn run_for(&self, duration: f64) -> KernelResult<RunSummary> {
        let until = self.now().plus(duration)?;
        self.run(until)
    }

    /// Advance to the next instant with timed or sample work and settle it.
    ///
    /// Returns the instant, or `None` when nothing is pending.
    pub fn step(&self) -> KernelResult<Option<SimTime>> {
        let guard = RunGuard::enter(&self.kernel)?;
        let mut summary = RunSummary::default();
        let result = self.step_inner(&mut summary);
        guard.finish(result)
    }

    /// Ask the active run to return after the current instant.
    pub fn stop(&self) {
        if self.is_running() {
            self.kernel.stop_requested.set(true);
        }
    }

    /// Discard all pending work and rewind the clock to `epoch`.
    ///
    /// Accepted on a failed session; rejected while a run is active.
    pub fn reset(&self, epoch: impl Into<SimTime>, sample_rate: f64) -> KernelResult<ResetReport> {
        if self.is_running() {
            return Err(KernelError::AlreadyRunning);
        }
        let epoch = epoch.into().validated()?;
        check_duration(sample_rate)?;

        // Bodies go first: dropping them withdraws their waits from the
        // stores cleared below.
        let bodies = self.kernel.processes.borrow_mut().take_all();
        drop(bodies);
        let events = self.kernel.queue.borrow_mut().take_all();
        drop(events);
        let conditions = self.kernel.conditions.borrow_mut().take_all();
        drop(conditions);
        let samplers = self.kernel.samplers.borrow_mut().take_all();
        drop(samplers);
        let cycles = self.kernel.cycles.borrow_mut().take_all();
        drop(cycles);
        self.kernel.processes.borrow().ready().clear();
        if let Some(trace) = self.kernel.trace.borrow_mut().as_mut() {
            trace.clear();
        }

        self.kernel.clock.borrow_mut().reset(epoch, sample_rate);
        self.kernel.status.set(Status::Idle);
        self.kernel.stop_requested.set(false);

        let report = ResetReport { epoch, sample_rate };
        info!("{report}");
        Ok(report)
    }

    // ── Probes ───────────────────────────────────────────

    pub fn pending_events(&self) -> usize {
        self.kernel.queue.borrow().len()
    }

    pub fn pending_conditions(&self) -> usize {
        self.kernel.conditions.borrow().len()
    }

    pub fn pending_samplers(&self) -> usize {
        self.kernel.samplers.borrow().len()
    }

    pub fn pending_cycles(&self) -> usize {
        self.kernel.cycles.borrow().len()
    }

    pub fn is_running(&self) -> bool {
        self.kernel.status.get() == Status::Running
    }

    /// The dispatch trace, if enabled in [`SimConfig`].
    pub fn trace(&self) -> Option<Vec<TraceEntry>> {
        self.kernel.trace.borrow().clone()
    }

    // ── Dispatcher ───────────────────────────────────────

    fn run_loop(&self, until: SimTime, summary: &mut RunSummary) -> KernelResult<()> {
        self.resume_ready(summary)?;
        while self.now() < until && !self.kernel.stop_requested.get() {
            let target = self.next_instant().map_or(until, |t| t.min(until));
            self.advance(target, summary)?;
        }
        Ok(())
    }

    fn step_inner(&self, summary: &mut RunSummary) -> KernelResult<Option<SimTime>> {
        self.resume_ready(summary)?;
        let Some(target) = self.next_instant() else {
            return Ok(None);
        };
        self.advance(target, summary)?;
        Ok(Some(target))
    }

    /// Earliest of the next sample tick and the next timed event.
    fn next_instant(&self) -> Option<SimTime> {
        let sample = self.kernel.clock.borrow().next_sample();
        let timed = self.kernel.queue.borrow_mut().next_due();
        match (sample, timed) {
            (Some(s), Some(t)) => Some(s.min(t)),
            (s, t) => s.or(t),
        }
    }

    fn advance(&self, target: SimTime, summary: &mut RunSummary) -> KernelResult<()> {
        let sample_due = self.kernel.clock.borrow().next_sample() == Some(target);
        self.kernel.clock.borrow_mut().advance_to(target)?;
        if sample_due {
            self.sample_tick(summary)?;
        }
        self.settle(sample_due, summary)
    }

    fn sample_tick(&self, summary: &mut RunSummary) -> KernelResult<()> {
        self.kernel.clock.borrow_mut().mark_sampled();
        summary.sample_steps += 1;
        self.kernel.record(TraceKind::Sample);

        let ids = self.kernel.samplers.borrow().ids();
        for id in ids {
            let Some(mut action) = self.kernel.samplers.borrow_mut().checkout(id) else {
                continue;
            };
            let result = action(self);
            let cancelled = self.kernel.samplers.borrow_mut().checkin(id, action);
            drop(cancelled);
            result.map_err(|e| self.failure(e))?;
            self.resume_ready(summary)?;
        }
        self.evaluate_conditions(summary)
    }

    /// Fire every timed event due now, re-checking conditions after each
    /// batch, until the instant is quiescent.
    ///
    /// Conditions are checked at least once per clock advance, even when
    /// nothing else happens at the instant. `checked` says the sample tick
    /// already did that.
    fn settle(&self, mut checked: bool, summary: &mut RunSummary) -> KernelResult<()> {
        let now = self.now();
        loop {
            let mut fired = 0;
            loop {
                let next = self.kernel.queue.borrow_mut().pop_due(now);
                let Some(event) = next else {
                    break;
                };
                fired += 1;
                summary.clock_events += 1;
                debug!(event = %event.id, t = %now, "fire");
                self.kernel.record(TraceKind::Timed(event.id));
                (event.action)(self).map_err(|e| self.failure(e))?;
                self.resume_ready(summary)?;
            }
            if fired == 0 && checked {
                return Ok(());
            }
            self.evaluate_conditions(summary)?;
            checked = true;
        }
    }

    fn evaluate_conditions(&self, summary: &mut RunSummary) -> KernelResult<()> {
        evaluate_all(&self.kernel.conditions, self, |id, action| {
            summary.conditions_fired += 1;
            debug!(condition = %id, t = %self.now(), "fire");
            self.kernel.record(TraceKind::Condition(id));
            action(self).map_err(|e| self.failure(e))?;
            self.resume_ready(summary)
        })?;
        Ok(())
    }

    /// Poll woken processes, in wake order, until none are left.
    fn resume_ready(&self, summary: &mut RunSummary) -> KernelResult<()> {
        loop {
            let next = self.kernel.processes.borrow().ready().pop();
            let Some(pid) = next else {
                return Ok(());
            };
            self.poll_process(pid, summary)?;
        }
    }

    fn poll_process(&self, pid: ProcessId, summary: &mut RunSummary) -> KernelResult<()> {
        let checked_out = self.kernel.processes.borrow_mut().checkout(pid);
        // Killed, or woken twice.
        let Some((mut body, waker)) = checked_out else {
            return Ok(());
        };
        summary.processes_resumed += 1;
        debug!(process = %pid, t = %self.now(), "resume");
        self.kernel.record(TraceKind::Resumed(pid));

        let previous = self.kernel.current.replace(Some(pid));
        let poll = body.as_mut().poll(&mut Context::from_waker(&waker));
        self.kernel.current.set(previous);

        match poll {
            Poll::Pending => {
                let killed = self.kernel.processes.borrow_mut().checkin(pid, body);
                drop(killed);
                Ok(())
            }
            Poll::Ready(result) => {
                drop(body);
                let removed = self.kernel.processes.borrow_mut().remove(pid);
                if removed.is_some() {
                    debug!(process = %pid, t = %self.now(), "terminated");
                    self.kernel.record(TraceKind::Terminated(pid));
                }
                result.map_err(|e| self.failure(e))
            }
        }
    }

    fn failure(&self, source: anyhow::Error) -> KernelError {
        let at = self.now();
        error!(t = %at, error = %source, "action failed");
        KernelError::action(at, source)
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("now", &self.now())
            .field("status", &self.kernel.status.get())
            .field("pending_events", &self.pending_events())
            .field("pending_conditions", &self.pending_conditions())
            .field("processes", &self.process_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    type Log = Rc<RefCell<Vec<(f64, &'static str)>>>;

    fn log() -> Log {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn note(log: &Log, label: &'static str) -> impl FnOnce(&Simulation) -> ActionResult {
        let log = Rc::clone(log);
        move |sim| {
            log.borrow_mut().push((sim.now().value(), label));
            Ok(())
        }
    }

    #[test]
    fn test_basic_execution_loop() {
        let sim = Simulation::new();
        let log = log();

        sim.schedule_at(10.0, note(&log, "a")).unwrap();
        sim.schedule_at(20.0, note(&log, "b")).unwrap();
        sim.schedule_at(30.0, note(&log, "c")).unwrap();

        let summary = sim.run(30.0).unwrap();

        assert_eq!(summary.clock_events, 3);
        assert_eq!(*log.borrow(), vec![(10.0, "a"), (20.0, "b"), (30.0, "c")]);
        assert_eq!(sim.now(), SimTime::new(30.0));
    }

    #[test]
    fn test_handler_schedules_followup() {
        fn ping(log: Log) -> impl FnOnce(&Simulation) -> ActionResult {
            move |sim| {
                log.borrow_mut().push((sim.now().value(), "ping"));
                if sim.now().value() < 30.0 {
                    sim.schedule_after(10.0, ping(Rc::clone(&log)))?;
                }
                Ok(())
            }
        }

        let sim = Simulation::new();
        let log = log();
        sim.schedule_at(0.0, ping(Rc::clone(&log))).unwrap();
        sim.run(100.0).unwrap();

        let times: Vec<f64> = log.borrow().iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![0.0, 10.0, 20.0, 30.0]);
        assert_eq!(sim.now(), SimTime::new(100.0));
    }

    #[test]
    fn test_step_by_step() {
        let sim = Simulation::new();
        sim.schedule_at(5.0, |_| Ok(())).unwrap();
        sim.schedule_at(15.0, |_| Ok(())).unwrap();

        assert_eq!(sim.step().unwrap(), Some(SimTime::new(5.0)));
        assert_eq!(sim.now(), SimTime::new(5.0));
        assert_eq!(sim.step().unwrap(), Some(SimTime::new(15.0)));
        assert_eq!(sim.step().unwrap(), None);
        assert_eq!(sim.now(), SimTime::new(15.0));
    }

    #[test]
    fn test_run_for_is_relative() {
        let sim = Simulation::new();
        for i in 0..100 {
            sim.schedule_at(i as f64, |_| Ok(())).unwrap();
        }

        let summary = sim.run_for(9.5).unwrap();
        assert_eq!(summary.clock_events, 10);
        assert_eq!(sim.pending_events(), 90);

        let summary = sim.run_for(10.0).unwrap();
        assert_eq!(summary.clock_events, 10);
        assert_eq!(sim.now(), SimTime::new(19.5));
    }

    #[test]
    fn test_time_monotonicity() {
        let sim = Simulation::new();
        let times = Rc::new(RefCell::new(Vec::new()));

        for t in [100.0, 50.0, 75.0, 10.0] {
            let times = Rc::clone(&times);
            sim.schedule_at(t, move |sim| {
                times.borrow_mut().push(sim.now().value());
                Ok(())
            })
            .unwrap();
        }
        sim.run(100.0).unwrap();

        assert_eq!(*times.borrow(), vec![10.0, 50.0, 75.0, 100.0]);
    }

    #[test]
    fn test_equal_due_fires_in_registration_order() {
        let sim = Simulation::new();
        let log = log();

        sim.schedule_after(1.0, note(&log, "a")).unwrap();
        sim.schedule_at(1.0, note(&log, "b")).unwrap();
        sim.schedule_after(1.0, note(&log, "c")).unwrap();
        sim.run(2.0).unwrap();

        assert_eq!(*log.borrow(), vec![(1.0, "a"), (1.0, "b"), (1.0, "c")]);
    }

    #[test]
    fn test_absolute_registered_first_fires_first() {
        let sim = Simulation::new();
        let log = log();

        sim.schedule_at(1.0, note(&log, "B")).unwrap();
        sim.schedule_after(1.0, note(&log, "A")).unwrap();
        sim.run(2.0).unwrap();

        assert_eq!(*log.borrow(), vec![(1.0, "B"), (1.0, "A")]);
    }

    #[test]
    fn test_seeded_delays_are_reproducible() {
        fn run(seed: u64) -> Vec<(f64, &'static str)> {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let sim = Simulation::new();
            let log = log();
            let jitter_a: f64 = rng.gen_range(0.0..0.5);
            let jitter_b: f64 = rng.gen_range(0.0..0.5);
            sim.schedule_after(1.0, note(&log, "A")).unwrap();
            sim.schedule_at(1.0, note(&log, "B")).unwrap();
            sim.schedule_after(1.0 + jitter_a, note(&log, "A'")).unwrap();
            sim.schedule_after(1.0 + jitter_b, note(&log, "B'")).unwrap();
            sim.run(2.0).unwrap();
            let out = log.borrow().clone();
            out
        }

        let first = run(7);
        assert_eq!(first, run(7));
        assert_eq!(&first[..2], &[(1.0, "A"), (1.0, "B")]);
    }

    #[test]
    fn test_deterministic_replay() {
        fn trace() -> Vec<TraceEntry> {
            let sim = Simulation::with_config(SimConfig::new().sample_rate(0.5).with_trace()).unwrap();
            sim.schedule_at(5.0, |_| Ok(())).unwrap();
            sim.schedule_at(5.0, |_| Ok(())).unwrap();
            sim.schedule_at(3.0, |_| Ok(())).unwrap();
            sim.schedule_when(|sim| sim.now().value() >= 4.0, |_| Ok(()));
            sim.launch(|p| async move {
                p.delay(2.25).await?;
                Ok(())
            });
            sim.run(6.0).unwrap();
            sim.trace().unwrap()
        }

        let run1 = trace();
        assert!(!run1.is_empty());
        assert_eq!(run1, trace(), "simulation is not deterministic");
    }

    #[test]
    fn test_empty_run_reaches_target() {
        let sim = Simulation::new();
        let summary = sim.run(30.0).unwrap();
        assert_eq!(summary.clock_events, 0);
        assert_eq!(summary.sim_time, SimTime::new(30.0));
        assert_eq!(
            summary.to_string(),
            "run! finished with 0 clock events, 0 sample steps, simulation time: 30.0"
        );
    }

    #[test]
    fn test_cascade_scheduling() {
        fn cascade(count: Rc<Cell<u64>>) -> impl FnOnce(&Simulation) -> ActionResult {
            move |sim| {
                count.set(count.get() + 1);
                if count.get() < 15 {
                    sim.schedule_after(1.0, cascade(Rc::clone(&count)))?;
                }
                Ok(())
            }
        }

        let sim = Simulation::new();
        let count = Rc::new(Cell::new(0));
        sim.schedule_at(0.0, cascade(Rc::clone(&count))).unwrap();
        sim.run(1000.0).unwrap();
        assert_eq!(count.get(), 15);
    }

    #[test]
    fn test_zero_delay_fires_within_instant() {
        let sim = Simulation::new();
        let log = log();
        let inner = note(&log, "inner");
        sim.schedule_at(2.0, move |sim| {
            sim.schedule_after(0.0, inner)?;
            Ok(())
        })
        .unwrap();
        let summary = sim.run(3.0).unwrap();
        assert_eq!(summary.clock_events, 2);
        assert_eq!(*log.borrow(), vec![(2.0, "inner")]);
    }

    #[test]
    fn test_scheduling_errors() {
        let sim = Simulation::new();
        sim.run(10.0).unwrap();

        let err = sim.schedule_at(5.0, |_| Ok(())).unwrap_err();
        assert!(matches!(err, KernelError::PastSchedule { .. }));
        let err = sim.schedule_after(f64::NAN, |_| Ok(())).unwrap_err();
        assert!(matches!(err, KernelError::InvalidTime(_)));
        let err = sim.run(5.0).unwrap_err();
        assert!(matches!(err, KernelError::PastSchedule { .. }));
        // Recoverable: the session keeps working.
        assert!(sim.run(12.0).is_ok());
    }

    #[test]
    fn test_cancel() {
        let sim = Simulation::new();
        let log = log();
        let a = sim.schedule_at(1.0, note(&log, "a")).unwrap();
        sim.schedule_at(2.0, note(&log, "b")).unwrap();

        assert!(sim.cancel(a));
        assert!(!sim.cancel(a));
        sim.run(5.0).unwrap();
        assert_eq!(*log.borrow(), vec![(2.0, "b")]);
    }

    #[test]
    fn test_reentrant_run_is_rejected() {
        let sim = Simulation::new();
        let seen = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&seen);
        sim.schedule_at(1.0, move |sim| {
            *slot.borrow_mut() = Some(matches!(sim.run(5.0), Err(KernelError::AlreadyRunning)));
            assert!(matches!(sim.reset(0.0, 0.0), Err(KernelError::AlreadyRunning)));
            Ok(())
        })
        .unwrap();
        sim.run(2.0).unwrap();
        assert_eq!(*seen.borrow(), Some(true));
        assert!(!sim.is_running());
    }

    #[test]
    fn test_action_failure_needs_reset() {
        let sim = Simulation::new();
        let log = log();
        sim.schedule_at(1.0, |_| Err(anyhow::anyhow!("boom"))).unwrap();
        sim.schedule_at(1.0, note(&log, "after")).unwrap();

        let err = sim.run(5.0).unwrap_err();
        match err {
            KernelError::ActionFailure { at, source } => {
                assert_eq!(at, SimTime::new(1.0));
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
        // The loop does not continue past the failure.
        assert!(log.borrow().is_empty());
        assert!(matches!(sim.run(6.0), Err(KernelError::NeedsReset { .. })));
        assert!(matches!(sim.step(), Err(KernelError::NeedsReset { .. })));

        sim.reset(0.0, 0.0).unwrap();
        assert_eq!(sim.run(5.0).unwrap().clock_events, 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let sim = Simulation::new();
        sim.schedule_at(3.0, |_| Ok(())).unwrap();
        sim.schedule_when(|_| true, |_| Ok(()));
        sim.sample(|_| Ok(()));
        sim.schedule_every(1.0, |_| Ok(())).unwrap();
        sim.launch(|p| async move {
            p.delay(1.0).await?;
            Ok(())
        });
        sim.run(0.5).unwrap();

        let report = sim.reset(0.0, 0.0).unwrap();
        assert_eq!(report.to_string(), "clock reset to t0=0.0, sampling rate dt=0.0.");
        assert_eq!(sim.now(), SimTime::ZERO);
        assert_eq!(sim.pending_events(), 0);
        assert_eq!(sim.pending_conditions(), 0);
        assert_eq!(sim.pending_samplers(), 0);
        assert_eq!(sim.pending_cycles(), 0);
        assert_eq!(sim.process_count(), 0);

        let summary = sim.run(10.0).unwrap();
        assert_eq!(summary.clock_events, 0);
        assert_eq!(summary.sample_steps, 0);
    }

    #[test]
    fn test_reset_installs_epoch_and_rate() {
        let sim = Simulation::new();
        let report = sim.reset(5.0, 0.5).unwrap();
        assert_eq!(report.to_string(), "clock reset to t0=5.0, sampling rate dt=0.5.");
        assert_eq!(sim.epoch(), SimTime::new(5.0));

        let summary = sim.run(7.0).unwrap();
        assert_eq!(summary.sample_steps, 4);
        assert!(sim.reset(-1.0, 0.0).is_err());
        assert!(sim.reset(0.0, -0.1).is_err());
    }

    #[test]
    fn test_sample_ticks_and_samplers() {
        let sim = Simulation::with_config(SimConfig::new().sample_rate(0.5)).unwrap();
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&ticks);
        sim.sample(move |sim| {
            seen.borrow_mut().push(sim.now().value());
            Ok(())
        });
        // A timed event between ticks does not shift the grid.
        sim.schedule_at(0.7, |_| Ok(())).unwrap();

        let summary = sim.run(2.0).unwrap();
        assert_eq!(summary.sample_steps, 4);
        assert_eq!(summary.clock_events, 1);
        assert_eq!(*ticks.borrow(), vec![0.5, 1.0, 1.5, 2.0]);
        assert_eq!(
            summary.to_string(),
            "run! finished with 1 clock events, 4 sample steps, simulation time: 2.0"
        );
    }

    #[test]
    fn test_cancel_sampler_and_change_rate() {
        let sim = Simulation::new();
        let count = Rc::new(Cell::new(0));
        let seen = Rc::clone(&count);
        let id = sim.sample(move |_| {
            seen.set(seen.get() + 1);
            Ok(())
        });

        sim.run(1.0).unwrap();
        assert_eq!(count.get(), 0);

        sim.set_sample_rate(0.25).unwrap();
        sim.run(2.0).unwrap();
        assert_eq!(count.get(), 4);

        assert!(sim.cancel_sampler(id));
        sim.run(3.0).unwrap();
        assert_eq!(count.get(), 4);
        assert!(sim.set_sample_rate(-1.0).is_err());
    }

    #[test]
    fn test_condition_fires_on_next_tick() {
        let sim = Simulation::new();
        let log = log();
        sim.schedule_when(|_| true, note(&log, "cond"));
        assert!(log.borrow().is_empty());

        // The advance to `until` is a tick even with nothing else pending.
        let summary = sim.run(1.0).unwrap();
        assert_eq!(summary.conditions_fired, 1);
        assert_eq!(*log.borrow(), vec![(1.0, "cond")]);
        assert_eq!(sim.pending_conditions(), 0);

        sim.schedule_when(|_| true, note(&log, "after timed"));
        sim.schedule_at(2.0, note(&log, "timed")).unwrap();
        sim.run(3.0).unwrap();
        assert_eq!(
            &log.borrow()[1..],
            &[(2.0, "timed"), (2.0, "after timed")]
        );
    }

    #[test]
    fn test_condition_checked_on_bare_clock_advance() {
        let sim = Simulation::new();
        let log = log();
        sim.schedule_when(|sim| sim.now().value() >= 5.0, note(&log, "cond"));

        sim.run(4.0).unwrap();
        assert!(log.borrow().is_empty());
        let summary = sim.run(100.0).unwrap();
        assert_eq!(summary.conditions_fired, 1);
        assert_eq!(summary.clock_events, 0);
        assert_eq!(*log.borrow(), vec![(100.0, "cond")]);
        assert_eq!(sim.pending_conditions(), 0);
    }

    #[test]
    fn test_run_to_current_time_checks_nothing() {
        let sim = Simulation::new();
        let log = log();
        sim.schedule_when(|_| true, note(&log, "cond"));
        let summary = sim.run(0.0).unwrap();
        assert_eq!(summary.conditions_fired, 0);
        assert_eq!(sim.pending_conditions(), 1);
    }

    #[test]
    fn test_condition_discovered_at_sample_tick() {
        let sim = Simulation::with_config(SimConfig::new().sample_rate(0.5)).unwrap();
        let log = log();
        sim.schedule_when(|sim| sim.now().value() >= 1.2, note(&log, "late"));
        sim.run(3.0).unwrap();
        assert_eq!(*log.borrow(), vec![(1.5, "late")]);
    }

    #[test]
    fn test_condition_sees_state_changed_by_timed_action() {
        let sim = Simulation::new();
        let flag = Rc::new(Cell::new(false));
        let log = log();

        let probe = Rc::clone(&flag);
        sim.schedule_when(move |_| probe.get(), note(&log, "released"));
        let setter = Rc::clone(&flag);
        sim.schedule_at(4.0, move |_| {
            setter.set(true);
            Ok(())
        })
        .unwrap();

        sim.run(10.0).unwrap();
        assert_eq!(*log.borrow(), vec![(4.0, "released")]);
    }

    #[test]
    fn test_cancel_condition() {
        let sim = Simulation::new();
        let log = log();
        let id = sim.schedule_when(|_| true, note(&log, "never"));
        assert!(sim.cancel_condition(id));
        sim.schedule_at(1.0, |_| Ok(())).unwrap();
        sim.run(2.0).unwrap();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_schedule_every() {
        let sim = Simulation::new();
        let times = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&times);
        let id = sim
            .schedule_every(2.0, move |sim| {
                seen.borrow_mut().push(sim.now().value());
                Ok(())
            })
            .unwrap();

        sim.run(7.0).unwrap();
        assert_eq!(*times.borrow(), vec![2.0, 4.0, 6.0]);

        assert!(sim.cancel_cycle(id));
        assert!(!sim.cancel_cycle(id));
        sim.run(20.0).unwrap();
        assert_eq!(times.borrow().len(), 3);
        assert_eq!(sim.pending_events(), 0);
        assert!(sim.schedule_every(0.0, |_| Ok(())).is_err());
    }

    #[test]
    fn test_cycle_cancelled_by_its_own_action() {
        let sim = Simulation::new();
        let count = Rc::new(Cell::new(0));
        let id = Rc::new(Cell::new(None));

        let (seen, own) = (Rc::clone(&count), Rc::clone(&id));
        let cycle = sim
            .schedule_every(1.0, move |sim| {
                seen.set(seen.get() + 1);
                if seen.get() == 3 {
                    if let Some(id) = own.get() {
                        sim.cancel_cycle(id);
                    }
                }
                Ok(())
            })
            .unwrap();
        id.set(Some(cycle));

        sim.run(10.0).unwrap();
        assert_eq!(count.get(), 3);
        assert_eq!(sim.pending_cycles(), 0);
    }

    #[test]
    fn test_stop_ends_run_after_instant() {
        let sim = Simulation::new();
        let log = log();
        sim.schedule_at(2.0, |sim| {
            sim.stop();
            Ok(())
        })
        .unwrap();
        sim.schedule_at(2.0, note(&log, "same instant")).unwrap();
        sim.schedule_at(3.0, note(&log, "later")).unwrap();

        let summary = sim.run(10.0).unwrap();
        assert_eq!(summary.sim_time, SimTime::new(2.0));
        assert_eq!(*log.borrow(), vec![(2.0, "same instant")]);

        sim.run(10.0).unwrap();
        assert_eq!(log.borrow().len(), 2);
    }

    #[cfg(feature = "serialize")]
    #[test]
    fn test_summary_json() {
        let sim = Simulation::new();
        let json = sim.run(1.0).unwrap().to_json().unwrap();
        assert!(json.contains("\"clock_events\":0"));
    }

    proptest! {
        #[test]
        fn prop_dispatch_order_is_due_then_registration(
            dues in prop::collection::vec(0u32..20, 1..40)
        ) {
            let sim = Simulation::new();
            let fired = Rc::new(RefCell::new(Vec::new()));
            for (seq, due) in dues.iter().enumerate() {
                let fired = Rc::clone(&fired);
                let due = f64::from(*due) * 0.5;
                sim.schedule_at(due, move |sim| {
                    fired.borrow_mut().push((sim.now(), seq));
                    Ok(())
                })
                .unwrap();
            }
            sim.run(20.0).unwrap();

            let fired = fired.borrow();
            prop_assert_eq!(fired.len(), dues.len());
            for pair in fired.windows(2) {
                prop_assert!(pair[0] < pair[1], "out of order: {:?}", pair);
            }
            prop_assert_eq!(sim.now(), SimTime::new(20.0));
        }

        #[test]
        fn prop_mixed_timings_tie_break_by_registration(
            entries in prop::collection::vec((0u32..10, any::<bool>()), 1..40)
        ) {
            let sim = Simulation::new();
            sim.run(1.0).unwrap();
            let fired = Rc::new(RefCell::new(Vec::new()));
            for (seq, (offset, absolute)) in entries.iter().enumerate() {
                let fired = Rc::clone(&fired);
                let delay = f64::from(*offset) * 0.5;
                let action = move |sim: &Simulation| -> ActionResult {
                    fired.borrow_mut().push((sim.now(), seq));
                    Ok(())
                };
                if *absolute {
                    sim.schedule_at(1.0 + delay, action).unwrap();
                } else {
                    sim.schedule_after(delay, action).unwrap();
                }
            }
            sim.run(10.0).unwrap();

            let fired = fired.borrow();
            prop_assert_eq!(fired.len(), entries.len());
            for pair in fired.windows(2) {
                prop_assert!(pair[0] < pair[1], "out of order: {:?}", pair);
            }
        }

        #[test]
        fn prop_run_always_reaches_target(targets in prop::collection::vec(0.0f64..50.0, 1..8)) {
            let sim = Simulation::new();
            let mut sorted = targets;
            sorted.sort_by(f64::total_cmp);
            for t in sorted {
                let summary = sim.run(t).unwrap();
                prop_assert_eq!(summary.sim_time, SimTime::new(t));
            }
        }
    }
}
