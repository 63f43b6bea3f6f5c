//! # Kairos: Discrete-Event Simulation Kernel
//!
//! A single-threaded kernel for discrete-event models. Timed actions,
//! predicate-released actions, cooperative processes written as
//! `async` blocks, and bounded channels all advance on one virtual
//! clock, with a deterministic dispatch order.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │              Simulation                 │ ← session, run loop
//! │  ┌──────────────┐  ┌────────────────┐  │
//! │  │ VirtualClock │  │   EventQueue   │  │ ← (due, id) min-heap
//! │  └──────────────┘  └────────────────┘  │
//! │  ┌──────────────┐  ┌────────────────┐  │
//! │  │  Conditions  │  │ Samplers/Cycles│  │ ← per-tick work
//! │  └──────────────┘  └────────────────┘  │
//! │  ┌──────────────────────────────────┐  │
//! │  │ ProcessTable + ready queue       │  │ ← futures, wakers
//! │  └──────────────────────────────────┘  │
//! └────────────────────────────────────────┘
//!        ▲               ▲              ▲
//!     Channel       StateMachine     Process
//! ```
//!
//! ## Example
//!
//! ```rust
//! use kairos::Simulation;
//!
//! let sim = Simulation::new();
//! let ch = sim.channel(1);
//!
//! let tx = ch.clone();
//! sim.launch(|p| async move {
//!     p.delay(1.0).await?;
//!     tx.put("hello").await;
//!     Ok(())
//! });
//! sim.schedule_when(move |_| ch.is_ready(), |sim| {
//!     assert_eq!(sim.now().value(), 1.0);
//!     Ok(())
//! });
//!
//! let summary = sim.run(2.0).unwrap();
//! assert_eq!(summary.conditions_fired, 1);
//! ```

pub mod channel;
pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod fsm;
pub mod periodic;
pub mod process;
pub mod scheduler;
pub mod simulation;
pub mod time;
pub mod trace;

// Re-exports for convenience.
pub use channel::{Channel, ChannelId, ChannelOp, Put, Take};
pub use condition::{ConditionId, ConditionRegistry, Predicate};
pub use config::SimConfig;
pub use error::{KernelError, KernelResult};
pub use event::{Action, ActionResult, EventId, SequenceGen, TimedEvent, Timing};
pub use fsm::{
    dispatch_after, Dispatch, SharedMachine, StateMachine, Step, Tagged, UndefinedTransition,
};
pub use periodic::{CycleId, Recurring, SamplerId};
pub use process::{Delay, Process, ProcessId, ProcessState, WaitFor, WaitReason};
pub use scheduler::EventQueue;
pub use simulation::{ResetReport, RunSummary, Simulation};
pub use time::{SimTime, VirtualClock};
pub use trace::{TraceEntry, TraceKind};
