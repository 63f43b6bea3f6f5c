//! Dispatch trace.
//!
//! When enabled through [`SimConfig`](crate::SimConfig), the session
//! appends one entry per unit of work it dispatches. Two runs built the
//! same way must produce identical traces.

use crate::condition::ConditionId;
use crate::event::EventId;
use crate::process::ProcessId;
use crate::time::SimTime;

/// What the dispatcher did.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum TraceKind {
    /// A timed event fired.
    Timed(EventId),
    /// A conditional event fired.
    Condition(ConditionId),
    /// A sample tick ran.
    Sample,
    /// A process was polled.
    Resumed(ProcessId),
    /// A process body returned.
    Terminated(ProcessId),
    /// A process was killed from outside.
    Killed(ProcessId),
}

/// A single recorded dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceEntry {
    pub time: SimTime,
    pub kind: TraceKind,
}

impl std::fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TraceKind::Timed(id) => write!(f, "t={} fire {}", self.time, id),
            TraceKind::Condition(id) => write!(f, "t={} fire {}", self.time, id),
            TraceKind::Sample => write!(f, "t={} sample", self.time),
            TraceKind::Resumed(pid) => write!(f, "t={} resume {}", self.time, pid),
            TraceKind::Terminated(pid) => write!(f, "t={} exit {}", self.time, pid),
            TraceKind::Killed(pid) => write!(f, "t={} kill {}", self.time, pid),
        }
    }
}
