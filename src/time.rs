//! Virtual time for the simulation kernel.
//!
//! Simulated time has no relation to `std::time`. It only advances when
//! the dispatcher moves the [`VirtualClock`] to the next due instant.

use std::cmp::Ordering;

use crate::error::{KernelError, KernelResult};

/// A point in simulated time.
///
/// Wraps an `f64` and orders it with `total_cmp`, so it can key the
/// event heap. Values entering the kernel through the public API are
/// validated to be finite and non-negative.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SimTime(f64);

impl SimTime {
    /// The zero-point of simulation time.
    pub const ZERO: SimTime = SimTime(0.0);

    /// Create a `SimTime` from a raw value without validation.
    #[inline]
    pub fn new(t: f64) -> Self {
        // `+ 0.0` folds -0.0 into 0.0 so equality agrees with `total_cmp`.
        SimTime(t + 0.0)
    }

    /// Create a `SimTime`, rejecting negative and non-finite values.
    pub fn checked(t: f64) -> KernelResult<Self> {
        if t.is_finite() && t >= 0.0 {
            Ok(SimTime::new(t))
        } else {
            Err(KernelError::InvalidTime(t))
        }
    }

    /// Re-validate a value that may have been built with [`SimTime::new`].
    pub fn validated(self) -> KernelResult<Self> {
        SimTime::checked(self.0)
    }

    /// Return the raw value.
    #[inline]
    pub fn value(self) -> f64 {
        self.0
    }

    /// The absolute time `delay` after `self`.
    pub fn plus(self, delay: f64) -> KernelResult<SimTime> {
        check_duration(delay)?;
        SimTime::checked(self.0 + delay)
    }
}

/// Validate a relative delay or interval.
pub(crate) fn check_duration(d: f64) -> KernelResult<f64> {
    if d.is_finite() && d >= 0.0 {
        Ok(d)
    } else {
        Err(KernelError::InvalidTime(d))
    }
}

impl PartialEq for SimTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SimTime {}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<f64> for SimTime {
    fn from(t: f64) -> Self {
        SimTime::new(t)
    }
}

/// Shortest round-trip form that always shows a decimal point: `30.0`, `0.1`.
impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

// ── Virtual clock ─────────────────────────────────────────────────────

/// The session clock: current time plus the sampling grid.
///
/// Only the dispatcher moves it. Sample ticks lie on the grid
/// `anchor + k * sample_rate`, so they stay periodic even when timed
/// events fall between them.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: SimTime,
    epoch: SimTime,
    sample_rate: f64,
    anchor: SimTime,
    samples: u64,
}

impl VirtualClock {
    /// A clock at `epoch` with the given sampling interval (0 disables sampling).
    pub fn new(epoch: SimTime, sample_rate: f64) -> Self {
        VirtualClock {
            now: epoch,
            epoch,
            sample_rate,
            anchor: epoch,
            samples: 0,
        }
    }

    #[inline]
    pub fn now(&self) -> SimTime {
        self.now
    }

    #[inline]
    pub fn epoch(&self) -> SimTime {
        self.epoch
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Move the clock forward to `t`.
    pub fn advance_to(&mut self, t: SimTime) -> KernelResult<()> {
        if t < self.now {
            return Err(KernelError::InvalidAdvance {
                from: self.now,
                to: t,
            });
        }
        self.now = t;
        Ok(())
    }

    /// Rewind to `epoch` and install a new sampling interval.
    pub fn reset(&mut self, epoch: SimTime, sample_rate: f64) {
        *self = VirtualClock::new(epoch, sample_rate);
    }

    /// Change the sampling interval; the grid restarts at `now`.
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.anchor = self.now;
        self.samples = 0;
    }

    /// The next sampling instant, or `None` when sampling is disabled.
    pub fn next_sample(&self) -> Option<SimTime> {
        (self.sample_rate > 0.0).then(|| {
            SimTime::new(self.anchor.0 + (self.samples + 1) as f64 * self.sample_rate)
        })
    }

    /// Record that a sample tick happened at the current time.
    pub(crate) fn mark_sampled(&mut self) {
        self.samples += 1;
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        VirtualClock::new(SimTime::ZERO, 0.0)
    }
}
