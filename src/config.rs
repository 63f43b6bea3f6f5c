//! Session configuration.

use crate::error::KernelResult;
use crate::time::{check_duration, SimTime};

/// Settings a [`Simulation`](crate::Simulation) is created with.
///
/// ```rust
/// use kairos::{SimConfig, Simulation};
///
/// let config = SimConfig::new().sample_rate(0.5).with_trace();
/// let sim = Simulation::with_config(config).unwrap();
/// assert_eq!(sim.sample_rate(), 0.5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct SimConfig {
    /// Start time of the clock; `reset` rewinds to a new epoch.
    pub epoch: SimTime,
    /// Sampling interval. `0.0` disables sample ticks.
    pub sample_rate: f64,
    /// Record a [`TraceEntry`](crate::TraceEntry) for every dispatch.
    pub trace: bool,
}

impl SimConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(mut self, epoch: impl Into<SimTime>) -> Self {
        self.epoch = epoch.into();
        self
    }

    pub fn sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_trace(mut self) -> Self {
        self.trace = true;
        self
    }

    /// Check that the epoch and sampling interval are usable.
    pub fn validate(&self) -> KernelResult<()> {
        self.epoch.validated()?;
        check_duration(self.sample_rate)?;
        Ok(())
    }

    /// Parse a configuration from JSON, e.g. `{"sample_rate": 0.1}`.
    #[cfg(feature = "serialize")]
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            epoch: SimTime::ZERO,
            sample_rate: 0.0,
            trace: false,
        }
    }
}
