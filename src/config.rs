//! Run configuration.
//!
//! Defaults can be overridden from the environment before command-line
//! flags are applied. Unset variables leave the current value alone; a set
//! but malformed variable is a configuration error.
//!
//! # Environment Variables
//!
//! | Field | Variable | Description |
//! |-------|----------|-------------|
//! | `ranks` | `FERROPIPE_RANKS` | Number of ranks to launch |
//! | `mode` | `FERROPIPE_MODE` | `serial` or `parallel` |
//! | `iterations` | `FERROPIPE_ITERATIONS` | Task iterations to run |
//! | `chunk` | `FERROPIPE_CHUNK` | Elements loaded per iteration |

use crate::error::{Error, Result};
use crate::topology::Mode;
use std::env;
use std::str::FromStr;

/// Variable overriding [`PipelineConfig::ranks`].
pub const RANKS_VAR: &str = "FERROPIPE_RANKS";
/// Variable overriding [`PipelineConfig::mode`].
pub const MODE_VAR: &str = "FERROPIPE_MODE";
/// Variable overriding [`PipelineConfig::iterations`].
pub const ITERATIONS_VAR: &str = "FERROPIPE_ITERATIONS";
/// Variable overriding [`PipelineConfig::chunk`].
pub const CHUNK_VAR: &str = "FERROPIPE_CHUNK";

/// Iterations at which injected failures fire. `None` disables a fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Fail the load step on the Reader.
    pub load: Option<usize>,
    /// Fail the process step on the last rank of the group.
    pub process: Option<usize>,
    /// Fail the write step on the Writer.
    pub write: Option<usize>,
}

impl FaultPlan {
    /// The iteration the `--trigger-*` switches fire at.
    pub const TRIGGER_INDEX: usize = 1;

    /// No injected failures.
    pub fn none() -> Self {
        FaultPlan::default()
    }

    /// Fault plan for the three `--trigger-*` switches.
    pub fn from_triggers(load: bool, process: bool, write: bool) -> Self {
        let at = |on: bool| on.then_some(Self::TRIGGER_INDEX);
        FaultPlan {
            load: at(load),
            process: at(process),
            write: at(write),
        }
    }

    /// Whether any fault is armed.
    pub fn is_armed(&self) -> bool {
        self.load.is_some() || self.process.is_some() || self.write.is_some()
    }
}

/// Everything a driver needs to launch a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of ranks.
    pub ranks: usize,
    /// Role layout.
    pub mode: Mode,
    /// Number of task iterations.
    pub iterations: usize,
    /// Elements loaded per iteration.
    pub chunk: usize,
    /// Injected failures.
    pub faults: FaultPlan,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            ranks: 1,
            mode: Mode::Serial,
            iterations: 3,
            chunk: 10,
            faults: FaultPlan::none(),
        }
    }
}

fn var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

impl PipelineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        PipelineConfig::default().with_env_overrides()
    }

    /// Apply any `FERROPIPE_*` variables that are set.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(ranks) = var(RANKS_VAR)? {
            self.ranks = ranks;
        }
        if let Some(mode) = var(MODE_VAR)? {
            self.mode = mode;
        }
        if let Some(iterations) = var(ITERATIONS_VAR)? {
            self.iterations = iterations;
        }
        if let Some(chunk) = var(CHUNK_VAR)? {
            self.chunk = chunk;
        }
        Ok(self)
    }

    /// Whether this run needs no transport at all.
    pub fn is_standalone(&self) -> bool {
        self.ranks == 1 && self.mode == Mode::Serial
    }

    /// Reject layouts that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.ranks == 0 {
            return Err(Error::Config("ranks must be at least 1".into()));
        }
        if self.ranks < self.mode.min_ranks() {
            return Err(Error::Config(format!(
                "{} mode needs at least {} ranks, got {}",
                self.mode,
                self.mode.min_ranks(),
                self.ranks
            )));
        }
        let span = self
            .iterations
            .checked_mul(self.chunk)
            .and_then(|n| i64::try_from(n).ok());
        if span.is_none() {
            return Err(Error::Config(format!(
                "{} iterations of {} numbers do not fit in i64",
                self.iterations, self.chunk
            )));
        }
        Ok(())
    }

    /// Number of ranks doing process work.
    pub fn workers(&self) -> usize {
        match self.mode {
            Mode::Serial => self.ranks,
            Mode::Parallel => self.ranks.saturating_sub(2),
        }
    }
}
