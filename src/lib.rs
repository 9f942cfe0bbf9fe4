//! # ferropipe
//!
//! Fault-tolerant collectives and a read → process → write pipeline over a
//! fixed group of message-passing ranks.
//!
//! Collective operations are group-synchronous: every rank must enter the
//! same collective in the same order or the group hangs. This crate wraps the
//! risky, user-supplied step of each collective in an error-check exchange
//! so a failure on one rank becomes a failure on every rank before any data
//! collective is attempted, and it routes data between a Reader rank, a
//! Worker subgroup and a Writer rank without ever letting a failure strand a
//! peer in a blocking call.
//!
//! This crate provides:
//! - The [`ProcessGroup`] transport trait and an in-process [`Communicator`]
//!   (one thread per rank, launched by [`Universe`])
//! - [`SafeCollective`]: broadcast, gather and barrier that fail together
//! - [`Topology`]: role assignment and Worker subgroup construction
//! - [`PipelineCoordinator`]: one pipeline iteration per task index, with
//!   per-iteration failure isolation
//!
//! ## Quick Start
//!
//! ```
//! use ferropipe::{Mode, PipelineCoordinator, StridedSum, Topology, Universe};
//!
//! fn main() -> Result<(), ferropipe::Error> {
//!     let universe = Universe::new(4)?;
//!     let totals = universe.run(|world| -> Result<Vec<(usize, i64)>, ferropipe::Error> {
//!         let topology = Topology::new(world, Mode::Parallel)?;
//!         let mut coordinator = PipelineCoordinator::new(topology, StridedSum::new(10));
//!         coordinator.run(0..3);
//!         Ok(coordinator.into_body().written().to_vec())
//!     })?;
//!
//!     // Rank 1 is the Writer in parallel mode.
//!     let written = totals[1].as_ref().map_err(|e| ferropipe::Error::Internal(e.to_string()))?;
//!     assert_eq!(written, &vec![(0, 45), (1, 145), (2, 245)]);
//!     Ok(())
//! }
//! ```
//!
//! ## Modes
//!
//! | Mode       | Reader | Writer | Worker root | Worker group          |
//! |------------|--------|--------|-------------|-----------------------|
//! | standalone | 0      | 0      | 0           | none (direct calls)   |
//! | serial     | 0      | 0      | 0           | every rank            |
//! | parallel   | 0      | 1      | 2           | ranks `2..size`       |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod comm;
mod config;
mod coordinator;
mod envelope;
mod error;
mod mailbox;
mod partition;
mod safe;
mod topology;
mod workload;

pub use comm::{Communicator, ProcessGroup};
pub use config::{FaultPlan, PipelineConfig};
pub use coordinator::{
    PipelineCoordinator, READ_TAG, RunSummary, Stage, TaskBody, TaskContext, WRITE_TAG,
};
pub use envelope::{Cause, ErrorEnvelope, Hop};
pub use error::{CollectiveOp, Error, Result};
pub use partition::{StridePartition, interleave, stride};
pub use safe::SafeCollective;
pub use topology::{Mode, READ_RANK, Role, Topology, WORK_ROOT, WRITE_RANK};
pub use workload::StridedSum;

use mailbox::Mailbox;
use std::panic::{self, AssertUnwindSafe};

/// Handle for a group of in-process ranks.
///
/// A universe launches one OS thread per rank, hands each thread its world
/// [`Communicator`], and collects every rank's result once all of them have
/// returned.
///
/// # Example
///
/// ```
/// use ferropipe::{ProcessGroup, Universe};
///
/// let universe = Universe::new(2).expect("Failed to create universe");
/// let ranks = universe.run(|world| world.rank()).unwrap();
/// assert_eq!(ranks, vec![0, 1]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Universe {
    size: usize,
}

impl Universe {
    /// Create a universe of `size` ranks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `size` is zero.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("a universe needs at least one rank".into()));
        }
        Ok(Universe { size })
    }

    /// Number of ranks this universe launches.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` on every rank and return the results in rank order.
    ///
    /// Each rank runs on a thread named `rank-{r}` inside a `rank` tracing
    /// span. A rank that panics tells every other rank before unwinding, so
    /// peers blocked on it return [`Error::Disconnected`] instead of waiting
    /// forever.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if a rank thread could not be spawned or
    /// panicked.
    pub fn run<R, F>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(Communicator) -> R + Sync,
        R: Send,
    {
        let f = &f;
        let endpoints = mailbox::mesh(self.size);
        let everyone = endpoints
            .first()
            .map(|endpoint| endpoint.outboxes.clone())
            .unwrap_or_default();

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.size);
            for endpoint in endpoints {
                let rank = endpoint.rank;
                let peers = endpoint.outboxes.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || {
                        let span = tracing::info_span!("rank", rank);
                        let _entered = span.enter();
                        let world = Communicator::world(Mailbox::new(endpoint));
                        match panic::catch_unwind(AssertUnwindSafe(|| f(world))) {
                            Ok(result) => result,
                            Err(payload) => {
                                tracing::error!(rank, "rank panicked, aborting peers");
                                mailbox::abort_all(&peers, rank);
                                panic::resume_unwind(payload)
                            }
                        }
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        mailbox::abort_all(&everyone, rank);
                        return Err(Error::Internal(format!("failed to spawn rank {rank}: {e}")));
                    }
                }
            }

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .map_err(|_| Error::Internal(format!("rank {rank} panicked")))
                })
                .collect()
        })
    }
}
