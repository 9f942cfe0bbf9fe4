//! Collectives that fail together.
//!
//! Each operation first runs the caller's step, then exchanges an
//! [`ErrorEnvelope`] over a collective that cannot fail for task reasons, and
//! only then issues the data collective. If any envelope is present every
//! rank returns [`Error::Collective`] carrying the same root cause, and no
//! rank enters the data collective.

use crate::comm::ProcessGroup;
use crate::envelope::{Cause, ErrorEnvelope};
use crate::error::{CollectiveOp, Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

/// Failure-synchronizing wrapper around a [`ProcessGroup`].
///
/// On a single-member group no envelope exchange or collective is issued;
/// the step runs as a plain local call and its failure is reported as
/// [`Error::Task`].
///
/// # Example
///
/// ```
/// use ferropipe::{Error, ProcessGroup, SafeCollective, Universe};
///
/// let universe = Universe::new(3).unwrap();
/// let outcomes = universe
///     .run(|world| {
///         let safe = SafeCollective::new(&world);
///         let rank = world.rank();
///         safe.gather(0, || {
///             if rank == 2 {
///                 return Err(Error::Internal("error performing work".into()));
///             }
///             Ok(rank)
///         })
///         .map_err(|e| e.is_synchronized())
///     })
///     .unwrap();
/// // Every rank saw the failure, none of them gathered.
/// assert_eq!(outcomes, vec![Err(true), Err(true), Err(true)]);
/// ```
pub struct SafeCollective<'a, C: ProcessGroup> {
    comm: &'a C,
}

impl<'a, C: ProcessGroup> SafeCollective<'a, C> {
    /// Wrap `comm`.
    pub fn new(comm: &'a C) -> Self {
        SafeCollective { comm }
    }

    /// The wrapped group.
    pub fn group(&self) -> &'a C {
        self.comm
    }

    fn is_local(&self) -> bool {
        self.comm.size() == 1
    }

    fn capture<T>(&self, outcome: Result<T>) -> (Option<T>, ErrorEnvelope) {
        match outcome {
            Ok(value) => (Some(value), None),
            Err(err) => {
                debug!(rank = self.comm.rank(), error = %err, "local step failed");
                (None, Some(Cause::capture(self.comm.rank(), &err)))
            }
        }
    }

    fn raise(&self, op: CollectiveOp, cause: Cause) -> Error {
        debug!(
            rank = self.comm.rank(),
            %op,
            origin = cause.origin,
            "failure observed by the whole group"
        );
        Error::Collective { op, cause }
    }

    /// Exchange every rank's envelope and fail on the first present one, in rank order.
    fn check_all(&self, op: CollectiveOp, envelope: &ErrorEnvelope) -> Result<()> {
        trace!(rank = self.comm.rank(), %op, "exchanging error envelopes");
        let envelopes: Vec<ErrorEnvelope> = self.comm.all_gather(envelope)?;
        match envelopes.into_iter().flatten().next() {
            Some(cause) => Err(self.raise(op, cause)),
            None => Ok(()),
        }
    }

    /// Broadcast the value produced by `root_step`, which only `root` runs.
    ///
    /// The root's outcome is broadcast first as an envelope. On failure every
    /// rank returns [`Error::Collective`] and the data broadcast is skipped.
    pub fn broadcast<T, F>(&self, root: usize, root_step: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        Error::check_rank(root, self.comm.size())?;
        if self.is_local() {
            return root_step().map_err(|e| Error::Task(Cause::capture(self.comm.rank(), &e)));
        }

        let (mut value, mut envelope) = if self.comm.rank() == root {
            self.capture(root_step())
        } else {
            (None, None)
        };

        trace!(rank = self.comm.rank(), root, "broadcasting error envelope");
        self.comm.broadcast(&mut envelope, root)?;
        if let Some(cause) = envelope {
            return Err(self.raise(CollectiveOp::Broadcast, cause));
        }

        self.comm.broadcast(&mut value, root)?;
        value.ok_or_else(|| Error::Internal("broadcast root sent no value".into()))
    }

    /// Run `step` on every rank and gather the results to `root`, in rank order.
    ///
    /// Returns `Some` on root and `None` elsewhere. If any rank's step fails,
    /// every rank returns [`Error::Collective`] and nothing is gathered.
    pub fn gather<T, F>(&self, root: usize, step: F) -> Result<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        Error::check_rank(root, self.comm.size())?;
        if self.is_local() {
            return step()
                .map(|value| Some(vec![value]))
                .map_err(|e| Error::Task(Cause::capture(self.comm.rank(), &e)));
        }

        let (value, envelope) = self.capture(step());
        self.check_all(CollectiveOp::Gather, &envelope)?;

        let value = value.ok_or_else(|| Error::Internal("gather step produced no value".into()))?;
        self.comm.gather(&value, root)
    }

    /// Run `step` on every rank, then synchronize.
    ///
    /// If any rank's step fails, every rank returns [`Error::Collective`] and
    /// the barrier is skipped.
    pub fn barrier<F>(&self, step: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.is_local() {
            return step().map_err(|e| Error::Task(Cause::capture(self.comm.rank(), &e)));
        }

        let (_, envelope) = self.capture(step());
        self.check_all(CollectiveOp::Barrier, &envelope)?;
        self.comm.barrier()
    }
}
