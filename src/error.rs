//! Error types for ferropipe

use crate::envelope::Cause;
use thiserror::Error;

/// Result type for group and pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// The collective a synchronized failure was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectiveOp {
    /// Safe broadcast
    Broadcast,
    /// Safe gather
    Gather,
    /// Safe barrier
    Barrier,
}

impl std::fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CollectiveOp::Broadcast => "broadcast",
            CollectiveOp::Gather => "gather",
            CollectiveOp::Barrier => "barrier",
        };
        f.write_str(name)
    }
}

/// Error types for group and pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// A load/process/write step failed on this rank
    #[error("task failed: {0}")]
    Task(Cause),

    /// A failure on some rank was observed by the whole group before the collective ran
    #[error("group-wide failure in {op}: {cause}")]
    Collective {
        /// The safe collective that detected the failure
        op: CollectiveOp,
        /// Root cause, identical on every rank of the group
        cause: Cause,
    },

    /// A failure marker arrived over a point-to-point hop
    #[error("hop from rank {from} carried a failure: {cause}")]
    Hop {
        /// Rank that forwarded the marker
        from: usize,
        /// Root cause carried by the marker
        cause: Cause,
    },

    /// Topology or run configuration is not usable
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid rank specified
    #[error("Invalid rank: {rank} (group size {size})")]
    InvalidRank {
        /// The offending rank
        rank: usize,
        /// Size of the group it was used in
        size: usize,
    },

    /// User tags must be non-negative
    #[error("Invalid tag: {0}")]
    InvalidTag(i32),

    /// The destination rank's inbox is gone
    #[error("rank {0} is disconnected")]
    Disconnected(usize),

    /// A value could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The root cause carried by a task, collective or hop failure.
    pub fn root_cause(&self) -> Option<&Cause> {
        match self {
            Error::Task(cause) | Error::Collective { cause, .. } | Error::Hop { cause, .. } => {
                Some(cause)
            }
            _ => None,
        }
    }

    /// Whether this failure was agreed on by the whole group.
    pub fn is_synchronized(&self) -> bool {
        matches!(self, Error::Collective { .. })
    }

    /// Check that `rank` addresses a member of a group of `size` ranks.
    pub fn check_rank(rank: usize, size: usize) -> Result<()> {
        if rank < size {
            Ok(())
        } else {
            Err(Error::InvalidRank { rank, size })
        }
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(err: bincode::error::EncodeError) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(err: bincode::error::DecodeError) -> Self {
        Error::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_is_shared_by_failure_kinds() {
        let cause = Cause::new(3, "boom");
        let errors = [
            Error::Task(cause.clone()),
            Error::Collective {
                op: CollectiveOp::Gather,
                cause: cause.clone(),
            },
            Error::Hop {
                from: 2,
                cause: cause.clone(),
            },
        ];
        for err in &errors {
            assert_eq!(err.root_cause(), Some(&cause));
        }
        assert!(Error::Config("x".into()).root_cause().is_none());
    }

    #[test]
    fn only_collective_failures_are_synchronized() {
        let cause = Cause::new(0, "boom");
        assert!(
            Error::Collective {
                op: CollectiveOp::Broadcast,
                cause: cause.clone()
            }
            .is_synchronized()
        );
        assert!(!Error::Task(cause).is_synchronized());
    }

    #[test]
    fn check_rank_bounds() {
        assert!(Error::check_rank(0, 1).is_ok());
        assert!(Error::check_rank(3, 4).is_ok());
        assert!(matches!(
            Error::check_rank(4, 4),
            Err(Error::InvalidRank { rank: 4, size: 4 })
        ));
    }

    #[test]
    fn messages_name_the_operation() {
        let err = Error::Collective {
            op: CollectiveOp::Barrier,
            cause: Cause::new(1, "say hello failed"),
        };
        assert_eq!(
            err.to_string(),
            "group-wide failure in barrier: rank 1: say hello failed"
        );
    }
}
