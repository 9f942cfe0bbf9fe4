//! Failure values that cross rank boundaries.
//!
//! A failure never travels between ranks as a raised error. It is captured
//! into a [`Cause`] on the rank where it happened and shipped inside an
//! [`ErrorEnvelope`] (during a safe collective) or a [`Hop`] (during a
//! point-to-point handoff). Only the receiving rank turns it back into an
//! [`Error`](crate::Error).

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Opaque, serializable description of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[error("rank {origin}: {message}")]
pub struct Cause {
    /// Rank on which the failure was first captured.
    pub origin: usize,
    /// Rendered error chain.
    pub message: String,
}

impl Cause {
    /// Create a cause originating on `origin`.
    pub fn new(origin: usize, message: impl Into<String>) -> Self {
        Cause {
            origin,
            message: message.into(),
        }
    }

    /// Capture a failure raised by a task body, keeping its whole context chain.
    pub fn from_task(origin: usize, err: &anyhow::Error) -> Self {
        Cause::new(origin, format!("{err:#}"))
    }

    /// Capture a crate error observed on `rank`.
    ///
    /// Errors that already carry a cause hand back that cause untouched, so a
    /// failure relayed through several ranks still names the rank it started on.
    pub fn capture(rank: usize, err: &Error) -> Self {
        match err.root_cause() {
            Some(cause) => cause.clone(),
            None => Cause::new(rank, err.to_string()),
        }
    }
}

/// Per-rank failure slot exchanged during the error-check phase of a safe
/// collective. `None` means the local step succeeded.
pub type ErrorEnvelope = Option<Cause>;

/// Message carried by a point-to-point hop between pipeline roles.
///
/// One hop is one message on one tag, so the receiver never has to rely on
/// ordering across tags to tell a failure from a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Hop<T> {
    /// The upstream step succeeded.
    Data(T),
    /// The upstream step failed.
    Failed(Cause),
}

impl<T> Hop<T> {
    /// Build a hop from a local outcome, capturing the failure on `rank`.
    pub fn from_result(rank: usize, outcome: crate::Result<T>) -> Self {
        match outcome {
            Ok(value) => Hop::Data(value),
            Err(err) => Hop::Failed(Cause::capture(rank, &err)),
        }
    }

    /// Unwrap the payload, turning a failure marker from `from` into [`Error::Hop`].
    pub fn into_result(self, from: usize) -> crate::Result<T> {
        match self {
            Hop::Data(value) => Ok(value),
            Hop::Failed(cause) => Err(Error::Hop { from, cause }),
        }
    }

    /// Whether this hop carries a failure marker.
    pub fn is_failed(&self) -> bool {
        matches!(self, Hop::Failed(_))
    }
}
