//! Error types for Sluice.

use std::sync::Arc;

use thiserror::Error;

use crate::leak::Provenance;

/// Result alias used throughout the crate.
pub type Result<T, E = SluiceError> = std::result::Result<T, E>;

/// Errors surfaced by handles, channels and combinators.
///
/// Protocol violations (double resume, semaphore underflow, a second pending
/// value on one side of a zip) are not represented here: they panic.
#[derive(Debug, Clone, Error)]
pub enum SluiceError {
    /// The operation was cancelled before it produced a value.
    #[error("operation was cancelled")]
    Cancelled,

    /// The handle was dropped without being completed or cancelled and its
    /// leak policy forced a cancellation.
    #[error("handle leaked (created at {0})")]
    Leaked(Provenance),

    /// A bounded channel dropped an action because its buffer was full.
    #[error("channel buffer full, action dropped")]
    EnqueueError,

    /// The channel was already finished when an action was offered.
    #[error("channel is completed")]
    Completed,

    /// `connect` was called on a multicaster that is already connected.
    #[error("multicaster is already connected")]
    AlreadyConnected,

    /// A control operation required a connected multicaster.
    #[error("multicaster is not connected")]
    NotConnected,

    /// An upstream or downstream failure.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl SluiceError {
    /// Wrap an arbitrary message as a stream failure.
    pub fn failure(message: impl std::fmt::Display) -> Self {
        Self::Failed(Arc::new(anyhow::anyhow!("{}", message)))
    }

    /// Returns true for [`SluiceError::Cancelled`] and [`SluiceError::Leaked`],
    /// the two outcomes produced by cancellation rather than by a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Leaked(_))
    }
}

impl From<anyhow::Error> for SluiceError {
    fn from(error: anyhow::Error) -> Self {
        Self::Failed(Arc::new(error))
    }
}
