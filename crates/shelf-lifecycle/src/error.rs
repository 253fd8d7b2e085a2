//! Error types for the lifecycle engine.

use shelf_core::{ClassId, Status};
use shelf_transport::TransportError;
use thiserror::Error;

use crate::condition::ConditionId;

/// Errors raised by registries and the engine.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The condition id is not registered for the object's class.
    #[error("unknown condition {0}")]
    UnknownCondition(ConditionId),

    /// `clear_current` was called outside a condition.
    #[error("no condition is currently executing")]
    NoCurrentCondition,

    /// A class registry failed verification.
    #[error("invalid registry for class {class}: {reason}")]
    InvalidRegistry {
        /// Class being registered.
        class: ClassId,
        /// What is wrong.
        reason: String,
    },

    /// A single pass kept transitioning without settling.
    #[error("transition loop detected after {0} transitions")]
    TransitionLoop(usize),

    /// The monitor packet could not be prepared.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl LifecycleError {
    /// Map this error onto a request status code.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::UnknownCondition(_) => Status::NoObject,
            Self::Transport(e) => e.status(),
            Self::NoCurrentCondition | Self::InvalidRegistry { .. } | Self::TransitionLoop(_) => {
                Status::GenericFailure
            }
        }
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_retriable())
    }
}

/// A specialized Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;
