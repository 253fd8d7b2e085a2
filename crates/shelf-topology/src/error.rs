//! Error types for the topology layer.

use shelf_core::{ClassId, ObjectId, Status};
use shelf_lifecycle::LifecycleError;
use shelf_transport::{PathState, TransportError};
use thiserror::Error;

use crate::store::AttributeError;

/// Errors raised by the topology and its object classes.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// No object with this id exists.
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// The object exists but is of another class.
    #[error("object {id} is not a {expected}")]
    WrongClass {
        /// Object looked up.
        id: ObjectId,
        /// Class the caller needed.
        expected: ClassId,
    },

    /// No condition with this name is registered for the object's class.
    #[error("unknown condition: {0}")]
    UnknownCondition(String),

    /// An edge event carried a path state no handler understands.
    #[error("unexpected path state {0}")]
    UnexpectedPathState(PathState),

    /// A control request was refused.
    #[error("request failed with {0}")]
    RequestFailed(Status),

    /// Attribute store error.
    #[error("attribute store error: {0}")]
    Attribute(#[from] AttributeError),

    /// Lifecycle engine error.
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl TopologyError {
    /// Map this error onto a request status code.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::ObjectNotFound(_)
            | Self::UnknownCondition(_)
            | Self::Attribute(AttributeError::NotFound(_)) => Status::NoObject,
            Self::WrongClass { .. }
            | Self::UnexpectedPathState(_)
            | Self::Attribute(AttributeError::Failed(_)) => Status::GenericFailure,
            Self::RequestFailed(status) => *status,
            Self::Lifecycle(e) => e.status(),
            Self::Transport(e) => e.status(),
        }
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Lifecycle(e) => e.is_retriable(),
            Self::Transport(e) => e.is_retriable(),
            Self::RequestFailed(status) => {
                matches!(status, Status::Busy | Status::EdgeNotEnabled)
            }
            _ => false,
        }
    }
}

/// A specialized Result type for topology operations.
pub type Result<T> = std::result::Result<T, TopologyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(
            TopologyError::ObjectNotFound(ObjectId::new(1)).status(),
            Status::NoObject
        );
        assert_eq!(
            TopologyError::Transport(TransportError::EdgeNotEnabled).status(),
            Status::EdgeNotEnabled
        );
        assert_eq!(
            TopologyError::RequestFailed(Status::Busy).status(),
            Status::Busy
        );
    }

    #[test]
    fn retriable_errors() {
        assert!(TopologyError::Transport(TransportError::InsufficientResources).is_retriable());
        assert!(!TopologyError::ObjectNotFound(ObjectId::new(1)).is_retriable());
    }
}
