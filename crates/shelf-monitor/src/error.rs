//! Error types for the monitor service.

use shelf_core::Status;
use shelf_topology::{AttributeError, TopologyError};
use thiserror::Error;

/// Errors raised while configuring or running the monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Reading a configuration file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration file is not valid JSON for its type.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment variable holds a value that does not parse.
    #[error("invalid value {value:?} for {name}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },

    /// Attribute store error while applying a scenario.
    #[error("attribute store error: {0}")]
    Attribute(#[from] AttributeError),

    /// Topology error.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
}

impl MonitorError {
    /// Map this error onto a request status code.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::Topology(e) => e.status(),
            Self::Attribute(AttributeError::NotFound(_)) => Status::NoObject,
            Self::Io(_) | Self::Parse(_) | Self::InvalidEnv { .. } | Self::Attribute(_) => {
                Status::GenericFailure
            }
        }
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Topology(e) => e.is_retriable(),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_core::ObjectId;

    #[test]
    fn topology_errors_keep_their_status() {
        let err = MonitorError::from(TopologyError::ObjectNotFound(ObjectId::new(3)));
        assert_eq!(err.status(), Status::NoObject);
        assert!(!err.is_retriable());
    }

    #[test]
    fn env_error_names_the_variable() {
        let err = MonitorError::InvalidEnv {
            name: "SHELF_SLOT_POLL_MS",
            value: "soon".to_string(),
        };
        assert_eq!(err.to_string(), "invalid value \"soon\" for SHELF_SLOT_POLL_MS");
        assert_eq!(err.status(), Status::GenericFailure);
    }
}
