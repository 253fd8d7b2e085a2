//! Common error types for the shelf stack.
//!
//! This module provides shared error types that are used across multiple crates.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur when parsing shared types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An object identifier could not be parsed.
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    /// A class name is not known.
    #[error("unknown class: {0}")]
    UnknownClass(String),

    /// A lifecycle state name is not known.
    #[error("unknown lifecycle state: {0}")]
    UnknownState(String),
}
