//! Core types and utilities for the shelf object-execution stack.
//!
//! This crate provides the foundational types used by every other shelf crate:
//!
//! - **Identifiers**: object, class, and packet identifiers
//! - **Lifecycle states**: the seven states every managed object moves through
//! - **Status codes**: the status + qualifier pair carried by every request
//! - **Error types**: parsing errors shared across crates
//!
//! # Example
//!
//! ```
//! use shelf_core::{ClassId, LifecycleState, ObjectId, Status};
//!
//! let id: ObjectId = "17".parse().unwrap();
//! assert!(id.is_valid());
//!
//! let class: ClassId = "enclosure".parse().unwrap();
//! assert_eq!(class, ClassId::Enclosure);
//!
//! assert!(LifecycleState::Destroy.is_terminal());
//! assert!(Status::Ok.is_ok());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod state;
pub mod status;

pub use error::{CoreError, Result};
pub use ids::{ClassId, ObjectId, PacketId};
pub use state::LifecycleState;
pub use status::{DeathReason, Status};
