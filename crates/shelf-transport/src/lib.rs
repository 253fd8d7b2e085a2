//! Request transport for the shelf object-execution stack.
//!
//! This crate carries asynchronous work between managed objects:
//!
//! - **Packets**: shared request handles with a payload stack, a completion
//!   stack, subpacket linkage, and cancellation
//! - **Pool**: bounded packet allocation
//! - **Terminator queue**: per-object registry of outstanding requests
//! - **Edges**: client/server bindings with path state and path attributes
//!
//! # Example
//!
//! ```
//! use shelf_core::Status;
//! use shelf_transport::{Completion, PacketPool};
//!
//! let pool = PacketPool::new(4);
//! let master = pool.allocate().unwrap();
//! let child = pool.allocate().unwrap();
//!
//! master.add_subpacket(&child).unwrap();
//! child
//!     .push_completion(|child, status| {
//!         let master = child.master().unwrap();
//!         child.remove_subpacket().unwrap();
//!         master.set_status(status, 0);
//!         master.complete().unwrap();
//!         Completion::Continue
//!     })
//!     .unwrap();
//!
//! child.complete().unwrap();
//! assert_eq!(master.status(), Status::Ok);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod edge;
pub mod error;
pub mod packet;
pub mod payload;
pub mod pool;
pub mod terminator;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use edge::{
    ControlSender, DiscoveryEdge, EdgeBinding, EdgeEvent, EdgeEventKind, EdgeListener,
    PathAttributes, PathState,
};
pub use error::{Result, TransportError};
pub use packet::{
    CancelFn, Completion, CompletionFn, CompletionToken, Packet, PacketFlags, PacketState,
    MAX_COMPLETION_DEPTH,
};
pub use payload::{
    ControlOperation, ControlRequest, DiscoveryOpcode, DiscoveryOperation, DiscoveryResponse,
    Operation, Payload,
};
pub use pool::PacketPool;
pub use terminator::TerminatorQueue;
