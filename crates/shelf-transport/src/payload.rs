//! Typed request payloads.
//!
//! A payload is a stack of operations. A handler that needs working context
//! pushes its own operation, and pops it again before handing the request
//! back, so the operation on top is always the one the current holder owns.

use std::sync::Arc;

use shelf_core::{ObjectId, Status};

use crate::edge::{DiscoveryEdge, EdgeBinding};

/// Control requests addressed directly to an object.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    /// Attach the client's edge to the server at `binding.server_index`.
    AttachEdge {
        /// The client-owned edge.
        edge: Arc<DiscoveryEdge>,
        /// Client and server identities for the new binding.
        binding: EdgeBinding,
    },
    /// Remove the edge described by `binding` from the server.
    DetachEdge {
        /// The binding being torn down.
        binding: EdgeBinding,
    },
}

impl ControlRequest {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AttachEdge { .. } => "attach_edge",
            Self::DetachEdge { .. } => "detach_edge",
        }
    }
}

/// A control operation and its result.
#[derive(Debug, Clone)]
pub struct ControlOperation {
    /// The request.
    pub request: ControlRequest,
    /// Result reported by the handler.
    pub status: Status,
}

impl ControlOperation {
    /// Build a control operation with an OK status.
    #[must_use]
    pub const fn new(request: ControlRequest) -> Self {
        Self {
            request,
            status: Status::Ok,
        }
    }
}

/// Requests that travel over discovery edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryOpcode {
    /// Ask the port at the root of the tree for its object id.
    GetPortObjectId,
    /// Power on the slot the request arrived from.
    PowerOn,
    /// Clear a bypass on the slot the request arrived from.
    Unbypass,
}

/// Responses to discovery operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryResponse {
    /// Object id of the port at the root of the discovery tree.
    PortObjectId(ObjectId),
}

/// A discovery operation and its result.
#[derive(Debug, Clone)]
pub struct DiscoveryOperation {
    /// What is being asked.
    pub opcode: DiscoveryOpcode,
    /// Result reported by the handler.
    pub status: Status,
    /// Optional response data.
    pub response: Option<DiscoveryResponse>,
}

impl DiscoveryOperation {
    /// Build a discovery operation with an OK status and no response.
    #[must_use]
    pub const fn new(opcode: DiscoveryOpcode) -> Self {
        Self {
            opcode,
            status: Status::Ok,
            response: None,
        }
    }
}

/// One typed operation on the payload stack.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Control operation.
    Control(ControlOperation),
    /// Discovery operation.
    Discovery(DiscoveryOperation),
}

/// Stack of operations owned by a packet.
#[derive(Debug, Default)]
pub struct Payload {
    operations: Vec<Operation>,
}

impl Payload {
    /// Push a new operation; it becomes the current one.
    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Release the current operation.
    pub fn pop(&mut self) -> Option<Operation> {
        self.operations.pop()
    }

    /// The current operation.
    #[must_use]
    pub fn current(&self) -> Option<&Operation> {
        self.operations.last()
    }

    /// The current operation, mutably.
    pub fn current_mut(&mut self) -> Option<&mut Operation> {
        self.operations.last_mut()
    }

    /// Number of stacked operations.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.operations.len()
    }

    /// Release every operation.
    pub fn clear(&mut self) {
        self.operations.clear();
    }
}
