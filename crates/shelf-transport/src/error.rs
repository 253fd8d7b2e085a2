//! Error types for the transport crate.

use shelf_core::{PacketId, Status};
use thiserror::Error;

/// Errors raised by packet, queue, pool, and edge operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The packet is still on a terminator queue and cannot be completed.
    #[error("packet {0} is still on a terminator queue")]
    StillQueued(PacketId),

    /// The packet still has attached subpackets.
    #[error("packet {id} has {count} outstanding subpackets")]
    SubpacketsOutstanding {
        /// The master packet.
        id: PacketId,
        /// Number of children still attached.
        count: usize,
    },

    /// A subpacket cannot be attached to a cancelled master.
    #[error("master packet {0} was cancelled")]
    MasterCanceled(PacketId),

    /// The packet has no master to detach from.
    #[error("packet {0} has no master")]
    NoMaster(PacketId),

    /// The packet is still linked to a master, children, or a queue.
    #[error("packet {0} is still attached")]
    PacketAttached(PacketId),

    /// The packet was not allocated from this pool.
    #[error("packet {0} does not belong to this pool")]
    UnknownPacket(PacketId),

    /// Too many completion frames were pushed.
    #[error("completion stack of packet {0} is full")]
    CompletionStackOverflow(PacketId),

    /// The completion token does not name a pending frame.
    #[error("packet {0} has no such completion frame")]
    UnknownCompletion(PacketId),

    /// The edge is not in the ENABLED path state.
    #[error("edge not enabled")]
    EdgeNotEnabled,

    /// The edge is already attached.
    #[error("edge already attached")]
    EdgeAlreadyAttached,

    /// No free packets are left in the pool.
    #[error("insufficient resources")]
    InsufficientResources,

    /// A synchronous request finished with a failure status.
    #[error("request failed with status: {0}")]
    RequestFailed(Status),
}

impl TransportError {
    /// Map this error onto a request status code.
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::EdgeNotEnabled => Status::EdgeNotEnabled,
            Self::InsufficientResources | Self::CompletionStackOverflow(_) => {
                Status::InsufficientResources
            }
            Self::MasterCanceled(_) => Status::Canceled,
            Self::RequestFailed(status) => *status,
            Self::StillQueued(_)
            | Self::SubpacketsOutstanding { .. }
            | Self::NoMaster(_)
            | Self::PacketAttached(_)
            | Self::UnknownPacket(_)
            | Self::UnknownCompletion(_)
            | Self::EdgeAlreadyAttached => Status::GenericFailure,
        }
    }

    /// Check if retrying the operation later may succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::EdgeNotEnabled | Self::InsufficientResources)
    }
}

/// A specialized Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
