//! Bounded packet allocator.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use shelf_core::PacketId;

use crate::error::{Result, TransportError};
use crate::packet::Packet;

/// Hands out packets up to a fixed capacity.
///
/// Allocation failures are reported, never retried; retry policy belongs to
/// whoever asked for the packet.
#[derive(Debug)]
pub struct PacketPool {
    capacity: usize,
    outstanding: Mutex<HashSet<PacketId>>,
    next_id: AtomicU64,
}

impl PacketPool {
    /// Create a pool that allows `capacity` packets in flight.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            outstanding: Mutex::new(HashSet::with_capacity(capacity)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh packet.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientResources` when the pool is exhausted.
    pub fn allocate(&self) -> Result<Packet> {
        let mut outstanding = self.outstanding.lock();
        if outstanding.len() >= self.capacity {
            tracing::warn!(capacity = self.capacity, "packet pool exhausted");
            return Err(TransportError::InsufficientResources);
        }
        let id = PacketId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        outstanding.insert(id);
        Ok(Packet::new(id))
    }

    /// Return a packet to the pool.
    ///
    /// # Errors
    ///
    /// Returns `PacketAttached` if the packet still has a master, children,
    /// or queue membership, and `UnknownPacket` if it was not allocated here
    /// or was already released.
    pub fn release(&self, packet: &Packet) -> Result<()> {
        if packet.is_attached() {
            tracing::error!(packet_id = %packet.id(), "releasing an attached packet");
            return Err(TransportError::PacketAttached(packet.id()));
        }
        if self.outstanding.lock().remove(&packet.id()) {
            Ok(())
        } else {
            Err(TransportError::UnknownPacket(packet.id()))
        }
    }

    /// Pool capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of packets currently allocated.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.outstanding.lock().len()
    }
}
