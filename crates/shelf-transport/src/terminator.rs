//! Per-object registry of outstanding requests.
//!
//! A request is added while an object waits on it and removed before the
//! object completes it. Teardown walks the queue and cancels whatever is
//! still there. Cancellation races ordinary completion, so every operation
//! here is an idempotent no-op when the request already left.

use parking_lot::Mutex;

use crate::packet::Packet;

/// Outstanding requests of one object.
#[derive(Debug, Default)]
pub struct TerminatorQueue {
    packets: Mutex<Vec<Packet>>,
}

impl TerminatorQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `packet` on the queue.
    pub fn add(&self, packet: &Packet) {
        let mut packets = self.packets.lock();
        if packets.iter().any(|p| p.same(packet)) {
            return;
        }
        packet.set_on_queue(true);
        packets.push(packet.clone());
    }

    /// Take `packet` off the queue.
    ///
    /// Returns false if it was not queued.
    pub fn remove(&self, packet: &Packet) -> bool {
        let mut packets = self.packets.lock();
        let Some(position) = packets.iter().position(|p| p.same(packet)) else {
            return false;
        };
        packets.swap_remove(position);
        packet.set_on_queue(false);
        true
    }

    /// Returns true if `packet` is queued here.
    #[must_use]
    pub fn contains(&self, packet: &Packet) -> bool {
        self.packets.lock().iter().any(|p| p.same(packet))
    }

    /// Cancel every queued request.
    ///
    /// Cancel hooks run outside the queue lock, so a hook may remove its
    /// packet from this queue. Returns the number of packets cancelled.
    pub fn cancel_all(&self) -> usize {
        let snapshot: Vec<Packet> = self.packets.lock().clone();
        let cancelled = snapshot.iter().filter(|p| p.cancel()).count();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled outstanding requests");
        }
        cancelled
    }

    /// Number of queued requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }
}
