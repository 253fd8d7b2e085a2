//! Discovery edges.
//!
//! An edge is the client-owned binding between a discovered object and the
//! object that discovered it:
//!
//! ```text
//!   port ◀──edge── enclosure ◀──edge(slot 0)── drive
//!   (server)       (client/server)             (client)
//! ```
//!
//! The server drives the edge's path state and path attributes; the client
//! hears about every change through its [`EdgeListener`] and decides which
//! lifecycle condition to arm. Requests travel client to server over the
//! edge and are rejected outright unless the path state is ENABLED.

use std::fmt;
use std::sync::Weak;

use bitflags::bitflags;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shelf_core::{ObjectId, Status};

use crate::error::{Result, TransportError};
use crate::packet::Packet;
use crate::payload::{ControlOperation, ControlRequest, Operation};
use crate::pool::PacketPool;

/// Connectivity of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathState {
    /// Not attached.
    #[default]
    Invalid,
    /// Carrying traffic.
    Enabled,
    /// Attached but not carrying traffic.
    Disabled,
    /// Attached but the server reports a fault.
    Broken,
    /// Attached and power-saving.
    Slumber,
    /// The server lost the client for good.
    Gone,
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invalid => "INVALID",
            Self::Enabled => "ENABLED",
            Self::Disabled => "DISABLED",
            Self::Broken => "BROKEN",
            Self::Slumber => "SLUMBER",
            Self::Gone => "GONE",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// Reasons an edge cannot carry traffic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PathAttributes: u32 {
        /// Powered off until someone explicitly powers it on.
        const POWERED_OFF_PERSIST = 1 << 0;
        /// Powered off; a power-on request may clear it.
        const POWERED_OFF_NONPERSIST = 1 << 1;
        /// Powered off by hardware; cannot be cleared.
        const POWERED_OFF_UNRECOV = 1 << 2;
        /// Power save is engaged.
        const POWERSAVE_ON = 1 << 3;
        /// Bypassed until someone explicitly unbypasses it.
        const BYPASSED_PERSIST = 1 << 4;
        /// Bypassed; an unbypass request may clear it.
        const BYPASSED_NONPERSIST = 1 << 5;
        /// Bypassed by hardware; cannot be cleared.
        const BYPASSED_UNRECOV = 1 << 6;
        /// The client was physically removed.
        const REMOVED = 1 << 7;
        /// The client is not logged in.
        const NOT_PRESENT = 1 << 8;
        /// Powered back on after a persistent power-off; must be rebuilt.
        const POWERED_ON_NEED_DESTROY = 1 << 9;
        /// A power cycle was requested.
        const POWERCYCLE_PENDING = 1 << 10;
        /// A requested power cycle finished.
        const POWERCYCLE_COMPLETE = 1 << 11;
    }
}

impl PathAttributes {
    /// Every powered-off variant.
    pub const POWERED_OFF: Self = Self::POWERED_OFF_PERSIST
        .union(Self::POWERED_OFF_NONPERSIST)
        .union(Self::POWERED_OFF_UNRECOV);

    /// Every bypassed variant.
    pub const BYPASSED: Self = Self::BYPASSED_PERSIST
        .union(Self::BYPASSED_NONPERSIST)
        .union(Self::BYPASSED_UNRECOV);

    /// Attributes that can never be cleared.
    pub const UNRECOVERABLE: Self = Self::POWERED_OFF_UNRECOV.union(Self::BYPASSED_UNRECOV);

    /// Attributes that keep the client out of READY.
    pub const BLOCKING: Self = Self::POWERED_OFF
        .union(Self::BYPASSED)
        .union(Self::POWERSAVE_ON);

    /// True if the client must be torn down.
    #[must_use]
    pub const fn requires_destroy(self) -> bool {
        self.contains(Self::REMOVED.union(Self::NOT_PRESENT))
            || self.contains(Self::POWERED_ON_NEED_DESTROY)
    }

    /// True if any blocking attribute is set.
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        self.intersects(Self::BLOCKING)
    }
}

/// Identities on both ends of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeBinding {
    /// Object that owns the edge.
    pub client_id: ObjectId,
    /// Index of the edge within the client.
    pub client_index: u32,
    /// Object that discovered the client.
    pub server_id: ObjectId,
    /// Index of the client within the server (slot number).
    pub server_index: u32,
}

impl EdgeBinding {
    /// Binding of an unattached edge.
    pub const UNBOUND: Self = Self {
        client_id: ObjectId::INVALID,
        client_index: u32::MAX,
        server_id: ObjectId::INVALID,
        server_index: u32::MAX,
    };
}

impl Default for EdgeBinding {
    fn default() -> Self {
        Self::UNBOUND
    }
}

/// What changed on an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeEventKind {
    /// The path state changed.
    StateChange,
    /// The path attributes changed.
    AttributeChange,
}

/// Notification delivered to the client of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    /// What changed.
    pub kind: EdgeEventKind,
    /// Binding of the edge.
    pub binding: EdgeBinding,
    /// Path state after the change.
    pub path_state: PathState,
    /// Path attributes after the change.
    pub path_attributes: PathAttributes,
}

/// Receives edge change notifications.
pub trait EdgeListener: Send + Sync {
    /// Called outside the edge lock after every change.
    fn on_edge_event(&self, event: EdgeEvent);
}

/// Delivers control requests to objects.
pub trait ControlSender: Send + Sync {
    /// Deliver `packet` to the control entry of `target`.
    ///
    /// The packet is always completed, possibly before this returns. If the
    /// target does not exist the packet completes with `NoObject`.
    fn send_control(&self, target: ObjectId, packet: &Packet) -> Status;
}

struct EdgeFields {
    binding: EdgeBinding,
    path_state: PathState,
    path_attributes: PathAttributes,
}

/// A client-owned discovery edge.
pub struct DiscoveryEdge {
    fields: RwLock<EdgeFields>,
    listener: RwLock<Option<Weak<dyn EdgeListener>>>,
}

impl Default for DiscoveryEdge {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryEdge {
    /// Create an unattached edge.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fields: RwLock::new(EdgeFields {
                binding: EdgeBinding::UNBOUND,
                path_state: PathState::Invalid,
                path_attributes: PathAttributes::empty(),
            }),
            listener: RwLock::new(None),
        }
    }

    /// Register the client that hears about changes.
    pub fn set_listener(&self, listener: Weak<dyn EdgeListener>) {
        *self.listener.write() = Some(listener);
    }

    fn notify(&self, kind: EdgeEventKind) {
        let event = {
            let fields = self.fields.read();
            EdgeEvent {
                kind,
                binding: fields.binding,
                path_state: fields.path_state,
                path_attributes: fields.path_attributes,
            }
        };
        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.on_edge_event(event);
        }
    }

    // ========================================================================
    // Server side
    // ========================================================================

    /// Attach the edge with its initial state.
    ///
    /// # Errors
    ///
    /// Returns `EdgeAlreadyAttached` unless the path state is INVALID.
    pub fn attach(
        &self,
        binding: EdgeBinding,
        path_state: PathState,
        path_attributes: PathAttributes,
    ) -> Result<()> {
        {
            let mut fields = self.fields.write();
            if fields.path_state != PathState::Invalid {
                return Err(TransportError::EdgeAlreadyAttached);
            }
            fields.binding = binding;
            fields.path_state = path_state;
            fields.path_attributes = path_attributes;
        }
        tracing::debug!(
            client_id = %binding.client_id,
            server_id = %binding.server_id,
            server_index = binding.server_index,
            path_state = %path_state,
            "edge attached"
        );
        if path_state != PathState::Invalid {
            self.notify(EdgeEventKind::StateChange);
        }
        Ok(())
    }

    /// Return the edge to INVALID without notifying the client.
    pub fn reset(&self) {
        let mut fields = self.fields.write();
        fields.binding = EdgeBinding::UNBOUND;
        fields.path_state = PathState::Invalid;
        fields.path_attributes = PathAttributes::empty();
    }

    /// Change the path state. Returns true if it changed.
    pub fn set_path_state(&self, path_state: PathState) -> bool {
        let changed = {
            let mut fields = self.fields.write();
            let changed = fields.path_state != path_state;
            fields.path_state = path_state;
            changed
        };
        if changed {
            self.notify(EdgeEventKind::StateChange);
        }
        changed
    }

    /// Set attribute bits. Returns true if any bit changed.
    pub fn set_path_attributes(&self, bits: PathAttributes) -> bool {
        self.update_path_attributes(bits, bits)
    }

    /// Clear attribute bits. Returns true if any bit changed.
    pub fn clear_path_attributes(&self, bits: PathAttributes) -> bool {
        self.update_path_attributes(bits, PathAttributes::empty())
    }

    /// Replace the bits under `mask` with those of `value`.
    ///
    /// Returns true if any bit changed; the client is notified once.
    pub fn update_path_attributes(&self, mask: PathAttributes, value: PathAttributes) -> bool {
        let changed = {
            let mut fields = self.fields.write();
            let next = (fields.path_attributes - mask) | (value & mask);
            let changed = next != fields.path_attributes;
            fields.path_attributes = next;
            changed
        };
        if changed {
            self.notify(EdgeEventKind::AttributeChange);
        }
        changed
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Identities on both ends.
    #[must_use]
    pub fn binding(&self) -> EdgeBinding {
        self.fields.read().binding
    }

    /// Current path state.
    #[must_use]
    pub fn path_state(&self) -> PathState {
        self.fields.read().path_state
    }

    /// Current path attributes.
    ///
    /// # Errors
    ///
    /// Returns `EdgeNotEnabled` unless the path state is exactly ENABLED.
    pub fn path_attributes(&self) -> Result<PathAttributes> {
        let fields = self.fields.read();
        if fields.path_state == PathState::Enabled {
            Ok(fields.path_attributes)
        } else {
            Err(TransportError::EdgeNotEnabled)
        }
    }

    /// Path attributes regardless of path state.
    #[must_use]
    pub fn peek_path_attributes(&self) -> PathAttributes {
        self.fields.read().path_attributes
    }

    // ========================================================================
    // Client side
    // ========================================================================

    /// Ask the server to remove this edge and wait for the answer.
    ///
    /// Detaching an INVALID edge succeeds without sending anything. If the
    /// server is already gone the edge is reset locally.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientResources` if no packet is available and
    /// `RequestFailed` if the server refused.
    pub fn detach(&self, sender: &dyn ControlSender, pool: &PacketPool) -> Result<()> {
        let binding = {
            let fields = self.fields.read();
            if fields.path_state == PathState::Invalid {
                tracing::debug!("detach of an unattached edge");
                return Ok(());
            }
            fields.binding
        };

        let packet = pool.allocate()?;
        packet.push_operation(Operation::Control(ControlOperation::new(
            ControlRequest::DetachEdge { binding },
        )));
        sender.send_control(binding.server_id, &packet);
        packet.wait();

        let status = match packet.pop_operation() {
            Some(Operation::Control(op)) if !op.status.is_ok() => op.status,
            _ => packet.status(),
        };
        if let Err(e) = pool.release(&packet) {
            tracing::warn!(error = %e, "failed to release detach packet");
        }

        match status {
            Status::Ok => Ok(()),
            Status::NoObject => {
                tracing::warn!(
                    server_id = %binding.server_id,
                    "edge server is gone, resetting edge locally"
                );
                self.reset();
                Ok(())
            }
            other => Err(TransportError::RequestFailed(other)),
        }
    }
}

impl fmt::Debug for DiscoveryEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.fields.read();
        f.debug_struct("DiscoveryEdge")
            .field("binding", &fields.binding)
            .field("path_state", &fields.path_state)
            .field("path_attributes", &fields.path_attributes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingSender;
    use crate::payload::ControlRequest;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<EdgeEvent>>,
    }

    impl EdgeListener for Recorder {
        fn on_edge_event(&self, event: EdgeEvent) {
            self.events.lock().push(event);
        }
    }

    fn binding() -> EdgeBinding {
        EdgeBinding {
            client_id: ObjectId::new(5),
            client_index: 0,
            server_id: ObjectId::new(2),
            server_index: 3,
        }
    }

    fn setup() -> (DiscoveryEdge, Arc<Recorder>) {
        let edge = DiscoveryEdge::new();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn EdgeListener> = Arc::downgrade(&(Arc::clone(&recorder) as Arc<dyn EdgeListener>));
        edge.set_listener(weak);
        (edge, recorder)
    }

    #[test]
    fn new_edge_is_invalid() {
        let edge = DiscoveryEdge::new();
        assert_eq!(edge.path_state(), PathState::Invalid);
        assert_eq!(edge.binding(), EdgeBinding::UNBOUND);
        assert!(edge.peek_path_attributes().is_empty());
    }

    #[test]
    fn attach_only_from_invalid() {
        let (edge, _) = setup();
        edge.attach(binding(), PathState::Enabled, PathAttributes::empty())
            .unwrap();
        assert!(matches!(
            edge.attach(binding(), PathState::Enabled, PathAttributes::empty()),
            Err(TransportError::EdgeAlreadyAttached)
        ));

        edge.reset();
        assert!(edge
            .attach(binding(), PathState::Disabled, PathAttributes::empty())
            .is_ok());
    }

    #[test]
    fn attributes_require_enabled_state() {
        let (edge, _) = setup();
        assert!(matches!(
            edge.path_attributes(),
            Err(TransportError::EdgeNotEnabled)
        ));

        edge.attach(binding(), PathState::Enabled, PathAttributes::REMOVED)
            .unwrap();
        assert_eq!(edge.path_attributes().unwrap(), PathAttributes::REMOVED);

        edge.set_path_state(PathState::Slumber);
        assert!(matches!(
            edge.path_attributes(),
            Err(TransportError::EdgeNotEnabled)
        ));
        assert_eq!(edge.peek_path_attributes(), PathAttributes::REMOVED);
    }

    #[test]
    fn listener_hears_only_real_changes() {
        let (edge, recorder) = setup();
        edge.attach(binding(), PathState::Enabled, PathAttributes::empty())
            .unwrap();
        assert!(edge.set_path_attributes(PathAttributes::POWERSAVE_ON));
        assert!(!edge.set_path_attributes(PathAttributes::POWERSAVE_ON));
        assert!(!edge.set_path_state(PathState::Enabled));
        assert!(edge.set_path_state(PathState::Gone));

        let events = recorder.events.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EdgeEventKind::StateChange);
        assert_eq!(events[1].kind, EdgeEventKind::AttributeChange);
        assert_eq!(events[1].path_attributes, PathAttributes::POWERSAVE_ON);
        assert_eq!(events[2].path_state, PathState::Gone);
    }

    #[test]
    fn update_replaces_masked_bits() {
        let (edge, _) = setup();
        edge.attach(
            binding(),
            PathState::Enabled,
            PathAttributes::POWERED_OFF_PERSIST | PathAttributes::REMOVED,
        )
        .unwrap();

        edge.update_path_attributes(
            PathAttributes::POWERED_OFF,
            PathAttributes::POWERED_OFF_NONPERSIST,
        );
        assert_eq!(
            edge.peek_path_attributes(),
            PathAttributes::POWERED_OFF_NONPERSIST | PathAttributes::REMOVED
        );
    }

    #[test]
    fn reset_is_silent() {
        let (edge, recorder) = setup();
        edge.attach(binding(), PathState::Enabled, PathAttributes::empty())
            .unwrap();
        edge.reset();
        assert_eq!(recorder.events.lock().len(), 1);
        assert_eq!(edge.path_state(), PathState::Invalid);
    }

    #[test]
    fn attribute_predicates() {
        assert!((PathAttributes::REMOVED | PathAttributes::NOT_PRESENT).requires_destroy());
        assert!(!PathAttributes::REMOVED.requires_destroy());
        assert!(PathAttributes::POWERED_ON_NEED_DESTROY.requires_destroy());
        assert!(PathAttributes::BYPASSED_PERSIST.is_blocking());
        assert!(PathAttributes::POWERSAVE_ON.is_blocking());
        assert!(!PathAttributes::POWERCYCLE_PENDING.is_blocking());
        assert!(!PathAttributes::NOT_PRESENT.is_blocking());
    }

    #[test]
    fn path_attributes_survive_json() {
        let attrs = PathAttributes::REMOVED | PathAttributes::BYPASSED_PERSIST;
        let json = serde_json::to_string(&attrs).unwrap();
        let back: PathAttributes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, attrs);
    }

    #[test]
    fn detach_of_invalid_edge_sends_nothing() {
        let edge = DiscoveryEdge::new();
        let sender = RecordingSender::default();
        let pool = PacketPool::new(1);

        edge.detach(&sender, &pool).unwrap();
        edge.detach(&sender, &pool).unwrap();

        assert_eq!(sender.count(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn detach_sends_request_to_server() {
        let edge = DiscoveryEdge::new();
        edge.attach(binding(), PathState::Gone, PathAttributes::empty())
            .unwrap();
        let sender = RecordingSender::default();
        let pool = PacketPool::new(1);

        edge.detach(&sender, &pool).unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ObjectId::new(2));
        assert!(matches!(
            sent[0].1,
            ControlRequest::DetachEdge { binding: b } if b == binding()
        ));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn detach_from_missing_server_resets_locally() {
        let edge = DiscoveryEdge::new();
        edge.attach(binding(), PathState::Enabled, PathAttributes::empty())
            .unwrap();
        let sender = RecordingSender::replying(Status::NoObject);
        let pool = PacketPool::new(1);

        edge.detach(&sender, &pool).unwrap();
        assert_eq!(edge.path_state(), PathState::Invalid);
    }

    #[test]
    fn detach_surfaces_server_refusal() {
        let edge = DiscoveryEdge::new();
        edge.attach(binding(), PathState::Enabled, PathAttributes::empty())
            .unwrap();
        let sender = RecordingSender::replying(Status::Busy);
        let pool = PacketPool::new(1);

        assert!(matches!(
            edge.detach(&sender, &pool),
            Err(TransportError::RequestFailed(Status::Busy))
        ));
    }

    #[test]
    fn detach_without_packets_fails() {
        let edge = DiscoveryEdge::new();
        edge.attach(binding(), PathState::Enabled, PathAttributes::empty())
            .unwrap();
        let sender = RecordingSender::default();
        let pool = PacketPool::new(0);

        assert!(matches!(
            edge.detach(&sender, &pool),
            Err(TransportError::InsufficientResources)
        ));
        assert_eq!(sender.count(), 0);
    }
}
