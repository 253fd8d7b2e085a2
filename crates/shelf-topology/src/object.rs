//! Managed objects and the object-class capability interface.
//!
//! A [`ManagedObject`] is one instance in the topology. What it does is
//! decided by its [`ObjectClass`]: the class owns the condition registry and
//! the entry points through which the core calls class-specific code.
//!
//! Objects play up to two roles:
//!
//! - **discovered**: the object owns an upstream [`DiscoveryEdge`] to the
//!   object that found it (enclosures, drives)
//! - **discovering**: the object serves edges for the objects it found
//!   (ports, enclosures)

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use shelf_core::{ClassId, LifecycleState, ObjectId, PacketId, Status};
use shelf_lifecycle::{ClassRegistry, LifecycleObject, ObjectLifecycle, RescheduleHook};
use shelf_transport::{
    DiscoveryEdge, DiscoveryOpcode, EdgeEvent, EdgeListener, Packet, TerminatorQueue,
};

use crate::error::Result;
use crate::slot::SlotStatus;
use crate::topology::Topology;

/// What a class transport entry did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOutcome {
    /// The class took the request and will complete it.
    Handled,
    /// Not for this object; forward it along the object's upstream edge.
    Traverse,
}

/// Class-specific behaviour of a managed object.
pub trait ObjectClass: Send + Sync {
    /// Class identifier.
    fn class_id(&self) -> ClassId;

    /// Condition registry shared by every instance of the class.
    fn registry(&self) -> &Arc<ClassRegistry<ManagedObject>>;

    /// Called once after the object is built and before it is scheduled.
    ///
    /// # Errors
    ///
    /// An error aborts the creation.
    fn create(&self, _object: &Arc<ManagedObject>) -> Result<()> {
        Ok(())
    }

    /// Called once when the object leaves the topology.
    fn destroy(&self, _object: &ManagedObject) {}

    /// Handle a control request. The class completes the packet.
    fn control_entry(&self, object: &ManagedObject, packet: &Packet) -> Status;

    /// React to a change on the object's upstream edge.
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedPathState` for path states the class does not
    /// handle.
    fn event_entry(&self, object: &ManagedObject, event: &EdgeEvent) -> Result<()>;

    /// Handle a request that arrived over an edge.
    fn transport_entry(&self, object: &ManagedObject, packet: &Packet) -> TransportOutcome;
}

/// An edge served by a discovering object.
#[derive(Debug, Clone)]
pub struct ClientEdge {
    /// Object owning the edge.
    pub client_id: ObjectId,
    /// The edge.
    pub edge: Arc<DiscoveryEdge>,
}

/// State of an object with an upstream edge.
#[derive(Debug, Default)]
pub struct Discovered {
    pub(crate) edge: Arc<DiscoveryEdge>,
    pub(crate) port_object_id: Mutex<Option<ObjectId>>,
    pub(crate) last_corrective: Mutex<Option<(DiscoveryOpcode, Instant)>>,
}

impl Discovered {
    /// The upstream edge.
    #[must_use]
    pub fn edge(&self) -> &Arc<DiscoveryEdge> {
        &self.edge
    }

    /// Object id of the port at the root of the tree, once known.
    #[must_use]
    pub fn port_object_id(&self) -> Option<ObjectId> {
        *self.port_object_id.lock()
    }
}

/// State of an object that serves edges.
#[derive(Debug, Default)]
pub struct Discovering {
    pub(crate) clients: Mutex<BTreeMap<u32, ClientEdge>>,
    pub(crate) last_status: Mutex<HashMap<u32, SlotStatus>>,
    pub(crate) clients_marked_gone: AtomicBool,
}

impl Discovering {
    /// Attached clients by server index.
    #[must_use]
    pub fn clients(&self) -> BTreeMap<u32, ClientEdge> {
        self.clients.lock().clone()
    }

    /// Client attached at `index`.
    #[must_use]
    pub fn client(&self, index: u32) -> Option<ClientEdge> {
        self.clients.lock().get(&index).cloned()
    }

    /// Number of attached clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

// Monitor packets get ids outside the pool's range.
const MONITOR_PACKET_BIT: u64 = 1 << 63;

/// One object in the topology.
pub struct ManagedObject {
    id: ObjectId,
    class: Arc<dyn ObjectClass>,
    registry: Arc<ClassRegistry<ManagedObject>>,
    lifecycle: ObjectLifecycle,
    terminator: TerminatorQueue,
    monitor_packet: Packet,
    discovered: Option<Discovered>,
    discovering: Option<Discovering>,
    topology: Weak<Topology>,
}

impl ManagedObject {
    pub(crate) fn new(
        id: ObjectId,
        class: Arc<dyn ObjectClass>,
        hook: RescheduleHook,
        topology: Weak<Topology>,
    ) -> Self {
        let registry = Arc::clone(class.registry());
        let (discovered, discovering) = match class.class_id() {
            ClassId::Port => (None, Some(Discovering::default())),
            ClassId::Enclosure => (Some(Discovered::default()), Some(Discovering::default())),
            ClassId::Drive => (Some(Discovered::default()), None),
        };
        Self {
            id,
            lifecycle: ObjectLifecycle::new(id, &registry, hook),
            registry,
            class,
            terminator: TerminatorQueue::new(),
            monitor_packet: Packet::new(PacketId::new(u64::from(id.as_u32()) | MONITOR_PACKET_BIT)),
            discovered,
            discovering,
            topology,
        }
    }

    /// Object id.
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Class identifier.
    #[must_use]
    pub fn class_id(&self) -> ClassId {
        self.class.class_id()
    }

    /// The object's class.
    #[must_use]
    pub fn class(&self) -> &Arc<dyn ObjectClass> {
        &self.class
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Outstanding requests of this object.
    #[must_use]
    pub const fn terminator(&self) -> &TerminatorQueue {
        &self.terminator
    }

    /// Upstream role, if the object was discovered.
    #[must_use]
    pub const fn discovered(&self) -> Option<&Discovered> {
        self.discovered.as_ref()
    }

    /// Server role, if the object discovers others.
    #[must_use]
    pub const fn discovering(&self) -> Option<&Discovering> {
        self.discovering.as_ref()
    }

    /// The topology this object lives in.
    #[must_use]
    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.topology.upgrade()
    }

    /// Names of the active conditions.
    #[must_use]
    pub fn active_condition_names(&self) -> Vec<&'static str> {
        self.lifecycle
            .active_conditions()
            .into_iter()
            .filter_map(|id| self.registry.condition(id).map(|c| c.name()))
            .collect()
    }
}

impl LifecycleObject for ManagedObject {
    fn lifecycle(&self) -> &ObjectLifecycle {
        &self.lifecycle
    }

    fn registry(&self) -> &ClassRegistry<Self> {
        &self.registry
    }

    fn monitor_packet(&self) -> &Packet {
        &self.monitor_packet
    }

    fn on_transition(&self, from: LifecycleState, to: LifecycleState) {
        if to == LifecycleState::Fail {
            tracing::warn!(
                object_id = %self.id,
                class = %self.class_id(),
                %from,
                death_reason = ?self.lifecycle.death_reason(),
                "object failed"
            );
        }
    }

    fn cancel_outstanding(&self) {
        self.terminator.cancel_all();
    }
}

impl EdgeListener for ManagedObject {
    fn on_edge_event(&self, event: EdgeEvent) {
        if let Err(e) = self.class.event_entry(self, &event) {
            tracing::warn!(object_id = %self.id, error = %e, ?event, "edge event rejected");
        }
    }
}

impl std::fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObject")
            .field("id", &self.id)
            .field("class", &self.class_id())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}
