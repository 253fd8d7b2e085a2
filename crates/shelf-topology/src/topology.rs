//! The object table and request routing.
//!
//! The [`Topology`] owns every managed object, the packet pool, and the
//! attribute store. It creates objects, delivers control requests, routes
//! requests over discovery edges, and reaps objects once they are
//! destroyed. It never runs lifecycle passes on its own: the owner calls
//! [`Topology::crank`] whenever the reschedule hook fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use shelf_core::{ClassId, DeathReason, LifecycleState, ObjectId, Status};
use shelf_lifecycle::{LifecycleObject, LifecycleStatus, RescheduleHook};
use shelf_transport::{
    ControlOperation, ControlRequest, ControlSender, DiscoveryEdge, EdgeBinding, EdgeListener,
    Operation, Packet, PacketPool, PathAttributes, PathState,
};

use crate::classes::{finish_request, ClassSet};
use crate::config::TopologyConfig;
use crate::error::{Result, TopologyError};
use crate::object::{ManagedObject, ObjectClass, TransportOutcome};
use crate::store::AttributeStore;

/// Every managed object and the resources they share.
pub struct Topology {
    objects: RwLock<HashMap<ObjectId, Arc<ManagedObject>>>,
    next_id: AtomicU32,
    pool: PacketPool,
    store: Arc<dyn AttributeStore>,
    hook: RescheduleHook,
    config: TopologyConfig,
    classes: ClassSet,
    this: Weak<Self>,
}

impl Topology {
    /// Create an empty topology with the built-in classes.
    ///
    /// `hook` is called with an object id and a delay whenever that object
    /// needs another lifecycle pass.
    ///
    /// # Errors
    ///
    /// Returns `Lifecycle` if a class registry fails verification.
    pub fn new(
        config: TopologyConfig,
        store: Arc<dyn AttributeStore>,
        hook: RescheduleHook,
    ) -> Result<Arc<Self>> {
        let classes = ClassSet::new(&config)?;
        Ok(Self::with_classes(config, classes, store, hook))
    }

    /// Create an empty topology with the given classes.
    #[must_use]
    pub fn with_classes(
        config: TopologyConfig,
        classes: ClassSet,
        store: Arc<dyn AttributeStore>,
        hook: RescheduleHook,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            objects: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            pool: PacketPool::new(config.packet_pool_capacity),
            store,
            hook,
            config,
            classes,
            this: this.clone(),
        })
    }

    /// Topology settings.
    #[must_use]
    pub const fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Shared packet pool.
    #[must_use]
    pub const fn pool(&self) -> &PacketPool {
        &self.pool
    }

    /// Attribute store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AttributeStore> {
        &self.store
    }

    /// The class registered for `class`.
    #[must_use]
    pub fn class(&self, class: ClassId) -> Arc<dyn ObjectClass> {
        self.classes.get(class)
    }

    /// Look up an object.
    #[must_use]
    pub fn object(&self, id: ObjectId) -> Option<Arc<ManagedObject>> {
        self.objects.read().get(&id).cloned()
    }

    /// Look up an object that must exist.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if there is no such object.
    pub fn require(&self, id: ObjectId) -> Result<Arc<ManagedObject>> {
        self.object(id).ok_or(TopologyError::ObjectNotFound(id))
    }

    /// Ids of every object, in ascending order.
    #[must_use]
    pub fn object_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.objects.read().keys().copied().collect();
        ids.sort_unstable_by_key(|id| id.as_u32());
        ids
    }

    /// Number of objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// True if there are no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    // ========================================================================
    // Object creation
    // ========================================================================

    fn create_object(&self, class_id: ClassId) -> Result<Arc<ManagedObject>> {
        let class = self.classes.get(class_id);
        let id = ObjectId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let object = Arc::new(ManagedObject::new(
            id,
            Arc::clone(&class),
            Arc::clone(&self.hook),
            self.this.clone(),
        ));

        if let Some(discovered) = object.discovered() {
            let weak: Weak<ManagedObject> = Arc::downgrade(&object);
            let listener: Weak<dyn EdgeListener> = weak;
            discovered.edge().set_listener(listener);
        }
        class.create(&object)?;

        self.objects.write().insert(id, Arc::clone(&object));
        tracing::info!(object_id = %id, class = %class_id, "object created");
        Ok(object)
    }

    fn discard(&self, object: &ManagedObject) {
        self.objects.write().remove(&object.id());
        object.class().destroy(object);
        tracing::debug!(object_id = %object.id(), "object discarded");
    }

    fn schedule(&self, id: ObjectId) {
        (self.hook)(id, Duration::ZERO);
    }

    /// Create a port, the root of a discovery tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the class refuses the new object.
    pub fn create_port(&self) -> Result<ObjectId> {
        let port = self.create_object(ClassId::Port)?;
        self.schedule(port.id());
        Ok(port.id())
    }

    /// Create an object of `class` and attach its upstream edge to `parent`
    /// at `server_index`.
    ///
    /// # Errors
    ///
    /// Returns `WrongClass` if `parent` serves no edges or `class` has no
    /// upstream edge, and `RequestFailed` if the parent refuses the attach.
    pub fn discover_child(
        &self,
        parent: &ManagedObject,
        class: ClassId,
        server_index: u32,
    ) -> Result<ObjectId> {
        if parent.discovering().is_none() {
            return Err(TopologyError::WrongClass {
                id: parent.id(),
                expected: ClassId::Enclosure,
            });
        }
        let child = self.create_object(class)?;
        let Some(discovered) = child.discovered() else {
            self.discard(&child);
            return Err(TopologyError::WrongClass {
                id: child.id(),
                expected: ClassId::Drive,
            });
        };

        let packet = match self.pool.allocate() {
            Ok(packet) => packet,
            Err(e) => {
                tracing::error!(parent_id = %parent.id(), error = %e, "cannot allocate attach request");
                self.discard(&child);
                return Err(e.into());
            }
        };
        let binding = EdgeBinding {
            client_id: child.id(),
            client_index: 0,
            server_id: parent.id(),
            server_index,
        };
        packet.push_operation(Operation::Control(ControlOperation::new(
            ControlRequest::AttachEdge {
                edge: Arc::clone(discovered.edge()),
                binding,
            },
        )));
        self.send_control(parent.id(), &packet);
        packet.wait();

        let status = match packet.pop_operation() {
            Some(Operation::Control(op)) if !op.status.is_ok() => op.status,
            _ => packet.status(),
        };
        if let Err(e) = self.pool.release(&packet) {
            tracing::warn!(error = %e, "failed to release attach request");
        }
        if !status.is_ok() {
            self.discard(&child);
            return Err(TopologyError::RequestFailed(status));
        }

        tracing::info!(
            object_id = %child.id(),
            class = %class,
            parent_id = %parent.id(),
            server_index,
            "object discovered"
        );
        self.schedule(child.id());
        Ok(child.id())
    }

    // ========================================================================
    // Request routing
    // ========================================================================

    /// Send `packet` across `edge` to the server's transport entry.
    ///
    /// A server that does not handle the request forwards it over its own
    /// upstream edge; the port at the root fails whatever is left. The
    /// packet is always completed, possibly before this returns.
    pub fn send_over_edge(&self, edge: &DiscoveryEdge, packet: &Packet) -> Status {
        if edge.path_state() != PathState::Enabled {
            return finish_request(packet, Status::EdgeNotEnabled);
        }
        let binding = edge.binding();
        packet.set_route(binding);

        let Some(server) = self.object(binding.server_id) else {
            return finish_request(packet, Status::NoObject);
        };
        match server.class().transport_entry(&server, packet) {
            TransportOutcome::Handled => packet.status(),
            TransportOutcome::Traverse => match server.discovered() {
                Some(upstream) => self.send_over_edge(upstream.edge(), packet),
                None => {
                    tracing::debug!(object_id = %server.id(), "request reached the root unhandled");
                    finish_request(packet, Status::GenericFailure)
                }
            },
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Run one lifecycle pass of object `id`, reaping it once destroyed.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` for an unknown id and `Lifecycle` if the
    /// pass fails.
    pub fn crank(&self, id: ObjectId) -> Result<LifecycleStatus> {
        self.crank_at(id, Instant::now())
    }

    /// Run one lifecycle pass with an explicit clock reading.
    ///
    /// # Errors
    ///
    /// See [`Topology::crank`].
    pub fn crank_at(&self, id: ObjectId, now: Instant) -> Result<LifecycleStatus> {
        let object = self.require(id)?;
        let status = shelf_lifecycle::crank_at(&object, now)?;
        if object.lifecycle().is_destroyed(object.registry()) {
            self.reap(&object);
            return Ok(LifecycleStatus::Done);
        }
        Ok(status)
    }

    fn reap(&self, object: &ManagedObject) {
        if self.objects.write().remove(&object.id()).is_none() {
            return;
        }
        object.class().destroy(object);
        tracing::info!(object_id = %object.id(), class = %object.class_id(), "object destroyed");
    }

    /// Set the condition called `name` on object `id`.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` for an unknown id and `UnknownCondition` if
    /// the object's class has no such condition.
    pub fn set_condition(&self, id: ObjectId, name: &str) -> Result<()> {
        let object = self.require(id)?;
        let condition = object
            .registry()
            .find(name)
            .ok_or_else(|| TopologyError::UnknownCondition(name.to_string()))?;
        object.lifecycle().set(object.registry(), condition)?;
        Ok(())
    }

    /// Earliest armed timer of object `id`.
    #[must_use]
    pub fn next_deadline(&self, id: ObjectId) -> Option<Instant> {
        self.object(id).and_then(|o| o.lifecycle().next_deadline())
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Serializable view of every object.
    #[must_use]
    pub fn snapshot(&self) -> TopologySnapshot {
        let objects = self
            .object_ids()
            .into_iter()
            .filter_map(|id| self.object(id))
            .map(|object| ObjectSnapshot::of(&object))
            .collect();
        TopologySnapshot {
            objects,
            packets_in_use: self.pool.in_use(),
        }
    }
}

impl ControlSender for Topology {
    fn send_control(&self, target: ObjectId, packet: &Packet) -> Status {
        match self.object(target) {
            Some(object) => object.class().control_entry(&object, packet),
            None => finish_request(packet, Status::NoObject),
        }
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("objects", &self.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a topology.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    /// Objects in id order.
    pub objects: Vec<ObjectSnapshot>,
    /// Packets allocated from the pool.
    pub packets_in_use: usize,
}

impl TopologySnapshot {
    /// The object with `id`, if present.
    #[must_use]
    pub fn object(&self, id: ObjectId) -> Option<&ObjectSnapshot> {
        self.objects.iter().find(|o| o.id == id)
    }
}

/// Serializable view of one object.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectSnapshot {
    /// Object id.
    pub id: ObjectId,
    /// Class.
    pub class: ClassId,
    /// Lifecycle state.
    pub state: LifecycleState,
    /// Why the object failed, if it did.
    pub death_reason: DeathReason,
    /// Names of the active conditions.
    pub active_conditions: Vec<String>,
    /// Upstream edge, for discovered objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<EdgeSnapshot>,
    /// Port at the root of the tree, once learned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_object_id: Option<ObjectId>,
    /// Server indices of attached clients.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<u32>,
}

impl ObjectSnapshot {
    fn of(object: &ManagedObject) -> Self {
        let upstream = object.discovered().map(|d| {
            let binding = d.edge().binding();
            EdgeSnapshot {
                server_id: binding.server_id,
                server_index: binding.server_index,
                path_state: d.edge().path_state(),
                path_attributes: d.edge().peek_path_attributes(),
            }
        });
        Self {
            id: object.id(),
            class: object.class_id(),
            state: object.state(),
            death_reason: object.lifecycle().death_reason(),
            active_conditions: object
                .active_condition_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            upstream,
            port_object_id: object.discovered().and_then(|d| d.port_object_id()),
            clients: object
                .discovering()
                .map(|d| d.clients().into_keys().collect())
                .unwrap_or_default(),
        }
    }
}

/// Serializable view of an upstream edge.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EdgeSnapshot {
    /// Server the edge is attached to.
    pub server_id: ObjectId,
    /// Index within the server.
    pub server_index: u32,
    /// Path state.
    pub path_state: PathState,
    /// Path attributes, whatever the path state.
    pub path_attributes: PathAttributes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::base;
    use crate::mock::HoldingPortClass;
    use crate::slot::SlotStatus;
    use crate::store::{Attribute, AttributeKey, AttributeValue, InMemoryAttributeStore};
    use parking_lot::Mutex;
    use shelf_lifecycle::LifecycleObject;

    struct Harness {
        topology: Arc<Topology>,
        holding: Arc<HoldingPortClass>,
        woken: Arc<Mutex<Vec<ObjectId>>>,
        delays: Arc<Mutex<Vec<(ObjectId, Duration)>>>,
    }

    fn setup(slots: &[SlotStatus]) -> Harness {
        let config = TopologyConfig::default();
        let store = Arc::new(InMemoryAttributeStore::new());
        store
            .set(
                AttributeKey::enclosure(Attribute::SlotCount),
                AttributeValue::Count(u32::try_from(slots.len()).unwrap()),
            )
            .unwrap();
        for (slot, status) in (0u32..).zip(slots) {
            for (key, value) in status.entries(slot) {
                store.set(key, value).unwrap();
            }
        }
        store.commit();

        let woken = Arc::new(Mutex::new(Vec::new()));
        let delays = Arc::new(Mutex::new(Vec::new()));
        let (w, d) = (Arc::clone(&woken), Arc::clone(&delays));
        let hook: RescheduleHook = Arc::new(move |id, delay| {
            w.lock().push(id);
            d.lock().push((id, delay));
        });

        let holding = Arc::new(HoldingPortClass::new().unwrap());
        let classes = ClassSet::new(&config)
            .unwrap()
            .with_class(Arc::clone(&holding) as Arc<dyn ObjectClass>);
        let topology = Topology::with_classes(config, classes, store, hook);
        Harness {
            topology,
            holding,
            woken,
            delays,
        }
    }

    impl Harness {
        fn settle(&self) {
            for _ in 0..16 {
                let ids: Vec<ObjectId> = std::mem::take(&mut *self.woken.lock());
                if ids.is_empty() {
                    return;
                }
                for id in ids {
                    let _ = self.topology.crank(id);
                }
            }
        }
    }

    #[test]
    fn unknown_target_completes_with_no_object() {
        let h = setup(&[]);
        let packet = h.topology.pool().allocate().unwrap();
        let status = h.topology.send_control(ObjectId::new(99), &packet);
        assert_eq!(status, Status::NoObject);
        assert_eq!(packet.status(), Status::NoObject);
    }

    #[test]
    fn destroy_cancels_outstanding_port_request() {
        let h = setup(&[SlotStatus::healthy()]);
        let port = h.topology.create_port().unwrap();
        let port_object = h.topology.require(port).unwrap();
        let enclosure = h
            .topology
            .discover_child(&port_object, ClassId::Enclosure, 0)
            .unwrap();
        h.settle();

        // The enclosure asked for the port id and is parked on the port.
        let enclosure_object = h.topology.require(enclosure).unwrap();
        assert!(enclosure_object.lifecycle().is_pending());
        assert_eq!(enclosure_object.state(), LifecycleState::Specialize);
        assert_eq!(h.holding.parked_count(), 1);
        assert_eq!(h.topology.pool().in_use(), 1);

        enclosure_object
            .lifecycle()
            .set(enclosure_object.registry(), base::DESTROY)
            .unwrap();
        h.settle();

        assert_eq!(h.holding.parked_count(), 0);
        assert!(port_object.terminator().is_empty());
        assert!(h.topology.object(enclosure).is_none());
        assert_eq!(port_object.discovering().unwrap().client_count(), 0);
        assert_eq!(h.topology.pool().in_use(), 0);
    }

    #[test]
    fn failed_port_request_waits_for_retry() {
        let h = setup(&[SlotStatus::healthy()]);
        let port = h.topology.create_port().unwrap();
        let port_object = h.topology.require(port).unwrap();
        let enclosure = h
            .topology
            .discover_child(&port_object, ClassId::Enclosure, 0)
            .unwrap();
        h.settle();
        assert_eq!(h.holding.parked_count(), 1);
        h.delays.lock().clear();

        // The port fails the parked request on its own.
        assert_eq!(port_object.terminator().cancel_all(), 1);

        let enclosure_object = h.topology.require(enclosure).unwrap();
        assert!(!enclosure_object.lifecycle().is_pending());
        assert_eq!(
            *h.delays.lock(),
            vec![(enclosure, h.topology.config().corrective_retry)]
        );
        assert_eq!(enclosure_object.state(), LifecycleState::Specialize);
        assert!(enclosure_object
            .lifecycle()
            .is_set(crate::classes::discovered::GET_PORT_OBJECT_ID));
        assert_eq!(h.holding.parked_count(), 0);
        assert_eq!(h.topology.pool().in_use(), 0);
    }

    #[test]
    fn released_request_lets_discovery_finish() {
        let h = setup(&[SlotStatus::healthy()]);
        let port = h.topology.create_port().unwrap();
        let port_object = h.topology.require(port).unwrap();
        let enclosure = h
            .topology
            .discover_child(&port_object, ClassId::Enclosure, 0)
            .unwrap();
        h.settle();

        assert_eq!(h.holding.release_all(), 1);
        h.settle();

        let enclosure_object = h.topology.require(enclosure).unwrap();
        assert_eq!(
            enclosure_object.discovered().unwrap().port_object_id(),
            Some(port)
        );
        assert_eq!(enclosure_object.state(), LifecycleState::Ready);
    }
}
