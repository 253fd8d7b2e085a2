//! End-to-end tests of a port, an enclosure, and its drives.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shelf_core::{ClassId, DeathReason, LifecycleState, ObjectId, Status};
use shelf_lifecycle::{LifecycleObject, LifecycleStatus};
use shelf_topology::classes::discovered::DISCOVERY_EDGE_NOT_READY;
use shelf_topology::{
    Attribute, AttributeKey, AttributeResult, AttributeStore, AttributeValue, ChangeReason,
    InMemoryAttributeStore, ObjectSnapshot, SlotStatus, StoreSnapshot, Topology, TopologyConfig,
    TopologyError,
};
use shelf_transport::{
    DiscoveryEdge, DiscoveryOpcode, DiscoveryOperation, EdgeBinding, EdgeEvent, EdgeEventKind,
    Operation, PathAttributes, PathState,
};

/// In-memory store that remembers every write.
#[derive(Default)]
struct RecordingStore {
    inner: InMemoryAttributeStore,
    writes: Mutex<Vec<(AttributeKey, AttributeValue)>>,
}

impl RecordingStore {
    fn writes_of(&self, attributes: &[Attribute]) -> Vec<Attribute> {
        self.writes
            .lock()
            .iter()
            .map(|(key, _)| key.attribute)
            .filter(|a| attributes.contains(a))
            .collect()
    }
}

impl AttributeStore for RecordingStore {
    fn get(&self, key: AttributeKey) -> AttributeResult<AttributeValue> {
        self.inner.get(key)
    }

    fn set(&self, key: AttributeKey, value: AttributeValue) -> AttributeResult<()> {
        self.writes.lock().push((key, value));
        self.inner.set(key, value)
    }

    fn commit(&self) {
        self.inner.commit();
    }

    fn snapshot(&self) -> StoreSnapshot {
        self.inner.snapshot()
    }
}

/// One lifecycle pass and whether the edge-not-ready condition was set
/// before and after it.
#[derive(Debug, Clone, Copy)]
struct Pass {
    id: ObjectId,
    not_ready_before: bool,
    status: LifecycleStatus,
    not_ready_after: bool,
}

struct Shelf {
    topology: Arc<Topology>,
    store: Arc<RecordingStore>,
    woken: Arc<Mutex<VecDeque<ObjectId>>>,
    passes: Mutex<Vec<Pass>>,
    port: ObjectId,
    enclosure: ObjectId,
}

impl Shelf {
    fn new(slots: &[SlotStatus]) -> Self {
        let store = Arc::new(RecordingStore::default());
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
        store.writes.lock().clear();

        let woken = Arc::new(Mutex::new(VecDeque::new()));
        let w = Arc::clone(&woken);
        let topology = Topology::new(
            TopologyConfig::default(),
            Arc::clone(&store) as Arc<dyn AttributeStore>,
            Arc::new(move |id, _| w.lock().push_back(id)),
        )
        .unwrap();

        let port = topology.create_port().unwrap();
        let port_object = topology.require(port).unwrap();
        let enclosure = topology
            .discover_child(&port_object, ClassId::Enclosure, 0)
            .unwrap();

        let shelf = Self {
            topology,
            store,
            woken,
            passes: Mutex::new(Vec::new()),
            port,
            enclosure,
        };
        shelf.settle();
        shelf
    }

    /// Crank woken objects until nothing is left to do now.
    fn settle(&self) {
        for _ in 0..512 {
            let next = self.woken.lock().pop_front();
            let Some(id) = next else { return };
            let not_ready_before = self.not_ready(id);
            let Ok(status) = self.topology.crank(id) else {
                continue;
            };
            self.passes.lock().push(Pass {
                id,
                not_ready_before,
                status,
                not_ready_after: self.not_ready(id),
            });
            if status == LifecycleStatus::Reschedule(Duration::ZERO) {
                self.woken.lock().push_back(id);
            }
        }
        panic!("topology did not settle");
    }

    fn not_ready(&self, id: ObjectId) -> bool {
        self.topology
            .object(id)
            .is_some_and(|o| o.lifecycle().is_set(DISCOVERY_EDGE_NOT_READY))
    }

    fn write_slot(&self, slot: u32, status: SlotStatus) {
        for (key, value) in status.entries(slot) {
            self.store.set(key, value).unwrap();
        }
        self.store.commit();
        self.topology
            .set_condition(self.enclosure, "update_slot_status")
            .unwrap();
        self.settle();
    }

    fn drives(&self) -> Vec<ObjectSnapshot> {
        self.topology
            .snapshot()
            .objects
            .into_iter()
            .filter(|o| o.class == ClassId::Drive)
            .collect()
    }

    fn drive_at(&self, slot: u32) -> Option<ObjectSnapshot> {
        self.drives()
            .into_iter()
            .find(|d| d.upstream.is_some_and(|u| u.server_index == slot))
    }
}

fn powered_off(reason: ChangeReason) -> SlotStatus {
    SlotStatus {
        powered_off: Some(reason),
        ..SlotStatus::healthy()
    }
}

fn removed() -> SlotStatus {
    SlotStatus::empty()
}

#[test]
fn healthy_shelf_reaches_ready() {
    let shelf = Shelf::new(&[SlotStatus::healthy(), SlotStatus::empty(), SlotStatus::healthy()]);

    let snapshot = shelf.topology.snapshot();
    assert_eq!(snapshot.objects.len(), 4);
    assert!(snapshot
        .objects
        .iter()
        .all(|o| o.state == LifecycleState::Ready));
    assert_eq!(snapshot.packets_in_use, 0);

    let enclosure = snapshot.object(shelf.enclosure).unwrap();
    assert_eq!(enclosure.port_object_id, Some(shelf.port));
    assert_eq!(enclosure.clients, vec![0, 2]);

    for drive in shelf.drives() {
        assert_eq!(drive.port_object_id, Some(shelf.port));
        let upstream = drive.upstream.unwrap();
        assert_eq!(upstream.server_id, shelf.enclosure);
        assert_eq!(upstream.path_state, PathState::Enabled);
        assert!(upstream.path_attributes.is_empty());
    }
}

#[test]
fn removed_drive_is_destroyed_and_reaped() {
    let shelf = Shelf::new(&[SlotStatus::healthy(), SlotStatus::healthy()]);
    let drive = shelf.drive_at(1).unwrap().id;

    shelf.write_slot(1, removed());

    assert!(shelf.topology.object(drive).is_none());
    assert_eq!(shelf.drives().len(), 1);
    let enclosure = shelf.topology.require(shelf.enclosure).unwrap();
    assert_eq!(enclosure.discovering().unwrap().client_count(), 1);
    assert_eq!(enclosure.state(), LifecycleState::Ready);
}

#[test]
fn reinserted_drive_is_discovered_again() {
    let shelf = Shelf::new(&[SlotStatus::healthy()]);
    let first = shelf.drive_at(0).unwrap().id;

    shelf.write_slot(0, removed());
    assert!(shelf.drive_at(0).is_none());

    shelf.write_slot(0, SlotStatus::healthy());
    let second = shelf.drive_at(0).unwrap();
    assert_ne!(second.id, first);
    assert_eq!(second.state, LifecycleState::Ready);
}

#[test]
fn nonpersistent_power_off_and_bypass_are_corrected() {
    let slot = SlotStatus {
        powered_off: Some(ChangeReason::NonPersistent),
        phy_disabled: Some(ChangeReason::NonPersistent),
        ..SlotStatus::healthy()
    };
    let shelf = Shelf::new(&[slot]);

    let drive = shelf.drive_at(0).unwrap();
    assert_eq!(drive.state, LifecycleState::Ready);
    assert!(drive.upstream.unwrap().path_attributes.is_empty());

    let snapshot = shelf.store.snapshot();
    for attribute in [Attribute::PoweredOff, Attribute::PhyDisabled] {
        assert_eq!(
            snapshot.get(AttributeKey::slot(attribute, 0)).unwrap(),
            AttributeValue::Flag(false)
        );
    }

    // Power comes back before the phy is enabled.
    assert_eq!(
        shelf
            .store
            .writes_of(&[Attribute::PoweredOff, Attribute::PhyDisabled]),
        vec![Attribute::PoweredOff, Attribute::PhyDisabled]
    );

    // The pass that clears the condition asks to run again at once.
    let cleared: Vec<Pass> = shelf
        .passes
        .lock()
        .iter()
        .filter(|p| p.id == drive.id && p.not_ready_before && !p.not_ready_after)
        .copied()
        .collect();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].status, LifecycleStatus::Reschedule(Duration::ZERO));
}

#[test]
fn persistent_power_off_holds_drive_in_activate() {
    let shelf = Shelf::new(&[powered_off(ChangeReason::Persistent)]);

    let drive = shelf.drive_at(0).unwrap();
    assert_eq!(drive.state, LifecycleState::Activate);
    assert!(drive
        .active_conditions
        .contains(&"discovery_edge_not_ready".to_string()));
    assert!(drive
        .upstream
        .unwrap()
        .path_attributes
        .contains(PathAttributes::POWERED_OFF_PERSIST));
}

#[test]
fn power_on_after_persistent_off_rebuilds_drive() {
    let shelf = Shelf::new(&[powered_off(ChangeReason::Persistent)]);
    let first = shelf.drive_at(0).unwrap().id;

    shelf.write_slot(0, SlotStatus::healthy());
    assert!(shelf.topology.object(first).is_none());

    // The next poll finds the slot populated and builds a fresh drive.
    shelf
        .topology
        .set_condition(shelf.enclosure, "update_slot_status")
        .unwrap();
    shelf.settle();
    let second = shelf.drive_at(0).unwrap();
    assert_ne!(second.id, first);
    assert_eq!(second.state, LifecycleState::Ready);
}

#[test]
fn unrecoverable_power_off_fails_drive() {
    let shelf = Shelf::new(&[powered_off(ChangeReason::Hardware)]);

    let drive = shelf.drive_at(0).unwrap();
    assert_eq!(drive.state, LifecycleState::Fail);
    assert_eq!(drive.death_reason, DeathReason::PoweredOffUnrecoverable);
}

#[test]
fn unrecoverable_bypass_fails_drive() {
    let slot = SlotStatus {
        phy_disabled: Some(ChangeReason::Hardware),
        ..SlotStatus::healthy()
    };
    let shelf = Shelf::new(&[slot]);

    let drive = shelf.drive_at(0).unwrap();
    assert_eq!(drive.state, LifecycleState::Fail);
    assert_eq!(drive.death_reason, DeathReason::BypassedUnrecoverable);
}

#[test]
fn disabled_edge_holds_drive_until_enabled() {
    let shelf = Shelf::new(&[SlotStatus::healthy()]);
    let drive = shelf.drive_at(0).unwrap().id;
    let enclosure = shelf.topology.require(shelf.enclosure).unwrap();
    let edge = enclosure.discovering().unwrap().client(0).unwrap().edge;

    edge.set_path_state(PathState::Disabled);
    shelf.settle();
    assert_eq!(
        shelf.topology.require(drive).unwrap().state(),
        LifecycleState::Activate
    );

    edge.set_path_state(PathState::Enabled);
    shelf.settle();
    assert_eq!(
        shelf.topology.require(drive).unwrap().state(),
        LifecycleState::Ready
    );
}

#[test]
fn enclosure_destroy_waits_for_its_drives() {
    let shelf = Shelf::new(&[SlotStatus::healthy(), SlotStatus::healthy()]);
    assert_eq!(shelf.drives().len(), 2);

    shelf.topology.set_condition(shelf.enclosure, "destroy").unwrap();
    shelf.settle();

    assert_eq!(shelf.topology.object_ids(), vec![shelf.port]);
    let port = shelf.topology.require(shelf.port).unwrap();
    assert_eq!(port.discovering().unwrap().client_count(), 0);
    assert_eq!(shelf.topology.pool().in_use(), 0);
}

#[test]
fn request_over_unattached_edge_is_refused() {
    let shelf = Shelf::new(&[]);
    let edge = DiscoveryEdge::new();
    let packet = shelf.topology.pool().allocate().unwrap();
    packet.push_operation(Operation::Discovery(DiscoveryOperation::new(
        DiscoveryOpcode::GetPortObjectId,
    )));

    let status = shelf.topology.send_over_edge(&edge, &packet);
    assert_eq!(status, Status::EdgeNotEnabled);
    assert_eq!(packet.status(), Status::EdgeNotEnabled);
}

#[test]
fn unhandled_request_fails_at_the_root() {
    let shelf = Shelf::new(&[]);
    let enclosure = shelf.topology.require(shelf.enclosure).unwrap();
    let packet = shelf.topology.pool().allocate().unwrap();
    packet.push_operation(Operation::Discovery(DiscoveryOperation::new(
        DiscoveryOpcode::PowerOn,
    )));

    let status = shelf
        .topology
        .send_over_edge(enclosure.discovered().unwrap().edge(), &packet);
    assert_eq!(status, Status::GenericFailure);
}

#[test]
fn invalid_path_state_event_is_rejected() {
    let shelf = Shelf::new(&[SlotStatus::healthy()]);
    let drive = shelf.topology.require(shelf.drive_at(0).unwrap().id).unwrap();
    let event = EdgeEvent {
        kind: EdgeEventKind::StateChange,
        binding: EdgeBinding::UNBOUND,
        path_state: PathState::Invalid,
        path_attributes: PathAttributes::empty(),
    };

    let result = drive.class().event_entry(&drive, &event);
    assert!(matches!(
        result,
        Err(TopologyError::UnexpectedPathState(PathState::Invalid))
    ));
    assert_eq!(drive.state(), LifecycleState::Ready);
}

#[test]
fn unknown_condition_name_is_an_error() {
    let shelf = Shelf::new(&[]);
    let result = shelf.topology.set_condition(shelf.port, "update_slot_status");
    assert!(matches!(result, Err(TopologyError::UnknownCondition(_))));
    assert_eq!(result.unwrap_err().status(), Status::NoObject);
}

#[test]
fn snapshot_serializes() {
    let shelf = Shelf::new(&[SlotStatus::healthy()]);
    let json = serde_json::to_value(shelf.topology.snapshot()).unwrap();
    assert_eq!(json["objects"].as_array().unwrap().len(), 3);
    assert_eq!(json["objects"][0]["class"], "port");
    assert_eq!(json["objects"][0]["state"], "ready");
    assert!(json["objects"][0].get("upstream").is_none());
}

#[test]
fn drive_lifecycle_is_reachable_through_the_object() {
    let shelf = Shelf::new(&[SlotStatus::healthy()]);
    let drive = shelf.topology.require(shelf.drive_at(0).unwrap().id).unwrap();
    assert!(!drive.lifecycle().is_pending());
    assert!(drive.terminator().is_empty());
    assert!(shelf.topology.next_deadline(drive.id()).is_some());
}
