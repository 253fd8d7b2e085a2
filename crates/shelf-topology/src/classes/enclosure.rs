//! The enclosure: discovered by a port, discovers the drives in its slots.
//!
//! Slot status comes from the attribute store. A timer condition re-reads
//! every slot, pushes the mapped path attributes onto the slot's client
//! edge, and creates drives for newly inserted slots.

use std::sync::Arc;

use shelf_core::LifecycleState::{Activate, Destroy, Ready};
use shelf_core::{ClassId, Status};
use shelf_lifecycle::{
    ClassRegistry, ClassRegistryBuilder, ConditionId, LifecycleError, LifecycleStatus,
    RotaryEntry, TransitionTable,
};
use shelf_transport::{DiscoveryOpcode, EdgeEvent, Packet, PathAttributes};

use super::{clear_current, discovered, discovering, discovery_opcode, finish_request};
use crate::config::TopologyConfig;
use crate::error::Result;
use crate::object::{ManagedObject, ObjectClass, TransportOutcome};
use crate::slot::{map_slot_status, SlotStatus, SLOT_MANAGED};
use crate::store::{
    Attribute, AttributeError, AttributeKey, AttributeResult, AttributeStore, AttributeValue,
    StoreSnapshot,
};
use crate::topology::Topology;

/// Re-read slot status and update client edges.
pub const UPDATE_SLOT_STATUS: ConditionId = ConditionId::new(10);

/// Enclosure class.
#[derive(Debug)]
pub struct EnclosureClass {
    registry: Arc<ClassRegistry<ManagedObject>>,
}

impl EnclosureClass {
    /// Build the enclosure registry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegistry` if verification fails.
    pub fn new(config: &TopologyConfig) -> std::result::Result<Self, LifecycleError> {
        let parent = discovered::registry(ClassId::Enclosure, config)?;
        let mut builder = ClassRegistryBuilder::derive(ClassId::Enclosure, &parent);
        let update = builder.timer(
            "update_slot_status",
            config.slot_poll_interval,
            TransitionTable::identity(),
            update_slot_status,
        );
        super::expect_id(ClassId::Enclosure, "update_slot_status", update, UPDATE_SLOT_STATUS)?;
        builder
            .rotary(Activate, &[RotaryEntry::preset(update)])
            .rotary(Ready, &[RotaryEntry::normal(update)]);
        discovering::register(&mut builder);
        Ok(Self {
            registry: Arc::new(builder.build()?),
        })
    }
}

impl ObjectClass for EnclosureClass {
    fn class_id(&self) -> ClassId {
        ClassId::Enclosure
    }

    fn registry(&self) -> &Arc<ClassRegistry<ManagedObject>> {
        &self.registry
    }

    fn control_entry(&self, object: &ManagedObject, packet: &Packet) -> Status {
        let snapshot = object.topology().map(|t| t.store().snapshot());
        discovering::control_entry(object, packet, &|slot| match &snapshot {
            Some(snapshot) => read_slot(snapshot, slot)
                .map(|status| map_slot_status(&status, None))
                .unwrap_or(PathAttributes::REMOVED | PathAttributes::NOT_PRESENT),
            None => PathAttributes::empty(),
        })
    }

    fn event_entry(&self, object: &ManagedObject, event: &EdgeEvent) -> Result<()> {
        discovered::handle_edge_event(object, event)
    }

    fn transport_entry(&self, object: &ManagedObject, packet: &Packet) -> TransportOutcome {
        let attribute = match discovery_opcode(packet) {
            Some(DiscoveryOpcode::PowerOn) => Attribute::PoweredOff,
            Some(DiscoveryOpcode::Unbypass) => Attribute::PhyDisabled,
            _ => return TransportOutcome::Traverse,
        };
        let Some(route) = packet.route().filter(|r| r.server_id == object.id()) else {
            return TransportOutcome::Traverse;
        };
        let Some(topology) = object.topology() else {
            finish_request(packet, Status::GenericFailure);
            return TransportOutcome::Handled;
        };

        let slot = route.server_index;
        let store = topology.store();
        let status = match store.set(AttributeKey::slot(attribute, slot), AttributeValue::Flag(false)) {
            Ok(()) => {
                store.commit();
                tracing::info!(object_id = %object.id(), slot, ?attribute, "slot restored");
                refresh_slot(object, &topology, slot);
                Status::Ok
            }
            Err(e) => {
                tracing::warn!(object_id = %object.id(), slot, error = %e, "slot restore failed");
                Status::GenericFailure
            }
        };
        finish_request(packet, status);
        TransportOutcome::Handled
    }
}

/// Status of `slot` in `snapshot`; a slot never written reads as empty.
fn read_slot(snapshot: &StoreSnapshot, slot: u32) -> AttributeResult<SlotStatus> {
    match snapshot.get(AttributeKey::slot(Attribute::Inserted, slot)) {
        Err(AttributeError::NotFound(_)) => Ok(SlotStatus::empty()),
        _ => SlotStatus::read(|key| snapshot.get(key), slot),
    }
}

/// Record `status` for `slot` and push the mapped attributes to its client.
fn apply_slot_status(object: &ManagedObject, slot: u32, status: SlotStatus) {
    let Some(discovering) = object.discovering() else {
        return;
    };
    let previous = discovering.last_status.lock().insert(slot, status);
    let attrs = map_slot_status(&status, previous.as_ref());
    if let Some(client) = discovering.client(slot) {
        if client.edge.update_path_attributes(SLOT_MANAGED, attrs) {
            tracing::debug!(
                object_id = %object.id(),
                slot,
                client_id = %client.client_id,
                path_attributes = ?attrs,
                "slot attributes changed"
            );
        }
    }
}

fn refresh_slot(object: &ManagedObject, topology: &Topology, slot: u32) {
    match read_slot(&topology.store().snapshot(), slot) {
        Ok(status) => apply_slot_status(object, slot, status),
        Err(e) => tracing::warn!(object_id = %object.id(), slot, error = %e, "cannot read slot"),
    }
}

fn update_slot_status(object: &Arc<ManagedObject>, _: &Packet) -> LifecycleStatus {
    let Some(topology) = object.topology() else {
        clear_current(object);
        return LifecycleStatus::Done;
    };
    let snapshot = topology.store().snapshot();
    let slots = snapshot
        .get(AttributeKey::enclosure(Attribute::SlotCount))
        .and_then(AttributeValue::as_count)
        .unwrap_or(0);

    for slot in 0..slots {
        let status = match read_slot(&snapshot, slot) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(object_id = %object.id(), slot, error = %e, "cannot read slot");
                continue;
            }
        };
        apply_slot_status(object, slot, status);

        let has_client = object
            .discovering()
            .is_some_and(|d| d.client(slot).is_some());
        if status.inserted && !has_client && object.state() != Destroy {
            if let Err(e) = topology.discover_child(object, ClassId::Drive, slot) {
                tracing::warn!(object_id = %object.id(), slot, error = %e, "drive discovery failed");
            }
        }
    }

    clear_current(object);
    LifecycleStatus::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeReason;

    #[test]
    fn slot_poll_runs_in_activate_and_ready() {
        let class = EnclosureClass::new(&TopologyConfig::default()).unwrap();
        let registry = class.registry();
        assert!(registry.in_rotary(Activate, UPDATE_SLOT_STATUS));
        assert!(registry.in_rotary(Ready, UPDATE_SLOT_STATUS));
        assert!(registry.in_rotary(Destroy, discovered::DETACH_DISCOVERY_EDGE));
        assert!(registry.find("wait_for_clients_detached").is_some());
    }

    #[test]
    fn unwritten_slot_reads_empty() {
        let snapshot = StoreSnapshot::default();
        assert_eq!(read_slot(&snapshot, 3).unwrap(), SlotStatus::empty());
    }

    #[test]
    fn written_slot_reads_back() {
        let store = crate::store::InMemoryAttributeStore::new();
        let status = SlotStatus {
            powered_off: Some(ChangeReason::NonPersistent),
            ..SlotStatus::healthy()
        };
        for (key, value) in status.entries(2) {
            store.set(key, value).unwrap();
        }
        store.commit();
        assert_eq!(read_slot(&store.snapshot(), 2).unwrap(), status);
    }
}
