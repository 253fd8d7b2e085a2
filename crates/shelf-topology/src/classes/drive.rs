//! A drive behind an enclosure slot.

use std::sync::Arc;

use shelf_core::{ClassId, Status};
use shelf_lifecycle::{ClassRegistry, LifecycleError};
use shelf_transport::{EdgeEvent, Packet};

use super::{discovered, finish_request};
use crate::config::TopologyConfig;
use crate::error::Result;
use crate::object::{ManagedObject, ObjectClass, TransportOutcome};

/// Drive class. Drives discover nothing, so every request that reaches
/// one travels on toward the port.
#[derive(Debug)]
pub struct DriveClass {
    registry: Arc<ClassRegistry<ManagedObject>>,
}

impl DriveClass {
    /// Build the drive registry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegistry` if verification fails.
    pub fn new(config: &TopologyConfig) -> std::result::Result<Self, LifecycleError> {
        Ok(Self {
            registry: Arc::new(discovered::registry(ClassId::Drive, config)?),
        })
    }
}

impl ObjectClass for DriveClass {
    fn class_id(&self) -> ClassId {
        ClassId::Drive
    }

    fn registry(&self) -> &Arc<ClassRegistry<ManagedObject>> {
        &self.registry
    }

    fn control_entry(&self, object: &ManagedObject, packet: &Packet) -> Status {
        tracing::warn!(object_id = %object.id(), "drive does not serve edges");
        finish_request(packet, Status::GenericFailure)
    }

    fn event_entry(&self, object: &ManagedObject, event: &EdgeEvent) -> Result<()> {
        discovered::handle_edge_event(object, event)
    }

    fn transport_entry(&self, _object: &ManagedObject, _packet: &Packet) -> TransportOutcome {
        TransportOutcome::Traverse
    }
}
