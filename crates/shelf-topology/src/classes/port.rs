//! The port: root of a discovery tree.

use std::sync::Arc;

use shelf_core::{ClassId, Status};
use shelf_lifecycle::{ClassRegistry, ClassRegistryBuilder, LifecycleError};
use shelf_transport::{DiscoveryOpcode, DiscoveryResponse, EdgeEvent, Packet, PathAttributes};

use super::{base, discovering, discovery_opcode, finish_with_response};
use crate::error::Result;
use crate::object::{ManagedObject, ObjectClass, TransportOutcome};

/// Port class.
#[derive(Debug)]
pub struct PortClass {
    registry: Arc<ClassRegistry<ManagedObject>>,
}

impl PortClass {
    /// Build the port registry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegistry` if verification fails.
    pub fn new() -> std::result::Result<Self, LifecycleError> {
        let parent = base::registry(ClassId::Port)?;
        let mut builder = ClassRegistryBuilder::derive(ClassId::Port, &parent);
        discovering::register(&mut builder);
        Ok(Self {
            registry: Arc::new(builder.build()?),
        })
    }
}

impl ObjectClass for PortClass {
    fn class_id(&self) -> ClassId {
        ClassId::Port
    }

    fn registry(&self) -> &Arc<ClassRegistry<ManagedObject>> {
        &self.registry
    }

    fn control_entry(&self, object: &ManagedObject, packet: &Packet) -> Status {
        discovering::control_entry(object, packet, &|_| PathAttributes::empty())
    }

    fn event_entry(&self, _object: &ManagedObject, _event: &EdgeEvent) -> Result<()> {
        Ok(())
    }

    fn transport_entry(&self, object: &ManagedObject, packet: &Packet) -> TransportOutcome {
        match discovery_opcode(packet) {
            Some(DiscoveryOpcode::GetPortObjectId) => {
                finish_with_response(
                    packet,
                    Status::Ok,
                    Some(DiscoveryResponse::PortObjectId(object.id())),
                );
                TransportOutcome::Handled
            }
            _ => TransportOutcome::Traverse,
        }
    }
}
