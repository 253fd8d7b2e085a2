//! Object classes.
//!
//! Registries are layered the way the classes are:
//!
//! ```text
//!   base ─┬─ port         (discovering)
//!         └─ discovered ─┬─ enclosure (discovering)
//!                        └─ drive
//! ```
//!
//! Condition ids of the shared layers are fixed, so the actions and event
//! handlers of every class can name them directly.

pub mod base;
pub mod discovered;
pub mod discovering;
pub mod drive;
pub mod enclosure;
pub mod port;

use std::sync::Arc;

use shelf_core::{ClassId, Status};
use shelf_lifecycle::{ConditionId, LifecycleError, LifecycleObject};
use shelf_transport::{DiscoveryOpcode, DiscoveryResponse, Operation, Packet};

use crate::config::TopologyConfig;
use crate::object::{ManagedObject, ObjectClass};

pub use drive::DriveClass;
pub use enclosure::EnclosureClass;
pub use port::PortClass;

/// One instance of every built-in class.
#[derive(Clone)]
pub struct ClassSet {
    port: Arc<dyn ObjectClass>,
    enclosure: Arc<dyn ObjectClass>,
    drive: Arc<dyn ObjectClass>,
}

impl ClassSet {
    /// Build and verify the registries of every built-in class.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegistry` if a registry fails verification.
    pub fn new(config: &TopologyConfig) -> Result<Self, LifecycleError> {
        Ok(Self {
            port: Arc::new(PortClass::new()?),
            enclosure: Arc::new(EnclosureClass::new(config)?),
            drive: Arc::new(DriveClass::new(config)?),
        })
    }

    /// Replace the built-in class with the same class id.
    #[must_use]
    pub fn with_class(mut self, class: Arc<dyn ObjectClass>) -> Self {
        match class.class_id() {
            ClassId::Port => self.port = class,
            ClassId::Enclosure => self.enclosure = class,
            ClassId::Drive => self.drive = class,
        }
        self
    }

    /// The class registered for `class`.
    #[must_use]
    pub fn get(&self, class: ClassId) -> Arc<dyn ObjectClass> {
        match class {
            ClassId::Port => Arc::clone(&self.port),
            ClassId::Enclosure => Arc::clone(&self.enclosure),
            ClassId::Drive => Arc::clone(&self.drive),
        }
    }
}

impl std::fmt::Debug for ClassSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassSet").finish_non_exhaustive()
    }
}

pub(crate) fn expect_id(
    class: ClassId,
    name: &str,
    actual: ConditionId,
    expected: ConditionId,
) -> Result<(), LifecycleError> {
    if actual == expected {
        Ok(())
    } else {
        Err(LifecycleError::InvalidRegistry {
            class,
            reason: format!("{name} registered as {actual}, expected {expected}"),
        })
    }
}

// ============================================================================
// Helpers shared by condition actions and entry points
// ============================================================================

pub(crate) fn set_condition(object: &ManagedObject, id: ConditionId) {
    if let Err(e) = object.lifecycle().set(object.registry(), id) {
        tracing::error!(object_id = %object.id(), condition = %id, error = %e, "failed to set condition");
    }
}

pub(crate) fn clear_current(object: &ManagedObject) {
    if let Err(e) = object.lifecycle().clear_current() {
        tracing::error!(object_id = %object.id(), error = %e, "failed to clear condition");
    }
}

pub(crate) fn discovery_opcode(packet: &Packet) -> Option<DiscoveryOpcode> {
    packet.with_operation(|op| match op {
        Some(Operation::Discovery(discovery)) => Some(discovery.opcode),
        _ => None,
    })
}

/// Record `status` on the packet and its current operation, then complete
/// it.
pub(crate) fn finish_request(packet: &Packet, status: Status) -> Status {
    finish_with_response(packet, status, None)
}

pub(crate) fn finish_with_response(
    packet: &Packet,
    status: Status,
    response: Option<DiscoveryResponse>,
) -> Status {
    packet.with_operation(|op| match op {
        Some(Operation::Control(control)) => control.status = status,
        Some(Operation::Discovery(discovery)) => {
            discovery.status = status;
            if response.is_some() {
                discovery.response = response;
            }
        }
        None => {}
    });
    packet.set_status(status, 0);
    if let Err(e) = packet.complete() {
        tracing::error!(packet_id = %packet.id(), error = %e, "failed to complete request");
    }
    status
}
