//! Mock classes for testing.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use shelf_core::{ClassId, ObjectId, Status};
use shelf_lifecycle::{ClassRegistry, LifecycleError};
use shelf_transport::{DiscoveryOpcode, DiscoveryResponse, EdgeEvent, Packet};

use crate::classes::{discovery_opcode, finish_request, finish_with_response, PortClass};
use crate::error::Result;
use crate::object::{ManagedObject, ObjectClass, TransportOutcome};
use crate::topology::Topology;

struct ParkedRequest {
    topology: Weak<Topology>,
    port_id: ObjectId,
    packet: Packet,
}

impl ParkedRequest {
    fn unpark(&self) {
        if let Some(port) = self.topology.upgrade().and_then(|t| t.object(self.port_id)) {
            port.terminator().remove(&self.packet);
        }
    }
}

type Parked = Arc<Mutex<Vec<ParkedRequest>>>;

/// A port that parks port-id requests on its terminator queue instead of
/// answering them, until [`HoldingPortClass::release_all`] is called.
///
/// Parked requests can be cancelled; the cancel hook takes them off the
/// queue and completes them with `Canceled`.
pub struct HoldingPortClass {
    inner: PortClass,
    parked: Parked,
}

impl HoldingPortClass {
    /// Build the holding port.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegistry` if the port registry fails verification.
    pub fn new() -> std::result::Result<Self, LifecycleError> {
        Ok(Self {
            inner: PortClass::new()?,
            parked: Arc::default(),
        })
    }

    /// Number of parked requests.
    #[must_use]
    pub fn parked_count(&self) -> usize {
        self.parked.lock().len()
    }

    /// Answer every parked request with its port's id.
    ///
    /// Returns the number of requests answered.
    pub fn release_all(&self) -> usize {
        let parked: Vec<ParkedRequest> = std::mem::take(&mut *self.parked.lock());
        let count = parked.len();
        for request in parked {
            request.unpark();
            finish_with_response(
                &request.packet,
                Status::Ok,
                Some(DiscoveryResponse::PortObjectId(request.port_id)),
            );
        }
        count
    }
}

impl std::fmt::Debug for HoldingPortClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HoldingPortClass")
            .field("parked", &self.parked_count())
            .finish_non_exhaustive()
    }
}

impl ObjectClass for HoldingPortClass {
    fn class_id(&self) -> ClassId {
        ClassId::Port
    }

    fn registry(&self) -> &Arc<ClassRegistry<ManagedObject>> {
        self.inner.registry()
    }

    fn control_entry(&self, object: &ManagedObject, packet: &Packet) -> Status {
        self.inner.control_entry(object, packet)
    }

    fn event_entry(&self, object: &ManagedObject, event: &EdgeEvent) -> Result<()> {
        self.inner.event_entry(object, event)
    }

    fn transport_entry(&self, object: &ManagedObject, packet: &Packet) -> TransportOutcome {
        if discovery_opcode(packet) != Some(DiscoveryOpcode::GetPortObjectId) {
            return self.inner.transport_entry(object, packet);
        }

        let topology = object
            .topology()
            .map(|t| Arc::downgrade(&t))
            .unwrap_or_default();
        let parked = Arc::clone(&self.parked);
        packet.set_cancel_function(move |packet| {
            let request = {
                let mut parked = parked.lock();
                parked
                    .iter()
                    .position(|r| r.packet.same(packet))
                    .map(|i| parked.swap_remove(i))
            };
            if let Some(request) = request {
                request.unpark();
            }
            finish_request(packet, Status::Canceled);
        });
        object.terminator().add(packet);
        self.parked.lock().push(ParkedRequest {
            topology,
            port_id: object.id(),
            packet: packet.clone(),
        });
        TransportOutcome::Handled
    }
}
