//! The server side of discovery edges.
//!
//! A discovering object keeps the edges of the objects it found, keyed by
//! server index. It leaves DESTROY only after every client detached.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use shelf_core::LifecycleState::Destroy;
use shelf_core::Status;
use shelf_lifecycle::{
    ClassRegistryBuilder, ConditionId, LifecycleObject, LifecycleStatus, RotaryEntry,
    TransitionTable,
};
use shelf_transport::{ControlRequest, Operation, Packet, PathAttributes, PathState};

use super::{clear_current, finish_request};
use crate::object::{ClientEdge, ManagedObject};

/// Register the discovering conditions on top of a parent registry.
pub fn register(builder: &mut ClassRegistryBuilder<ManagedObject>) -> ConditionId {
    let wait = builder.condition(
        "wait_for_clients_detached",
        TransitionTable::identity(),
        wait_for_clients_detached,
    );
    builder.rotary(Destroy, &[RotaryEntry::preset(wait)]);
    wait
}

fn wait_for_clients_detached(object: &Arc<ManagedObject>, _: &Packet) -> LifecycleStatus {
    let Some(discovering) = object.discovering() else {
        clear_current(object);
        return LifecycleStatus::Done;
    };

    if !discovering.clients_marked_gone.swap(true, Ordering::AcqRel) {
        let clients = discovering.clients();
        tracing::info!(
            object_id = %object.id(),
            clients = clients.len(),
            "marking client edges gone"
        );
        for client in clients.values() {
            client.edge.set_path_state(PathState::Gone);
        }
    }

    let remaining = discovering.client_count();
    if remaining == 0 {
        clear_current(object);
    } else {
        tracing::debug!(object_id = %object.id(), remaining, "waiting for clients to detach");
    }
    LifecycleStatus::Done
}

/// Serve attach and detach requests.
///
/// `initial` gives the path attributes a new edge starts with at its server
/// index.
pub fn control_entry(
    object: &ManagedObject,
    packet: &Packet,
    initial: &dyn Fn(u32) -> PathAttributes,
) -> Status {
    let Some(discovering) = object.discovering() else {
        return finish_request(packet, Status::GenericFailure);
    };
    let request = packet.with_operation(|op| match op {
        Some(Operation::Control(control)) => Some(control.request.clone()),
        _ => None,
    });

    let status = match request {
        Some(ControlRequest::AttachEdge { edge, binding }) => {
            let mut clients = discovering.clients.lock();
            if clients.contains_key(&binding.server_index) {
                tracing::warn!(
                    object_id = %object.id(),
                    server_index = binding.server_index,
                    "server index already attached"
                );
                Status::Busy
            } else {
                let attrs = initial(binding.server_index);
                clients.insert(
                    binding.server_index,
                    ClientEdge {
                        client_id: binding.client_id,
                        edge: Arc::clone(&edge),
                    },
                );
                drop(clients);
                // The attach notifies the client; no lock may be held here.
                match edge.attach(binding, PathState::Enabled, attrs) {
                    Ok(()) => {
                        tracing::info!(
                            object_id = %object.id(),
                            client_id = %binding.client_id,
                            server_index = binding.server_index,
                            path_attributes = ?attrs,
                            "client edge attached"
                        );
                        Status::Ok
                    }
                    Err(e) => {
                        tracing::warn!(object_id = %object.id(), error = %e, "edge attach failed");
                        discovering.clients.lock().remove(&binding.server_index);
                        Status::GenericFailure
                    }
                }
            }
        }
        Some(ControlRequest::DetachEdge { binding }) => {
            let removed = {
                let mut clients = discovering.clients.lock();
                match clients.get(&binding.server_index) {
                    Some(client) if client.client_id == binding.client_id => {
                        clients.remove(&binding.server_index)
                    }
                    _ => None,
                }
            };
            if let Some(client) = removed {
                client.edge.reset();
                discovering.last_status.lock().remove(&binding.server_index);
                tracing::info!(
                    object_id = %object.id(),
                    client_id = %binding.client_id,
                    server_index = binding.server_index,
                    "client edge detached"
                );
            }
            object.lifecycle().reschedule(Duration::ZERO);
            Status::Ok
        }
        None => Status::NoObject,
    };
    finish_request(packet, status)
}
