//! Conditions and event handling of objects with an upstream discovery edge.
//!
//! ```text
//!   SPECIALIZE  get_port_object_id        (preset)
//!   ACTIVATE    discovery_edge_not_ready  (preset; READY -> ACTIVATE)
//!   READY       discovery_poll            (timer)
//!   DESTROY     detach_discovery_edge     (preset)
//! ```
//!
//! Requests these conditions issue are subpackets of the monitor packet.
//! The monitor packet sits on the object's terminator queue while a
//! subpacket is out, so tearing the object down cancels the whole chain.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use shelf_core::LifecycleState::{Activate, Destroy, Ready, Specialize};
use shelf_core::{ClassId, DeathReason, Status};
use shelf_lifecycle::{
    ClassRegistry, ClassRegistryBuilder, ConditionId, LifecycleError, LifecycleObject,
    LifecycleStatus, RotaryEntry, TransitionTable,
};
use shelf_transport::{
    Completion, DiscoveryOpcode, DiscoveryOperation, DiscoveryResponse, EdgeEvent, Operation,
    Packet, PathAttributes, PathState,
};

use super::{base, clear_current, finish_request, set_condition};
use crate::config::TopologyConfig;
use crate::error::{Result, TopologyError};
use crate::object::ManagedObject;
use crate::topology::Topology;

/// Learn the object id of the port at the root of the tree.
pub const GET_PORT_OBJECT_ID: ConditionId = ConditionId::new(6);
/// The upstream edge is not usable yet.
pub const DISCOVERY_EDGE_NOT_READY: ConditionId = ConditionId::new(7);
/// Periodic re-check of the upstream edge while READY.
pub const DISCOVERY_POLL: ConditionId = ConditionId::new(8);
/// Detach the upstream edge on the way out.
pub const DETACH_DISCOVERY_EDGE: ConditionId = ConditionId::new(9);

/// Registry with the base and discovered conditions.
///
/// # Errors
///
/// Returns `InvalidRegistry` if verification fails.
pub fn registry(
    class: ClassId,
    config: &TopologyConfig,
) -> std::result::Result<ClassRegistry<ManagedObject>, LifecycleError> {
    let parent = base::registry(class)?;
    let mut b = ClassRegistryBuilder::derive(class, &parent);

    let get = b.condition(
        "get_port_object_id",
        TransitionTable::identity(),
        get_port_object_id,
    );
    let not_ready = b.condition(
        "discovery_edge_not_ready",
        TransitionTable::identity().on(Ready, Activate),
        discovery_edge_not_ready,
    );
    let poll = b.timer(
        "discovery_poll",
        config.discovery_poll_interval,
        TransitionTable::identity(),
        discovery_poll,
    );
    let detach = b.condition(
        "detach_discovery_edge",
        TransitionTable::identity(),
        detach_discovery_edge,
    );
    super::expect_id(class, "get_port_object_id", get, GET_PORT_OBJECT_ID)?;
    super::expect_id(class, "discovery_edge_not_ready", not_ready, DISCOVERY_EDGE_NOT_READY)?;
    super::expect_id(class, "discovery_poll", poll, DISCOVERY_POLL)?;
    super::expect_id(class, "detach_discovery_edge", detach, DETACH_DISCOVERY_EDGE)?;

    b.rotary(Specialize, &[RotaryEntry::preset(get)])
        .rotary(Activate, &[RotaryEntry::preset(not_ready)])
        .rotary(Ready, &[RotaryEntry::normal(poll)])
        .rotary(Destroy, &[RotaryEntry::preset(detach)]);
    b.build()
}

// ============================================================================
// Edge events
// ============================================================================

/// Turn an upstream edge event into a lifecycle condition.
///
/// # Errors
///
/// Returns `UnexpectedPathState` for an INVALID path state; no condition
/// changes in that case.
pub fn handle_edge_event(object: &ManagedObject, event: &EdgeEvent) -> Result<()> {
    let condition = match event.path_state {
        PathState::Enabled => {
            let attrs = event.path_attributes;
            if attrs.requires_destroy() {
                Some(base::DESTROY)
            } else if attrs.is_blocking() {
                Some(DISCOVERY_EDGE_NOT_READY)
            } else {
                None
            }
        }
        PathState::Disabled | PathState::Broken | PathState::Slumber => {
            Some(DISCOVERY_EDGE_NOT_READY)
        }
        PathState::Gone => Some(base::DESTROY),
        PathState::Invalid => return Err(TopologyError::UnexpectedPathState(event.path_state)),
    };

    tracing::debug!(
        object_id = %object.id(),
        path_state = %event.path_state,
        path_attributes = ?event.path_attributes,
        "discovery edge event"
    );
    match condition {
        Some(id) => object.lifecycle().set(object.registry(), id)?,
        None => object.lifecycle().reschedule(Duration::ZERO),
    }
    Ok(())
}

// ============================================================================
// Condition actions
// ============================================================================

type SubpacketDone = fn(&ManagedObject, &Topology, Status, Option<DiscoveryResponse>);

fn get_port_object_id(object: &Arc<ManagedObject>, packet: &Packet) -> LifecycleStatus {
    let (Some(topology), Some(discovered)) = (object.topology(), object.discovered()) else {
        clear_current(object);
        return LifecycleStatus::Done;
    };
    if discovered.port_object_id().is_some() {
        clear_current(object);
        return LifecycleStatus::Done;
    }
    issue_subpacket(
        object,
        &topology,
        packet,
        DiscoveryOpcode::GetPortObjectId,
        port_object_id_done,
    )
}

fn port_object_id_done(
    object: &ManagedObject,
    topology: &Topology,
    status: Status,
    response: Option<DiscoveryResponse>,
) {
    match (status, response) {
        (Status::Ok, Some(DiscoveryResponse::PortObjectId(port))) => {
            if let Some(discovered) = object.discovered() {
                *discovered.port_object_id.lock() = Some(port);
            }
            tracing::debug!(object_id = %object.id(), port_object_id = %port, "port object id learned");
            clear_current(object);
        }
        (status, _) => {
            tracing::debug!(object_id = %object.id(), %status, "port object id not available");
            object.lifecycle().reschedule(topology.config().corrective_retry);
        }
    }
}

fn discovery_edge_not_ready(object: &Arc<ManagedObject>, packet: &Packet) -> LifecycleStatus {
    let (Some(topology), Some(discovered)) = (object.topology(), object.discovered()) else {
        clear_current(object);
        return LifecycleStatus::Done;
    };
    let Ok(attrs) = discovered.edge().path_attributes() else {
        tracing::debug!(
            object_id = %object.id(),
            path_state = %discovered.edge().path_state(),
            "discovery edge not enabled"
        );
        return LifecycleStatus::Done;
    };

    if attrs.intersects(PathAttributes::UNRECOVERABLE) {
        let reason = if attrs.contains(PathAttributes::POWERED_OFF_UNRECOV) {
            DeathReason::PoweredOffUnrecoverable
        } else {
            DeathReason::BypassedUnrecoverable
        };
        tracing::warn!(object_id = %object.id(), ?attrs, ?reason, "unrecoverable discovery edge");
        object.lifecycle().set_death_reason(reason);
        set_condition(object, base::FAIL);
        clear_current(object);
        return LifecycleStatus::Done;
    }
    if attrs.requires_destroy() {
        set_condition(object, base::DESTROY);
        clear_current(object);
        return LifecycleStatus::Done;
    }

    if attrs.contains(PathAttributes::POWERED_OFF_NONPERSIST) {
        return corrective(object, &topology, packet, DiscoveryOpcode::PowerOn);
    }
    if attrs.intersects(PathAttributes::POWERED_OFF) {
        tracing::debug!(object_id = %object.id(), ?attrs, "discovery edge powered off");
        return LifecycleStatus::Done;
    }
    if attrs.contains(PathAttributes::BYPASSED_NONPERSIST) {
        return corrective(object, &topology, packet, DiscoveryOpcode::Unbypass);
    }
    if attrs.is_blocking() {
        tracing::debug!(object_id = %object.id(), ?attrs, "discovery edge blocked");
        return LifecycleStatus::Done;
    }

    clear_current(object);
    object.lifecycle().reschedule(Duration::ZERO);
    LifecycleStatus::Done
}

fn corrective(
    object: &Arc<ManagedObject>,
    topology: &Arc<Topology>,
    packet: &Packet,
    opcode: DiscoveryOpcode,
) -> LifecycleStatus {
    let retry = topology.config().corrective_retry;
    if let Some(discovered) = object.discovered() {
        let mut last = discovered.last_corrective.lock();
        if let Some((previous, at)) = *last {
            let elapsed = at.elapsed();
            if previous == opcode && elapsed < retry {
                return LifecycleStatus::Reschedule(retry - elapsed);
            }
        }
        *last = Some((opcode, Instant::now()));
    }
    tracing::info!(object_id = %object.id(), ?opcode, "issuing corrective request");
    issue_subpacket(object, topology, packet, opcode, corrective_done)
}

fn corrective_done(
    object: &ManagedObject,
    topology: &Topology,
    status: Status,
    _: Option<DiscoveryResponse>,
) {
    if !status.is_ok() {
        tracing::warn!(object_id = %object.id(), %status, "corrective request failed");
        object.lifecycle().reschedule(topology.config().corrective_retry);
        return;
    }
    let settled = object
        .discovered()
        .and_then(|d| d.edge().path_attributes().ok())
        .is_some_and(|attrs| !attrs.is_blocking() && !attrs.requires_destroy());
    if settled {
        clear_current(object);
    }
    object.lifecycle().reschedule(Duration::ZERO);
}

fn discovery_poll(object: &Arc<ManagedObject>, _: &Packet) -> LifecycleStatus {
    if let Some(discovered) = object.discovered() {
        match discovered.edge().path_attributes() {
            Ok(attrs) if attrs.requires_destroy() => set_condition(object, base::DESTROY),
            Ok(attrs) if !attrs.is_blocking() => {}
            _ => set_condition(object, DISCOVERY_EDGE_NOT_READY),
        }
    }
    clear_current(object);
    LifecycleStatus::Done
}

fn detach_discovery_edge(object: &Arc<ManagedObject>, _: &Packet) -> LifecycleStatus {
    if let (Some(topology), Some(discovered)) = (object.topology(), object.discovered()) {
        if let Err(e) = discovered.edge().detach(topology.as_ref(), topology.pool()) {
            tracing::error!(object_id = %object.id(), error = %e, "failed to detach discovery edge");
        }
    }
    clear_current(object);
    LifecycleStatus::Done
}

// ============================================================================
// Subpackets
// ============================================================================

fn issue_subpacket(
    object: &Arc<ManagedObject>,
    topology: &Arc<Topology>,
    master: &Packet,
    opcode: DiscoveryOpcode,
    done: SubpacketDone,
) -> LifecycleStatus {
    let retry = topology.config().corrective_retry;
    let Some(discovered) = object.discovered() else {
        clear_current(object);
        return LifecycleStatus::Done;
    };

    let child = match topology.pool().allocate() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(object_id = %object.id(), ?opcode, error = %e, "cannot allocate request");
            finish_request(master, Status::GenericFailure);
            return LifecycleStatus::Reschedule(retry);
        }
    };
    child.push_operation(Operation::Discovery(DiscoveryOperation::new(opcode)));

    if let Err(e) = master.add_subpacket(&child) {
        tracing::error!(object_id = %object.id(), ?opcode, error = %e, "cannot link request");
        release(topology, &child);
        finish_request(master, Status::GenericFailure);
        return LifecycleStatus::Reschedule(retry);
    }
    object.terminator().add(master);

    let weak_object: Weak<ManagedObject> = Arc::downgrade(object);
    let weak_topology: Weak<Topology> = Arc::downgrade(topology);
    let master_handle = master.clone();
    let pushed = child.push_completion(move |child, status| {
        let (status, response) = match child.pop_operation() {
            Some(Operation::Discovery(op)) if status.is_ok() => (op.status, op.response),
            _ => (status, None),
        };
        if let Err(e) = child.remove_subpacket() {
            tracing::warn!(packet_id = %child.id(), error = %e, "subpacket was not linked");
        }
        child.set_status(status, child.qualifier());
        child.copy_status_to(&master_handle);

        let object = weak_object.upgrade();
        if let Some(topology) = weak_topology.upgrade() {
            release(&topology, child);
            if let Some(object) = &object {
                done(object, &topology, status, response);
            }
        }
        if let Some(object) = &object {
            object.terminator().remove(&master_handle);
        }
        if let Err(e) = master_handle.complete() {
            tracing::error!(packet_id = %master_handle.id(), error = %e, "failed to complete monitor packet");
        }
        Completion::Continue
    });

    if let Err(e) = pushed {
        tracing::error!(object_id = %object.id(), error = %e, "cannot arm request completion");
        let _ = child.remove_subpacket();
        object.terminator().remove(master);
        release(topology, &child);
        finish_request(master, Status::GenericFailure);
        return LifecycleStatus::Reschedule(retry);
    }

    topology.send_over_edge(discovered.edge(), &child);
    LifecycleStatus::Pending
}

fn release(topology: &Topology, packet: &Packet) {
    if let Err(e) = topology.pool().release(packet) {
        tracing::warn!(packet_id = %packet.id(), error = %e, "failed to release request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_ids_follow_base() {
        let registry = registry(ClassId::Drive, &TopologyConfig::default()).unwrap();
        assert_eq!(registry.condition_count(), 10);
        assert_eq!(registry.find("discovery_poll"), Some(DISCOVERY_POLL));
        assert_eq!(
            registry
                .require(DISCOVERY_EDGE_NOT_READY)
                .unwrap()
                .transitions()
                .target(Ready),
            Activate
        );
        assert!(registry.in_rotary(Destroy, DETACH_DISCOVERY_EDGE));
    }
}
