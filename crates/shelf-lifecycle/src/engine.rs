//! The lifecycle pass.
//!
//! One pass ("crank") of an object evaluates its rotary against its active
//! conditions until nothing is left to do or a condition hands work off:
//!
//! ```text
//!   fire due timers
//!   loop
//!     DESTROY / FAIL requested?       -> transition
//!     active work condition in rotary -> run its action
//!       Pending                       -> stop; resumed by the monitor packet
//!     other request active?           -> transition (OFFLINE wins)
//!     otherwise                       -> done
//! ```
//!
//! Passes of one object never overlap. Passes of different objects may run
//! on different threads.

use std::sync::{Arc, Weak};
use std::time::Instant;

use shelf_core::LifecycleState;
use shelf_transport::{Completion, Packet, PacketFlags};

use crate::condition::{ConditionId, LifecycleStatus};
use crate::error::{LifecycleError, Result};
use crate::instance::{ConditionSet, ObjectLifecycle, PassState, Step};
use crate::registry::ClassRegistry;

/// Upper bound on transitions taken in a single pass.
pub const MAX_TRANSITIONS_PER_PASS: usize = 8;

/// An object the engine can drive.
pub trait LifecycleObject: Send + Sync + Sized + 'static {
    /// Per-object lifecycle state.
    fn lifecycle(&self) -> &ObjectLifecycle;

    /// Class registry of the object.
    fn registry(&self) -> &ClassRegistry<Self>;

    /// Packet handed to condition actions.
    fn monitor_packet(&self) -> &Packet;

    /// Called after each state change, outside any engine lock.
    fn on_transition(&self, _from: LifecycleState, _to: LifecycleState) {}

    /// Cancel whatever a pending condition is waiting on.
    ///
    /// Called when DESTROY or FAIL is requested while a pass is pending.
    fn cancel_outstanding(&self) {}
}

/// Run one lifecycle pass of `object`.
///
/// # Errors
///
/// Returns `Transport` if the monitor packet is still attached to other
/// work and `TransitionLoop` if the pass does not settle.
pub fn crank<O: LifecycleObject>(object: &Arc<O>) -> Result<LifecycleStatus> {
    crank_at(object, Instant::now())
}

/// Run one lifecycle pass with an explicit clock reading.
///
/// # Errors
///
/// See [`crank`].
pub fn crank_at<O: LifecycleObject>(object: &Arc<O>, now: Instant) -> Result<LifecycleStatus> {
    if !begin_pass(object.as_ref(), now) {
        return Ok(LifecycleStatus::Pending);
    }
    let result = run_pass(object, now);
    if result.is_err() {
        object.lifecycle().lock().pass = PassState::Idle;
    }
    result
}

fn begin_pass<O: LifecycleObject>(object: &O, now: Instant) -> bool {
    let lifecycle = object.lifecycle();
    let registry = object.registry();

    let needs_cancel = {
        let inner = lifecycle.lock();
        match inner.pass {
            PassState::Running { .. } => return false,
            PassState::Pending { .. } => {
                if inner.urgent_request(registry).is_none() {
                    return false;
                }
                true
            }
            PassState::Idle => false,
        }
    };

    if needs_cancel {
        tracing::info!(
            object_id = %lifecycle.object_id(),
            "urgent request while pending, canceling outstanding work"
        );
        object.cancel_outstanding();
    }

    let mut inner = lifecycle.lock();
    if inner.pass != PassState::Idle {
        return false;
    }
    inner.pass = PassState::Running {
        current: None,
        resumed: false,
    };
    inner.fire_due_timers(registry, now);
    true
}

fn run_pass<O: LifecycleObject>(object: &Arc<O>, now: Instant) -> Result<LifecycleStatus> {
    let lifecycle = object.lifecycle();
    let registry = object.registry();
    let mut ran = ConditionSet::new(registry.condition_count());
    let mut transitions = 0;

    loop {
        let step = {
            let mut inner = lifecycle.lock();
            match inner.next_step(registry, &ran) {
                Step::Idle => return Ok(inner.finish_pass()),
                step => step,
            }
        };

        match step {
            Step::Transition(to) => {
                transitions += 1;
                if transitions > MAX_TRANSITIONS_PER_PASS {
                    tracing::error!(
                        object_id = %lifecycle.object_id(),
                        transitions,
                        "lifecycle did not settle"
                    );
                    return Err(LifecycleError::TransitionLoop(transitions));
                }
                let from = lifecycle.lock().transition(registry, to, now);
                ran.clear();
                tracing::info!(
                    object_id = %lifecycle.object_id(),
                    class = %registry.class(),
                    %from,
                    %to,
                    "lifecycle transition"
                );
                object.on_transition(from, to);
            }
            Step::Run(id) => {
                ran.insert(id);
                if run_condition(object, id)? == LifecycleStatus::Pending {
                    return Ok(LifecycleStatus::Pending);
                }
            }
            Step::Idle => {}
        }
    }
}

fn run_condition<O: LifecycleObject>(object: &Arc<O>, id: ConditionId) -> Result<LifecycleStatus> {
    let lifecycle = object.lifecycle();
    let condition = object.registry().require(id)?;

    let Some(action) = condition.action() else {
        lifecycle.lock().conditions.remove(id);
        return Ok(LifecycleStatus::Done);
    };

    let packet = object.monitor_packet();
    packet.reuse()?;
    packet.set_flags(PacketFlags::MONITOR_OP);

    lifecycle.lock().pass = PassState::Running {
        current: Some(id),
        resumed: false,
    };

    let weak: Weak<O> = Arc::downgrade(object);
    let token = packet.push_completion(move |_, _| {
        if let Some(object) = weak.upgrade() {
            object.lifecycle().resume(id);
        }
        Completion::Continue
    })?;

    tracing::debug!(
        object_id = %lifecycle.object_id(),
        condition = condition.name(),
        "running condition"
    );
    let status = action(object, packet);

    let mut inner = lifecycle.lock();
    let resumed = matches!(inner.pass, PassState::Running { resumed: true, .. });
    if status == LifecycleStatus::Pending && !resumed {
        inner.pass = PassState::Pending { current: id };
        return Ok(LifecycleStatus::Pending);
    }

    inner.pass = PassState::Running {
        current: None,
        resumed: false,
    };
    if let LifecycleStatus::Reschedule(delay) = status {
        inner.request_delay(delay);
    }
    let still_set = inner.conditions.contains(id);
    drop(inner);

    if !resumed {
        // The frame never ran; withdraw it so the packet can be reused.
        if let Err(e) = packet.cancel_completion(token) {
            tracing::debug!(
                object_id = %lifecycle.object_id(),
                condition = condition.name(),
                error = %e,
                "resume frame already gone"
            );
        }
    }
    if still_set && status != LifecycleStatus::Pending {
        tracing::warn!(
            object_id = %lifecycle.object_id(),
            condition = condition.name(),
            "condition not cleared"
        );
    }
    Ok(LifecycleStatus::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{RotaryEntry, TransitionTable};
    use crate::instance::RescheduleHook;
    use crate::registry::ClassRegistryBuilder;
    use shelf_core::LifecycleState::{Activate, Destroy, Ready, Specialize};
    use shelf_core::{ClassId, ObjectId, PacketId};

    struct Toy {
        registry: Arc<ClassRegistry<Toy>>,
        lifecycle: ObjectLifecycle,
        packet: Packet,
    }

    impl LifecycleObject for Toy {
        fn lifecycle(&self) -> &ObjectLifecycle {
            &self.lifecycle
        }

        fn registry(&self) -> &ClassRegistry<Self> {
            &self.registry
        }

        fn monitor_packet(&self) -> &Packet {
            &self.packet
        }
    }

    fn setup() -> Arc<Toy> {
        let mut builder = ClassRegistryBuilder::new(ClassId::Port);
        let activate =
            builder.placeholder("activate", TransitionTable::identity().on(Specialize, Activate));
        let ready = builder.placeholder("ready", TransitionTable::identity().on(Activate, Ready));
        builder.placeholder("destroy", TransitionTable::always(Destroy));
        builder
            .rotary(Specialize, &[RotaryEntry::preset(activate)])
            .rotary(Activate, &[RotaryEntry::preset(ready)]);
        let registry = Arc::new(builder.build().unwrap());
        let hook: RescheduleHook = Arc::new(|_, _| {});
        Arc::new(Toy {
            lifecycle: ObjectLifecycle::new(ObjectId::new(1), &registry, hook),
            registry,
            packet: Packet::new(PacketId::new(1)),
        })
    }

    #[test]
    fn presets_walk_to_ready() {
        let toy = setup();
        assert_eq!(crank(&toy).unwrap(), LifecycleStatus::Done);
        assert_eq!(toy.lifecycle.state(), Ready);
        assert!(toy.lifecycle.active_conditions().is_empty());
    }

    #[test]
    fn destroy_from_any_state() {
        let toy = setup();
        crank(&toy).unwrap();
        toy.lifecycle
            .set(&toy.registry, ConditionId::new(2))
            .unwrap();
        crank(&toy).unwrap();
        assert_eq!(toy.lifecycle.state(), Destroy);
        assert!(toy.lifecycle.is_destroyed(&toy.registry));
    }
}
