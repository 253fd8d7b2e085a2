//! Condition-driven lifecycle engine.
//!
//! Every managed object moves through the lifecycle states
//! SPECIALIZE, ACTIVATE, READY, HIBERNATE, OFFLINE, FAIL and DESTROY. What
//! moves it is a set of named conditions:
//!
//! - **Registry**: per class, the condition catalogue and one ordered
//!   rotary per state, inherited and extended by subclasses
//! - **Instance**: per object, the current state and a bitset of active
//!   conditions
//! - **Engine**: a pass that runs active work conditions and takes the
//!   transitions active requests ask for
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use shelf_core::{ClassId, LifecycleState, ObjectId, PacketId};
//! use shelf_lifecycle::{
//!     crank, ClassRegistry, ClassRegistryBuilder, LifecycleObject, ObjectLifecycle,
//!     RotaryEntry, TransitionTable,
//! };
//! use shelf_transport::Packet;
//!
//! struct Fan {
//!     registry: Arc<ClassRegistry<Fan>>,
//!     lifecycle: ObjectLifecycle,
//!     packet: Packet,
//! }
//!
//! impl LifecycleObject for Fan {
//!     fn lifecycle(&self) -> &ObjectLifecycle { &self.lifecycle }
//!     fn registry(&self) -> &ClassRegistry<Self> { &self.registry }
//!     fn monitor_packet(&self) -> &Packet { &self.packet }
//! }
//!
//! let mut builder = ClassRegistryBuilder::new(ClassId::Port);
//! let activate = builder.placeholder(
//!     "activate",
//!     TransitionTable::identity().on(LifecycleState::Specialize, LifecycleState::Activate),
//! );
//! builder.rotary(LifecycleState::Specialize, &[RotaryEntry::preset(activate)]);
//! let registry = Arc::new(builder.build().unwrap());
//!
//! let fan = Arc::new(Fan {
//!     lifecycle: ObjectLifecycle::new(ObjectId::new(7), &registry, Arc::new(|_, _| {})),
//!     registry,
//!     packet: Packet::new(PacketId::new(1)),
//! });
//! crank(&fan).unwrap();
//! assert_eq!(fan.lifecycle.state(), LifecycleState::Activate);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod condition;
pub mod engine;
pub mod error;
pub mod instance;
pub mod registry;

pub use condition::{
    Condition, ConditionAction, ConditionId, ConditionKind, LifecycleStatus, RotaryAttribute,
    RotaryEntry, TransitionTable,
};
pub use engine::{crank, crank_at, LifecycleObject, MAX_TRANSITIONS_PER_PASS};
pub use error::{LifecycleError, Result};
pub use instance::{ConditionSet, ObjectLifecycle, RescheduleHook};
pub use registry::{ClassRegistry, ClassRegistryBuilder};
