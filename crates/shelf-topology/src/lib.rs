//! Managed objects of a storage shelf.
//!
//! This crate puts the lifecycle engine and the request transport to work
//! on a tree of ports, enclosures, and drives:
//!
//! - **Classes**: condition registries and entry points per object class
//! - **Discovery**: objects learn their upstream edge's health through edge
//!   events and turn it into lifecycle conditions
//! - **Slots**: the enclosure maps drive-slot status from the attribute
//!   store onto the path attributes of each drive's edge
//! - **Topology**: the object table, control delivery, and request routing
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use shelf_core::{ClassId, LifecycleState, ObjectId};
//! use shelf_topology::{
//!     Attribute, AttributeKey, AttributeStore, AttributeValue, InMemoryAttributeStore,
//!     SlotStatus, Topology, TopologyConfig,
//! };
//!
//! let store = Arc::new(InMemoryAttributeStore::new());
//! store.set(AttributeKey::enclosure(Attribute::SlotCount), AttributeValue::Count(1)).unwrap();
//! for (key, value) in SlotStatus::healthy().entries(0) {
//!     store.set(key, value).unwrap();
//! }
//! store.commit();
//!
//! let woken = Arc::new(Mutex::new(Vec::<ObjectId>::new()));
//! let w = Arc::clone(&woken);
//! let topology = Topology::new(
//!     TopologyConfig::default(),
//!     store,
//!     Arc::new(move |id, _| w.lock().push(id)),
//! )
//! .unwrap();
//!
//! let port = topology.create_port().unwrap();
//! let port_object = topology.require(port).unwrap();
//! topology.discover_child(&port_object, ClassId::Enclosure, 0).unwrap();
//!
//! loop {
//!     let next = woken.lock().pop();
//!     let Some(id) = next else { break };
//!     let _ = topology.crank(id);
//! }
//!
//! let snapshot = topology.snapshot();
//! assert_eq!(snapshot.objects.len(), 3);
//! assert!(snapshot.objects.iter().all(|o| o.state == LifecycleState::Ready));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod classes;
pub mod config;
pub mod error;
pub mod object;
pub mod slot;
pub mod store;
pub mod topology;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use classes::{ClassSet, DriveClass, EnclosureClass, PortClass};
pub use config::TopologyConfig;
pub use error::{Result, TopologyError};
pub use object::{ClientEdge, Discovered, Discovering, ManagedObject, ObjectClass, TransportOutcome};
pub use slot::{map_slot_status, SlotStatus, SLOT_MANAGED};
pub use store::{
    Attribute, AttributeError, AttributeKey, AttributeResult, AttributeStore, AttributeValue,
    ChangeReason, ComponentType, InMemoryAttributeStore, StoreSnapshot,
};
pub use topology::{EdgeSnapshot, ObjectSnapshot, Topology, TopologySnapshot};
