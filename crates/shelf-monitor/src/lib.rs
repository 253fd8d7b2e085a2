//! Runs a simulated storage shelf.
//!
//! This crate hosts the topology on a tokio runtime:
//!
//! - **Config**: JSON file or `SHELF_*` environment overrides
//! - **Scheduler**: turns reschedule requests and armed timers into
//!   lifecycle passes
//! - **Scenario**: seeds the attribute store and plays timed slot changes
//!
//! # Example
//!
//! ```
//! use shelf_monitor::{MonitorConfig, SlotChange};
//! use shelf_topology::SlotStatus;
//!
//! let config = MonitorConfig::default();
//! assert_eq!(config.scenario.slots.len(), 4);
//!
//! let pulled = SlotChange::Remove.apply(SlotStatus::healthy());
//! assert!(!pulled.inserted);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod scenario;
pub mod scheduler;

pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use scenario::{apply_event, Scenario, ScenarioEvent, SlotChange, UPDATE_SLOT_STATUS};
pub use scheduler::{reschedule_channel, MonitorScheduler, RescheduleRequest, SchedulerStats};
