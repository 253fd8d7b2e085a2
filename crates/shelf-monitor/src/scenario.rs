//! Simulated slot population and timed slot changes.
//!
//! A scenario seeds the attribute store with the initial status of every
//! slot and then plays changes at fixed offsets from the start. Each change
//! is written to the store, committed, and followed by a request for the
//! enclosure to re-read its slots.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shelf_core::ObjectId;
use shelf_topology::{
    Attribute, AttributeError, AttributeKey, AttributeStore, AttributeValue, ChangeReason,
    SlotStatus, Topology,
};

use crate::error::Result;

/// Condition the enclosure runs to pick up slot changes.
pub const UPDATE_SLOT_STATUS: &str = "update_slot_status";

/// A change to one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotChange {
    /// A drive is inserted and logs in.
    Insert,
    /// The drive is pulled.
    Remove,
    /// Slot power goes off.
    PowerOff {
        /// Why.
        #[serde(default)]
        reason: ChangeReason,
    },
    /// Slot power comes back.
    PowerOn,
    /// The slot's phy is disabled.
    Bypass {
        /// Why.
        #[serde(default)]
        reason: ChangeReason,
    },
    /// The slot's phy is enabled again.
    Unbypass,
}

impl SlotChange {
    /// Status of a slot after this change.
    #[must_use]
    pub const fn apply(self, status: SlotStatus) -> SlotStatus {
        match self {
            Self::Insert => SlotStatus {
                inserted: true,
                logged_in: true,
                ..status
            },
            Self::Remove => SlotStatus::empty(),
            Self::PowerOff { reason } => SlotStatus {
                powered_off: Some(reason),
                ..status
            },
            Self::PowerOn => SlotStatus {
                powered_off: None,
                ..status
            },
            Self::Bypass { reason } => SlotStatus {
                phy_disabled: Some(reason),
                ..status
            },
            Self::Unbypass => SlotStatus {
                phy_disabled: None,
                ..status
            },
        }
    }
}

/// A slot change at an offset from the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioEvent {
    /// Offset from the start in milliseconds.
    pub at_ms: u64,
    /// Slot index.
    pub slot: u32,
    /// The change.
    #[serde(flatten)]
    pub change: SlotChange,
}

impl ScenarioEvent {
    /// Offset from the start as a `Duration`.
    #[must_use]
    pub const fn at(&self) -> Duration {
        Duration::from_millis(self.at_ms)
    }
}

/// Initial slots and the changes to play.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Initial status of each slot; the slot count is the length.
    #[serde(default)]
    pub slots: Vec<SlotStatus>,
    /// Timed changes.
    #[serde(default)]
    pub events: Vec<ScenarioEvent>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            slots: vec![SlotStatus::healthy(); 4],
            events: Vec::new(),
        }
    }
}

impl Scenario {
    /// Write the slot count and every initial slot status, then commit.
    ///
    /// # Errors
    ///
    /// Returns `Attribute` if the store refuses a write.
    pub fn seed(&self, store: &dyn AttributeStore) -> Result<()> {
        let count = u32::try_from(self.slots.len())
            .map_err(|_| AttributeError::Failed(format!("{} slots", self.slots.len())))?;
        store.set(
            AttributeKey::enclosure(Attribute::SlotCount),
            AttributeValue::Count(count),
        )?;
        for (slot, status) in (0u32..).zip(&self.slots) {
            write_slot(store, slot, *status)?;
        }
        store.commit();
        Ok(())
    }

    /// Events in the order they are played.
    #[must_use]
    pub fn timeline(&self) -> Vec<ScenarioEvent> {
        let mut events = self.events.clone();
        events.sort_by_key(|e| e.at_ms);
        events
    }

    /// Play every event that falls inside `run_time`.
    ///
    /// Returns the number of events applied.
    ///
    /// # Errors
    ///
    /// Returns `Attribute` if the store refuses a write and `Topology` if
    /// the enclosure is gone.
    pub async fn play(
        &self,
        store: &dyn AttributeStore,
        topology: &Topology,
        enclosure: ObjectId,
        run_time: Duration,
    ) -> Result<usize> {
        let start = tokio::time::Instant::now();
        let mut applied = 0;
        for event in self.timeline() {
            if event.at() > run_time {
                break;
            }
            tokio::time::sleep_until(start + event.at()).await;
            let status = apply_event(store, &event)?;
            tracing::info!(
                slot = event.slot,
                change = ?event.change,
                status = ?status,
                "scenario event"
            );
            topology.set_condition(enclosure, UPDATE_SLOT_STATUS)?;
            applied += 1;
        }
        Ok(applied)
    }
}

/// Apply one event to the active store and commit.
///
/// # Errors
///
/// Returns `Attribute` if the slot cannot be read or written.
pub fn apply_event(store: &dyn AttributeStore, event: &ScenarioEvent) -> Result<SlotStatus> {
    let current = match store.get(AttributeKey::slot(Attribute::Inserted, event.slot)) {
        Err(AttributeError::NotFound(_)) => SlotStatus::empty(),
        _ => SlotStatus::read(|key| store.get(key), event.slot)?,
    };
    let next = event.change.apply(current);
    write_slot(store, event.slot, next)?;
    store.commit();
    Ok(next)
}

fn write_slot(store: &dyn AttributeStore, slot: u32, status: SlotStatus) -> Result<()> {
    for (key, value) in status.entries(slot) {
        store.set(key, value)?;
    }
    Ok(())
}
