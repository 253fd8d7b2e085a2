//! Component attribute store.
//!
//! Hardware status and control values are staged in a store keyed by
//! (attribute, component type, index). The in-memory store keeps an active
//! copy that writers update and a backup copy that readers snapshot, so a
//! poll always sees one consistent generation of values.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A component attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    /// Number of drive slots on the enclosure.
    SlotCount,
    /// A drive is physically present in the slot.
    Inserted,
    /// The drive in the slot has logged in.
    LoggedIn,
    /// Slot power is off.
    PoweredOff,
    /// Why slot power is off.
    PowerOffReason,
    /// The slot's phy is disabled (bypassed).
    PhyDisabled,
    /// Why the slot's phy is disabled.
    PhyDisableReason,
}

/// Kind of component an attribute belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    /// The enclosure itself.
    Enclosure,
    /// A drive slot.
    Slot,
}

/// Why a slot was powered off or bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// Requested by an operator; survives resets.
    #[default]
    Persistent,
    /// Temporary; the stack may undo it.
    NonPersistent,
    /// Forced by a hardware fault.
    Hardware,
    /// Power saving.
    PowerSave,
}

/// A stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    /// On/off value.
    Flag(bool),
    /// A change reason.
    Reason(ChangeReason),
    /// A count.
    Count(u32),
}

impl AttributeValue {
    /// The value as a flag.
    ///
    /// # Errors
    ///
    /// Returns `Failed` if the value is not a flag.
    pub fn as_flag(self) -> Result<bool, AttributeError> {
        match self {
            Self::Flag(flag) => Ok(flag),
            other => Err(AttributeError::Failed(format!("expected a flag, found {other:?}"))),
        }
    }

    /// The value as a reason.
    ///
    /// # Errors
    ///
    /// Returns `Failed` if the value is not a reason.
    pub fn as_reason(self) -> Result<ChangeReason, AttributeError> {
        match self {
            Self::Reason(reason) => Ok(reason),
            other => Err(AttributeError::Failed(format!("expected a reason, found {other:?}"))),
        }
    }

    /// The value as a count.
    ///
    /// # Errors
    ///
    /// Returns `Failed` if the value is not a count.
    pub fn as_count(self) -> Result<u32, AttributeError> {
        match self {
            Self::Count(count) => Ok(count),
            other => Err(AttributeError::Failed(format!("expected a count, found {other:?}"))),
        }
    }
}

/// Address of one stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeKey {
    /// Attribute.
    pub attribute: Attribute,
    /// Component type.
    pub component: ComponentType,
    /// Component index.
    pub index: u32,
}

impl AttributeKey {
    /// Key of a slot attribute.
    #[must_use]
    pub const fn slot(attribute: Attribute, index: u32) -> Self {
        Self {
            attribute,
            component: ComponentType::Slot,
            index,
        }
    }

    /// Key of an enclosure attribute.
    #[must_use]
    pub const fn enclosure(attribute: Attribute) -> Self {
        Self {
            attribute,
            component: ComponentType::Enclosure,
            index: 0,
        }
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}[{}]", self.attribute, self.component, self.index)
    }
}

/// Store lookups that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeError {
    /// Nothing is stored under the key.
    #[error("attribute not found: {0}")]
    NotFound(AttributeKey),

    /// The store failed or held a value of the wrong kind.
    #[error("attribute access failed: {0}")]
    Failed(String),
}

/// Result of a store access.
pub type AttributeResult<T> = std::result::Result<T, AttributeError>;

/// A consistent copy of the store.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    values: HashMap<AttributeKey, AttributeValue>,
}

impl StoreSnapshot {
    /// Read one value.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing is stored under `key`.
    pub fn get(&self, key: AttributeKey) -> AttributeResult<AttributeValue> {
        self.values
            .get(&key)
            .copied()
            .ok_or(AttributeError::NotFound(key))
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Narrow access to the component attribute database.
pub trait AttributeStore: Send + Sync {
    /// Read the active value under `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing is stored and `Failed` if the store
    /// could not be read.
    fn get(&self, key: AttributeKey) -> AttributeResult<AttributeValue>;

    /// Write the active value under `key`.
    ///
    /// # Errors
    ///
    /// Returns `Failed` if the store could not be written.
    fn set(&self, key: AttributeKey, value: AttributeValue) -> AttributeResult<()>;

    /// Publish the active values to readers of [`AttributeStore::snapshot`].
    fn commit(&self);

    /// Copy of the last committed generation.
    fn snapshot(&self) -> StoreSnapshot;
}

/// Attribute store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryAttributeStore {
    active: Mutex<HashMap<AttributeKey, AttributeValue>>,
    backup: Mutex<HashMap<AttributeKey, AttributeValue>>,
}

impl InMemoryAttributeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttributeStore for InMemoryAttributeStore {
    fn get(&self, key: AttributeKey) -> AttributeResult<AttributeValue> {
        self.active
            .lock()
            .get(&key)
            .copied()
            .ok_or(AttributeError::NotFound(key))
    }

    fn set(&self, key: AttributeKey, value: AttributeValue) -> AttributeResult<()> {
        self.active.lock().insert(key, value);
        Ok(())
    }

    fn commit(&self) {
        let copy = self.active.lock().clone();
        *self.backup.lock() = copy;
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            values: self.backup.lock().clone(),
        }
    }
}
