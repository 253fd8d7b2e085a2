//! Conditions, transition tables, and rotary entries.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use shelf_core::LifecycleState;
use shelf_transport::Packet;

/// Identifier of a condition, unique within a class registry.
///
/// Ids are dense: a subclass numbers its own conditions after the last id of
/// its superclass, so an inherited condition keeps its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConditionId(u16);

impl ConditionId {
    /// Create an id from its raw value.
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Position in the registry and in the per-object bitset.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a condition action and of an engine pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    /// Finished synchronously.
    Done,
    /// Work was handed off; the engine resumes from a completion.
    Pending,
    /// Finished; run another pass after the delay.
    Reschedule(Duration),
}

/// Action run when a condition is active in its rotary.
pub type ConditionAction<O> = fn(&Arc<O>, &Packet) -> LifecycleStatus;

/// How a condition becomes active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    /// Set explicitly or preset by a rotary.
    Base,
    /// Set by the engine every `interval` while its state is current.
    Timer {
        /// Firing interval.
        interval: Duration,
    },
}

/// Target lifecycle state for each current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionTable([LifecycleState; LifecycleState::COUNT]);

impl TransitionTable {
    /// A table that never leaves the current state.
    #[must_use]
    pub const fn identity() -> Self {
        Self(LifecycleState::ALL)
    }

    /// A table that always targets `to`.
    #[must_use]
    pub const fn always(to: LifecycleState) -> Self {
        Self([to; LifecycleState::COUNT])
    }

    /// Override the row for `from`.
    #[must_use]
    pub fn on(mut self, from: LifecycleState, to: LifecycleState) -> Self {
        self.0[from.index()] = to;
        self
    }

    /// Target when the condition is active in `from`.
    #[must_use]
    pub const fn target(&self, from: LifecycleState) -> LifecycleState {
        self.0[from.index()]
    }

    /// True if the condition requests a transition out of `from`.
    #[must_use]
    pub fn is_request_in(&self, from: LifecycleState) -> bool {
        self.target(from) != from
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::identity()
    }
}

/// A registered condition.
pub struct Condition<O> {
    pub(crate) id: ConditionId,
    pub(crate) name: &'static str,
    pub(crate) kind: ConditionKind,
    pub(crate) transitions: TransitionTable,
    pub(crate) is_virtual: bool,
    pub(crate) action: Option<ConditionAction<O>>,
}

impl<O> Condition<O> {
    /// Condition id.
    #[must_use]
    pub const fn id(&self) -> ConditionId {
        self.id
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Base or timer.
    #[must_use]
    pub const fn kind(&self) -> ConditionKind {
        self.kind
    }

    /// Timer interval, if this is a timer condition.
    #[must_use]
    pub const fn interval(&self) -> Option<Duration> {
        match self.kind {
            ConditionKind::Timer { interval } => Some(interval),
            ConditionKind::Base => None,
        }
    }

    /// Transition table.
    #[must_use]
    pub const fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }

    /// Action, unless this is a placeholder.
    #[must_use]
    pub fn action(&self) -> Option<ConditionAction<O>> {
        if self.is_virtual {
            None
        } else {
            self.action
        }
    }

    /// True for virtual conditions and conditions without an action.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        self.is_virtual || self.action.is_none()
    }
}

impl<O> Clone for Condition<O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name,
            kind: self.kind,
            transitions: self.transitions,
            is_virtual: self.is_virtual,
            action: self.action,
        }
    }
}

impl<O> fmt::Debug for Condition<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("placeholder", &self.is_placeholder())
            .finish_non_exhaustive()
    }
}

/// Attribute of a rotary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotaryAttribute {
    /// Evaluated when set.
    Normal,
    /// Forced active whenever the owning state is entered.
    Preset,
}

/// One condition in a rotary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotaryEntry {
    /// The condition.
    pub condition: ConditionId,
    /// Entry attribute.
    pub attribute: RotaryAttribute,
}

impl RotaryEntry {
    /// A plain entry.
    #[must_use]
    pub const fn normal(condition: ConditionId) -> Self {
        Self {
            condition,
            attribute: RotaryAttribute::Normal,
        }
    }

    /// An entry forced active on state entry.
    #[must_use]
    pub const fn preset(condition: ConditionId) -> Self {
        Self {
            condition,
            attribute: RotaryAttribute::Preset,
        }
    }

    /// True for preset entries.
    #[must_use]
    pub fn is_preset(&self) -> bool {
        self.attribute == RotaryAttribute::Preset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::{Activate, Destroy, Fail, Ready, Specialize};

    #[test]
    fn identity_table_never_requests() {
        let table = TransitionTable::identity();
        for state in LifecycleState::ALL {
            assert!(!table.is_request_in(state));
        }
    }

    #[test]
    fn overrides_apply_per_row() {
        let table = TransitionTable::identity()
            .on(Specialize, Activate)
            .on(Ready, Fail);
        assert_eq!(table.target(Specialize), Activate);
        assert_eq!(table.target(Ready), Fail);
        assert_eq!(table.target(Activate), Activate);
        assert!(table.is_request_in(Ready));
    }

    #[test]
    fn always_targets_one_state() {
        let table = TransitionTable::always(Destroy);
        assert!(LifecycleState::ALL
            .into_iter()
            .all(|s| table.target(s) == Destroy));
        assert!(!table.is_request_in(Destroy));
    }
}
