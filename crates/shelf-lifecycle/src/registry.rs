//! Per-class condition registries.
//!
//! A registry is the immutable, shared description of a class: its
//! condition catalogue and one rotary per lifecycle state. Registries are
//! built once when the class is registered and are passed by reference into
//! every engine call; instances only own their bitset and state.
//!
//! Subclasses derive from their superclass registry. Inherited conditions
//! keep their ids, new conditions are numbered after them, and subclass
//! rotary entries are appended after the inherited ones.

use std::collections::HashSet;
use std::time::Duration;

use shelf_core::{ClassId, LifecycleState};

use crate::condition::{
    Condition, ConditionAction, ConditionId, ConditionKind, RotaryEntry,
    TransitionTable,
};
use crate::error::{LifecycleError, Result};

/// Immutable condition catalogue and rotaries of one class.
pub struct ClassRegistry<O> {
    class: ClassId,
    conditions: Vec<Condition<O>>,
    rotaries: [Vec<RotaryEntry>; LifecycleState::COUNT],
}

impl<O> ClassRegistry<O> {
    /// Class this registry describes.
    #[must_use]
    pub const fn class(&self) -> ClassId {
        self.class
    }

    /// Number of registered conditions; the size of every instance bitset.
    #[must_use]
    pub fn condition_count(&self) -> usize {
        self.conditions.len()
    }

    /// Look up a condition.
    #[must_use]
    pub fn condition(&self, id: ConditionId) -> Option<&Condition<O>> {
        self.conditions.get(id.index())
    }

    /// Look up a condition, failing for unknown ids.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCondition` if `id` is not registered.
    pub fn require(&self, id: ConditionId) -> Result<&Condition<O>> {
        self.condition(id)
            .ok_or(LifecycleError::UnknownCondition(id))
    }

    /// Find a condition by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<ConditionId> {
        self.conditions.iter().find(|c| c.name == name).map(|c| c.id)
    }

    /// All conditions in catalogue order.
    #[must_use]
    pub fn conditions(&self) -> &[Condition<O>] {
        &self.conditions
    }

    /// Rotary of `state`.
    #[must_use]
    pub fn rotary(&self, state: LifecycleState) -> &[RotaryEntry] {
        &self.rotaries[state.index()]
    }

    /// True if `id` appears in the rotary of `state`.
    #[must_use]
    pub fn in_rotary(&self, state: LifecycleState, id: ConditionId) -> bool {
        self.rotary(state).iter().any(|e| e.condition == id)
    }
}

impl<O> std::fmt::Debug for ClassRegistry<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("class", &self.class)
            .field("conditions", &self.conditions)
            .field("rotaries", &self.rotaries)
            .finish()
    }
}

/// Builds and verifies a [`ClassRegistry`].
pub struct ClassRegistryBuilder<O> {
    class: ClassId,
    conditions: Vec<Condition<O>>,
    rotaries: [Vec<RotaryEntry>; LifecycleState::COUNT],
    errors: Vec<String>,
}

impl<O> ClassRegistryBuilder<O> {
    /// Start a root class.
    #[must_use]
    pub fn new(class: ClassId) -> Self {
        Self {
            class,
            conditions: Vec::new(),
            rotaries: Default::default(),
            errors: Vec::new(),
        }
    }

    /// Start a subclass of `parent`.
    #[must_use]
    pub fn derive(class: ClassId, parent: &ClassRegistry<O>) -> Self {
        Self {
            class,
            conditions: parent.conditions.clone(),
            rotaries: parent.rotaries.clone(),
            errors: Vec::new(),
        }
    }

    fn push(
        &mut self,
        name: &'static str,
        kind: ConditionKind,
        transitions: TransitionTable,
        is_virtual: bool,
        action: Option<ConditionAction<O>>,
    ) -> ConditionId {
        let Ok(raw) = u16::try_from(self.conditions.len()) else {
            self.errors.push(format!("too many conditions at {name}"));
            return ConditionId::new(u16::MAX);
        };
        let id = ConditionId::new(raw);
        self.conditions.push(Condition {
            id,
            name,
            kind,
            transitions,
            is_virtual,
            action,
        });
        id
    }

    /// Register a condition with an action.
    pub fn condition(
        &mut self,
        name: &'static str,
        transitions: TransitionTable,
        action: ConditionAction<O>,
    ) -> ConditionId {
        self.push(name, ConditionKind::Base, transitions, false, Some(action))
    }

    /// Register a placeholder condition without an action.
    pub fn placeholder(&mut self, name: &'static str, transitions: TransitionTable) -> ConditionId {
        self.push(name, ConditionKind::Base, transitions, false, None)
    }

    /// Register a virtual condition that a subclass may give an action.
    pub fn virtual_condition(
        &mut self,
        name: &'static str,
        transitions: TransitionTable,
    ) -> ConditionId {
        self.push(name, ConditionKind::Base, transitions, true, None)
    }

    /// Register a timer condition.
    pub fn timer(
        &mut self,
        name: &'static str,
        interval: Duration,
        transitions: TransitionTable,
        action: ConditionAction<O>,
    ) -> ConditionId {
        self.push(
            name,
            ConditionKind::Timer { interval },
            transitions,
            false,
            Some(action),
        )
    }

    /// Give an inherited condition a new action, making it concrete.
    pub fn override_action(&mut self, id: ConditionId, action: ConditionAction<O>) -> &mut Self {
        match self.conditions.get_mut(id.index()) {
            Some(condition) => {
                condition.action = Some(action);
                condition.is_virtual = false;
            }
            None => self
                .errors
                .push(format!("override of unknown condition {id}")),
        }
        self
    }

    /// Append entries to the rotary of `state`.
    ///
    /// An entry already inherited keeps its position and takes the new
    /// attribute.
    pub fn rotary(&mut self, state: LifecycleState, entries: &[RotaryEntry]) -> &mut Self {
        let mut seen = HashSet::new();
        for entry in entries {
            if !seen.insert(entry.condition) {
                self.errors.push(format!(
                    "condition {} listed twice in {state} rotary",
                    entry.condition
                ));
                continue;
            }
            let rotary = &mut self.rotaries[state.index()];
            if let Some(existing) = rotary.iter_mut().find(|e| e.condition == entry.condition) {
                existing.attribute = entry.attribute;
            } else {
                rotary.push(*entry);
            }
        }
        self
    }

    /// Verify and freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegistry` if ids are not dense, a timer has a zero
    /// interval, a rotary names an unknown condition or repeats one, or a
    /// condition's DESTROY row leaves DESTROY.
    pub fn build(self) -> Result<ClassRegistry<O>> {
        let mut errors = self.errors;

        for (index, condition) in self.conditions.iter().enumerate() {
            if condition.id.index() != index {
                errors.push(format!("condition {} has id {}", condition.name, condition.id));
            }
            if let ConditionKind::Timer { interval } = condition.kind {
                if interval.is_zero() {
                    errors.push(format!("timer {} has a zero interval", condition.name));
                }
            }
            if condition.transitions.target(LifecycleState::Destroy) != LifecycleState::Destroy {
                errors.push(format!("condition {} leaves DESTROY", condition.name));
            }
        }

        for state in LifecycleState::ALL {
            let mut seen = HashSet::new();
            for entry in &self.rotaries[state.index()] {
                if entry.condition.index() >= self.conditions.len() {
                    errors.push(format!(
                        "{state} rotary names unknown condition {}",
                        entry.condition
                    ));
                }
                if !seen.insert(entry.condition) {
                    errors.push(format!(
                        "{state} rotary repeats condition {}",
                        entry.condition
                    ));
                }
            }
        }

        if !errors.is_empty() {
            let reason = errors.join("; ");
            tracing::error!(class = %self.class, %reason, "class registry failed verification");
            return Err(LifecycleError::InvalidRegistry {
                class: self.class,
                reason,
            });
        }

        Ok(ClassRegistry {
            class: self.class,
            conditions: self.conditions,
            rotaries: self.rotaries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::LifecycleStatus;
    use shelf_core::LifecycleState::{Activate, Destroy, Ready, Specialize};
    use shelf_transport::Packet;
    use std::sync::Arc;

    struct Dummy;

    fn noop(_: &Arc<Dummy>, _: &Packet) -> LifecycleStatus {
        LifecycleStatus::Done
    }

    fn base() -> ClassRegistry<Dummy> {
        let mut builder = ClassRegistryBuilder::new(ClassId::Port);
        let activate =
            builder.placeholder("activate", TransitionTable::identity().on(Specialize, Activate));
        let ready = builder.placeholder("ready", TransitionTable::identity().on(Activate, Ready));
        builder
            .rotary(Specialize, &[RotaryEntry::preset(activate)])
            .rotary(Activate, &[RotaryEntry::preset(ready)]);
        builder.build().unwrap()
    }

    #[test]
    fn subclass_ids_follow_superclass() {
        let parent = base();
        let mut builder = ClassRegistryBuilder::derive(ClassId::Enclosure, &parent);
        let own = builder.condition("own", TransitionTable::identity(), noop);
        let registry = builder.build().unwrap();

        assert_eq!(own, ConditionId::new(2));
        assert_eq!(registry.condition_count(), 3);
        assert_eq!(registry.find("activate"), Some(ConditionId::new(0)));
        assert_eq!(registry.class(), ClassId::Enclosure);
    }

    #[test]
    fn subclass_rotary_appends_after_inherited() {
        let parent = base();
        let mut builder = ClassRegistryBuilder::derive(ClassId::Enclosure, &parent);
        let own = builder.condition("own", TransitionTable::identity(), noop);
        builder.rotary(Specialize, &[RotaryEntry::preset(own)]);
        let registry = builder.build().unwrap();

        let rotary = registry.rotary(Specialize);
        assert_eq!(rotary.len(), 2);
        assert_eq!(rotary[0].condition, ConditionId::new(0));
        assert_eq!(rotary[1].condition, own);
    }

    #[test]
    fn inherited_entry_takes_new_attribute() {
        let parent = base();
        let mut builder = ClassRegistryBuilder::derive(ClassId::Drive, &parent);
        builder.rotary(Specialize, &[RotaryEntry::normal(ConditionId::new(0))]);
        let registry = builder.build().unwrap();

        assert_eq!(registry.rotary(Specialize).len(), 1);
        assert!(!registry.rotary(Specialize)[0].is_preset());
    }

    #[test]
    fn override_makes_virtual_concrete() {
        let mut builder = ClassRegistryBuilder::<Dummy>::new(ClassId::Port);
        let v = builder.virtual_condition("hook", TransitionTable::identity());
        let parent = builder.build().unwrap();
        assert!(parent.require(v).unwrap().is_placeholder());

        let mut builder = ClassRegistryBuilder::derive(ClassId::Drive, &parent);
        builder.override_action(v, noop);
        let registry = builder.build().unwrap();
        assert!(registry.require(v).unwrap().action().is_some());
    }

    #[test]
    fn destroy_row_must_stay_in_destroy() {
        let mut builder = ClassRegistryBuilder::<Dummy>::new(ClassId::Port);
        builder.placeholder("bad", TransitionTable::identity().on(Destroy, Ready));
        assert!(matches!(
            builder.build(),
            Err(LifecycleError::InvalidRegistry { .. })
        ));
    }

    #[test]
    fn zero_interval_timer_is_rejected() {
        let mut builder = ClassRegistryBuilder::<Dummy>::new(ClassId::Port);
        builder.timer("poll", Duration::ZERO, TransitionTable::identity(), noop);
        assert!(builder.build().is_err());
    }

    #[test]
    fn duplicate_and_unknown_rotary_entries_are_rejected() {
        let mut builder = ClassRegistryBuilder::<Dummy>::new(ClassId::Port);
        let a = builder.placeholder("a", TransitionTable::identity());
        builder.rotary(Ready, &[RotaryEntry::normal(a), RotaryEntry::normal(a)]);
        assert!(builder.build().is_err());

        let mut builder = ClassRegistryBuilder::<Dummy>::new(ClassId::Port);
        builder.rotary(Ready, &[RotaryEntry::normal(ConditionId::new(9))]);
        assert!(builder.build().is_err());
    }

    #[test]
    fn unknown_condition_lookup_fails() {
        let registry = base();
        assert!(matches!(
            registry.require(ConditionId::new(42)),
            Err(LifecycleError::UnknownCondition(_))
        ));
    }
}
