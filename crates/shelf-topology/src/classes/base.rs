//! Conditions every object has.
//!
//! All of them are placeholders: setting one requests a transition and the
//! engine clears it once the transition is taken.

use shelf_core::ClassId;
use shelf_core::LifecycleState::{Activate, Destroy, Fail, Hibernate, Offline, Ready, Specialize};
use shelf_lifecycle::{
    ClassRegistry, ClassRegistryBuilder, ConditionId, LifecycleError, RotaryEntry, TransitionTable,
};

use crate::object::ManagedObject;

/// Leave SPECIALIZE, HIBERNATE or OFFLINE for ACTIVATE.
pub const ACTIVATE: ConditionId = ConditionId::new(0);
/// Leave ACTIVATE for READY.
pub const READY: ConditionId = ConditionId::new(1);
/// Leave READY for HIBERNATE.
pub const HIBERNATE: ConditionId = ConditionId::new(2);
/// Leave ACTIVATE or READY for OFFLINE.
pub const OFFLINE: ConditionId = ConditionId::new(3);
/// Fail from any state but DESTROY.
pub const FAIL: ConditionId = ConditionId::new(4);
/// Destroy from any state.
pub const DESTROY: ConditionId = ConditionId::new(5);

/// Registry with only the base conditions.
///
/// # Errors
///
/// Returns `InvalidRegistry` if verification fails.
pub fn registry(class: ClassId) -> Result<ClassRegistry<ManagedObject>, LifecycleError> {
    let mut b = ClassRegistryBuilder::new(class);

    let ids = [
        b.placeholder(
            "activate",
            TransitionTable::identity()
                .on(Specialize, Activate)
                .on(Hibernate, Activate)
                .on(Offline, Activate),
        ),
        b.placeholder("ready", TransitionTable::identity().on(Activate, Ready)),
        b.placeholder("hibernate", TransitionTable::identity().on(Ready, Hibernate)),
        b.placeholder(
            "offline",
            TransitionTable::identity()
                .on(Activate, Offline)
                .on(Ready, Offline),
        ),
        b.placeholder("fail", TransitionTable::always(Fail).on(Destroy, Destroy)),
        b.placeholder("destroy", TransitionTable::always(Destroy)),
    ];
    let expected = [ACTIVATE, READY, HIBERNATE, OFFLINE, FAIL, DESTROY];
    for (actual, expected) in ids.into_iter().zip(expected) {
        super::expect_id(class, "base condition", actual, expected)?;
    }

    b.rotary(Specialize, &[RotaryEntry::preset(ACTIVATE)])
        .rotary(Activate, &[RotaryEntry::preset(READY)]);
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_registry_layout() {
        let registry = registry(ClassId::Port).unwrap();
        assert_eq!(registry.condition_count(), 6);
        assert_eq!(registry.find("destroy"), Some(DESTROY));
        assert!(registry.rotary(Specialize)[0].is_preset());
        assert!(registry.rotary(Ready).is_empty());
    }

    #[test]
    fn fail_never_leaves_destroy() {
        let registry = registry(ClassId::Drive).unwrap();
        let fail = registry.require(FAIL).unwrap().transitions();
        assert_eq!(fail.target(Ready), Fail);
        assert_eq!(fail.target(Destroy), Destroy);
    }
}
