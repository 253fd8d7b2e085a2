//! Drive slot status and its mapping onto edge path attributes.

use serde::{Deserialize, Serialize};
use shelf_transport::PathAttributes;

use crate::store::{Attribute, AttributeError, AttributeKey, AttributeResult, AttributeValue, ChangeReason};

/// Path attribute bits the enclosure derives from slot status.
pub const SLOT_MANAGED: PathAttributes = PathAttributes::BLOCKING
    .union(PathAttributes::REMOVED)
    .union(PathAttributes::NOT_PRESENT)
    .union(PathAttributes::POWERED_ON_NEED_DESTROY);

/// Status of one drive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SlotStatus {
    /// A drive is physically present.
    pub inserted: bool,
    /// The drive logged in.
    pub logged_in: bool,
    /// Why power is off, if it is.
    pub powered_off: Option<ChangeReason>,
    /// Why the phy is disabled, if it is.
    pub phy_disabled: Option<ChangeReason>,
}

impl SlotStatus {
    /// A present, logged-in, powered, enabled drive.
    #[must_use]
    pub const fn healthy() -> Self {
        Self {
            inserted: true,
            logged_in: true,
            powered_off: None,
            phy_disabled: None,
        }
    }

    /// An empty slot.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            inserted: false,
            logged_in: false,
            powered_off: None,
            phy_disabled: None,
        }
    }

    /// Read the status of `slot` through `get`.
    ///
    /// Reasons are only read for flags that are set; a missing reason reads
    /// as persistent.
    ///
    /// # Errors
    ///
    /// Returns the first store error other than a missing reason.
    pub fn read<F>(get: F, slot: u32) -> AttributeResult<Self>
    where
        F: Fn(AttributeKey) -> AttributeResult<AttributeValue>,
    {
        let flag = |attribute| get(AttributeKey::slot(attribute, slot))?.as_flag();
        let reason = |attribute| match get(AttributeKey::slot(attribute, slot)) {
            Ok(value) => value.as_reason(),
            Err(AttributeError::NotFound(_)) => Ok(ChangeReason::Persistent),
            Err(e) => Err(e),
        };

        let powered_off = if flag(Attribute::PoweredOff)? {
            Some(reason(Attribute::PowerOffReason)?)
        } else {
            None
        };
        let phy_disabled = if flag(Attribute::PhyDisabled)? {
            Some(reason(Attribute::PhyDisableReason)?)
        } else {
            None
        };

        Ok(Self {
            inserted: flag(Attribute::Inserted)?,
            logged_in: flag(Attribute::LoggedIn)?,
            powered_off,
            phy_disabled,
        })
    }

    /// The store writes that record this status for `slot`.
    #[must_use]
    pub fn entries(&self, slot: u32) -> Vec<(AttributeKey, AttributeValue)> {
        let key = |attribute| AttributeKey::slot(attribute, slot);
        let mut entries = vec![
            (key(Attribute::Inserted), AttributeValue::Flag(self.inserted)),
            (key(Attribute::LoggedIn), AttributeValue::Flag(self.logged_in)),
            (
                key(Attribute::PoweredOff),
                AttributeValue::Flag(self.powered_off.is_some()),
            ),
            (
                key(Attribute::PhyDisabled),
                AttributeValue::Flag(self.phy_disabled.is_some()),
            ),
        ];
        if let Some(reason) = self.powered_off {
            entries.push((key(Attribute::PowerOffReason), AttributeValue::Reason(reason)));
        }
        if let Some(reason) = self.phy_disabled {
            entries.push((key(Attribute::PhyDisableReason), AttributeValue::Reason(reason)));
        }
        entries
    }
}

/// Path attributes of a slot's edge given its current and previous status.
#[must_use]
pub fn map_slot_status(status: &SlotStatus, previous: Option<&SlotStatus>) -> PathAttributes {
    let mut attrs = PathAttributes::empty();

    if !status.inserted {
        attrs |= PathAttributes::REMOVED;
    }
    if !status.logged_in {
        attrs |= PathAttributes::NOT_PRESENT;
    }

    match status.powered_off {
        Some(ChangeReason::Hardware) => attrs |= PathAttributes::POWERED_OFF_UNRECOV,
        Some(ChangeReason::PowerSave) => attrs |= PathAttributes::POWERSAVE_ON,
        Some(ChangeReason::NonPersistent) => attrs |= PathAttributes::POWERED_OFF_NONPERSIST,
        Some(ChangeReason::Persistent) => attrs |= PathAttributes::POWERED_OFF_PERSIST,
        None => {
            let was_off_hard = previous.is_some_and(|p| {
                matches!(
                    p.powered_off,
                    Some(ChangeReason::Persistent | ChangeReason::Hardware)
                )
            });
            if was_off_hard {
                attrs |= PathAttributes::POWERED_ON_NEED_DESTROY;
            }
        }
    }

    match status.phy_disabled {
        Some(ChangeReason::Hardware) => attrs |= PathAttributes::BYPASSED_UNRECOV,
        Some(ChangeReason::NonPersistent) => attrs |= PathAttributes::BYPASSED_NONPERSIST,
        Some(ChangeReason::Persistent | ChangeReason::PowerSave) => {
            attrs |= PathAttributes::BYPASSED_PERSIST;
        }
        None => {}
    }

    attrs
}
