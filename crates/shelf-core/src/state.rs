//! Lifecycle states.
//!
//! ```text
//!   SPECIALIZE ──▶ ACTIVATE ◀──▶ READY ──▶ HIBERNATE
//!                     │            │           │
//!                     ▼            ▼           │
//!                  OFFLINE       FAIL ◀────────┘
//!                     │            │
//!                     └──▶ DESTROY ◀┘   (every state can reach DESTROY)
//! ```
//!
//! The arrows actually taken are decided per class by condition transition
//! tables; this module only names the states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// One of the seven lifecycle states of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Initial state after creation.
    Specialize,
    /// Establishing connectivity.
    Activate,
    /// Fully operational.
    Ready,
    /// Quiesced, may return to activate.
    Hibernate,
    /// Administratively offline.
    Offline,
    /// Permanently unusable; only destroy leaves it.
    Fail,
    /// Terminal state; the object is torn down from here.
    Destroy,
}

impl LifecycleState {
    /// Number of lifecycle states.
    pub const COUNT: usize = 7;

    /// Every state, in table order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Specialize,
        Self::Activate,
        Self::Ready,
        Self::Hibernate,
        Self::Offline,
        Self::Fail,
        Self::Destroy,
    ];

    /// Position of this state in transition tables and rotary arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns true for the terminal DESTROY state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroy)
    }

    /// Upper-case name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Specialize => "SPECIALIZE",
            Self::Activate => "ACTIVATE",
            Self::Ready => "READY",
            Self::Hibernate => "HIBERNATE",
            Self::Offline => "OFFLINE",
            Self::Fail => "FAIL",
            Self::Destroy => "DESTROY",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_table_order() {
        for (i, state) in LifecycleState::ALL.iter().enumerate() {
            assert_eq!(state.index(), i);
        }
    }

    #[test]
    fn only_destroy_is_terminal() {
        let terminal: Vec<_> = LifecycleState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![LifecycleState::Destroy]);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("ready".parse::<LifecycleState>().unwrap(), LifecycleState::Ready);
        assert_eq!("FAIL".parse::<LifecycleState>().unwrap(), LifecycleState::Fail);
        assert!("running".parse::<LifecycleState>().is_err());
    }
}
