//! Request status codes and death reasons.
//!
//! A request never carries a Rust error across a completion boundary; it
//! carries a [`Status`] plus a free-form qualifier instead.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status code carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Success.
    #[default]
    Ok,
    /// Unspecified failure.
    GenericFailure,
    /// The edge the request would travel over is not ENABLED.
    EdgeNotEnabled,
    /// A configuration change is in progress.
    Busy,
    /// No free request or buffer.
    InsufficientResources,
    /// Invalid parameter or target not found.
    NoObject,
    /// The request was cancelled.
    Canceled,
    /// Cancellation was requested and the owner is unwinding.
    CancelPending,
}

impl Status {
    /// Returns true for [`Status::Ok`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns true for the cancellation statuses.
    #[must_use]
    pub const fn is_canceled(self) -> bool {
        matches!(self, Self::Canceled | Self::CancelPending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::GenericFailure => "generic failure",
            Self::EdgeNotEnabled => "edge not enabled",
            Self::Busy => "busy",
            Self::InsufficientResources => "insufficient resources",
            Self::NoObject => "no object",
            Self::Canceled => "canceled",
            Self::CancelPending => "cancel pending",
        };
        f.write_str(s)
    }
}

/// Why an object entered FAIL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathReason {
    /// The object has not failed.
    #[default]
    None,
    /// The upstream edge reports an unrecoverable power-off.
    PoweredOffUnrecoverable,
    /// The upstream edge reports an unrecoverable bypass.
    BypassedUnrecoverable,
    /// A class-specific fatal error.
    Internal,
}
