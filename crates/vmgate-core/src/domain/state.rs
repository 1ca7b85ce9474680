//! Domain power states.
//!
//! Hypervisor client libraries report a domain's state as a loosely-typed
//! pair `(state_code, reason_code)`.  This module turns that pair into a
//! closed [`DomainState`] enumeration plus the reason code it was reported
//! with, so the rest of the code base never branches on a raw integer.
//!
//! # Native codes
//!
//! | Code | State         |
//! |------|---------------|
//! | 0    | `nostate`     |
//! | 1    | `running`     |
//! | 2    | `blocked`     |
//! | 3    | `paused`      |
//! | 4    | `shutdown`    |
//! | 5    | `shutoff`     |
//! | 6    | `crashed`     |
//! | 7    | `pmsuspended` |
//!
//! Any other code is reported as `nostate`; the original code is kept in the
//! debug log of the caller, not here.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of power states a domain can be observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Maps a native state code to a [`DomainState`].
    ///
    /// Unknown codes map to [`DomainState::NoState`].
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::Shutdown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            _ => Self::NoState,
        }
    }

    /// Returns the native state code for this state.
    pub fn code(self) -> i32 {
        match self {
            Self::NoState => 0,
            Self::Running => 1,
            Self::Blocked => 2,
            Self::Paused => 3,
            Self::Shutdown => 4,
            Self::Shutoff => 5,
            Self::Crashed => 6,
            Self::PmSuspended => 7,
        }
    }

    /// Lower-case name used at the API boundary (`"running"`, `"shutoff"`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoState => "nostate",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
            Self::Shutoff => "shutoff",
            Self::Crashed => "crashed",
            Self::PmSuspended => "pmsuspended",
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A power state together with the reason code the hypervisor attached to it.
///
/// The reason code is driver-specific (e.g. "shut off because the guest
/// requested it" vs "shut off because the host destroyed it") and is carried
/// through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerState {
    pub state: DomainState,
    pub reason: i32,
}

impl PowerState {
    pub fn new(state: DomainState, reason: i32) -> Self {
        Self { state, reason }
    }

    /// Builds a [`PowerState`] from the native `(state, reason)` pair.
    pub fn from_native(code: i32, reason: i32) -> Self {
        Self::new(DomainState::from_code(code), reason)
    }

    pub fn is_running(&self) -> bool {
        self.state == DomainState::Running
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (reason {})", self.state, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_maps_every_native_code() {
        for code in 0..=7 {
            assert_eq!(DomainState::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_unknown_code_maps_to_nostate() {
        assert_eq!(DomainState::from_code(42), DomainState::NoState);
        assert_eq!(DomainState::from_code(-1), DomainState::NoState);
    }

    #[test]
    fn test_shutoff_code_is_five() {
        // The default test-double domain in the original service used [5, 0]
        // for "shut off".
        let state = PowerState::from_native(5, 0);
        assert_eq!(state.state, DomainState::Shutoff);
        assert!(!state.is_running());
    }

    #[test]
    fn test_display_is_lowercase_api_name() {
        assert_eq!(DomainState::PmSuspended.to_string(), "pmsuspended");
        assert_eq!(DomainState::Running.to_string(), "running");
    }

    #[test]
    fn test_serde_uses_api_names() {
        let json = serde_json::to_string(&DomainState::Shutoff).unwrap();
        assert_eq!(json, "\"shutoff\"");
    }

    #[test]
    fn test_power_state_keeps_reason() {
        let state = PowerState::from_native(1, 3);
        assert!(state.is_running());
        assert_eq!(state.reason, 3);
    }
}
