//! Transition commands and their hypervisor call plans.
//!
//! A [`Command`] is an imperative instruction ("shut down gracefully"), not an
//! assertion about the resulting state.  Several commands converge on similar
//! observed states but are operationally different:
//!
//! - `SHUTDOWN` asks the guest to power off; `SHUTOFF` pulls the plug.
//! - `PAUSE` saves the running memory image; `SUSPEND` only stops the vCPUs.
//!
//! Each command expands to a fixed sequence of [`DomainAction`]s:
//!
//! ```text
//! RUNNING  → start
//! SHUTDOWN → shutdown(1)
//! SHUTOFF  → power_off
//! SUSPEND  → suspend
//! RESUME   → resume
//! REBOOT   → reboot
//! RESET    → reset
//! PAUSE    → save_memory
//! RESTORE  → start, resume
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::VirtError;

/// Grace flag passed with every graceful shutdown request.
pub const SHUTDOWN_GRACE: u32 = 1;

/// A lifecycle command accepted by the transition engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    Running,
    Shutdown,
    Shutoff,
    Suspend,
    Resume,
    Reboot,
    Reset,
    Pause,
    Restore,
}

/// A single hypervisor call issued against a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainAction {
    Start,
    /// Graceful shutdown carrying the grace flag.
    Shutdown { grace: u32 },
    PowerOff,
    Suspend,
    Resume,
    Reboot,
    Reset,
    /// Save the running memory image.
    SaveMemory,
}

impl Command {
    /// Every command, in declaration order.
    pub const ALL: [Command; 9] = [
        Command::Running,
        Command::Shutdown,
        Command::Shutoff,
        Command::Suspend,
        Command::Resume,
        Command::Reboot,
        Command::Reset,
        Command::Pause,
        Command::Restore,
    ];

    /// Upper-case wire name (`"RUNNING"`, `"SHUTDOWN"`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Running => "RUNNING",
            Command::Shutdown => "SHUTDOWN",
            Command::Shutoff => "SHUTOFF",
            Command::Suspend => "SUSPEND",
            Command::Resume => "RESUME",
            Command::Reboot => "REBOOT",
            Command::Reset => "RESET",
            Command::Pause => "PAUSE",
            Command::Restore => "RESTORE",
        }
    }

    /// The hypervisor calls this command expands to, in issue order.
    ///
    /// The engine stops at the first failing action, so for `RESTORE` a failed
    /// `start` means `resume` is never issued.
    pub fn plan(self) -> &'static [DomainAction] {
        match self {
            Command::Running => &[DomainAction::Start],
            Command::Shutdown => &[DomainAction::Shutdown {
                grace: SHUTDOWN_GRACE,
            }],
            Command::Shutoff => &[DomainAction::PowerOff],
            Command::Suspend => &[DomainAction::Suspend],
            Command::Resume => &[DomainAction::Resume],
            Command::Reboot => &[DomainAction::Reboot],
            Command::Reset => &[DomainAction::Reset],
            Command::Pause => &[DomainAction::SaveMemory],
            Command::Restore => &[DomainAction::Start, DomainAction::Resume],
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = VirtError;

    /// Parses a command name, ignoring ASCII case.
    ///
    /// # Errors
    ///
    /// Returns [`VirtError::InvalidCommand`] for any name outside the closed set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|command| command.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| VirtError::InvalidCommand(s.to_string()))
    }
}

impl DomainAction {
    /// Short name of the hypervisor call, used in error messages and logs.
    pub fn name(self) -> &'static str {
        match self {
            DomainAction::Start => "start",
            DomainAction::Shutdown { .. } => "shutdown",
            DomainAction::PowerOff => "power_off",
            DomainAction::Suspend => "suspend",
            DomainAction::Resume => "resume",
            DomainAction::Reboot => "reboot",
            DomainAction::Reset => "reset",
            DomainAction::SaveMemory => "save_memory",
        }
    }
}

impl fmt::Display for DomainAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainAction::Shutdown { grace } => write!(f, "shutdown({grace})"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_uses_grace_flag_one() {
        assert_eq!(
            Command::Shutdown.plan(),
            &[DomainAction::Shutdown { grace: 1 }]
        );
    }

    #[test]
    fn test_pause_and_suspend_map_to_different_actions() {
        assert_eq!(Command::Pause.plan(), &[DomainAction::SaveMemory]);
        assert_eq!(Command::Suspend.plan(), &[DomainAction::Suspend]);
        assert_ne!(Command::Pause.plan(), Command::Suspend.plan());
    }

    #[test]
    fn test_shutdown_and_shutoff_map_to_different_actions() {
        assert_ne!(Command::Shutdown.plan(), Command::Shutoff.plan());
        assert_eq!(Command::Shutoff.plan(), &[DomainAction::PowerOff]);
    }

    #[test]
    fn test_restore_is_start_then_resume() {
        assert_eq!(
            Command::Restore.plan(),
            &[DomainAction::Start, DomainAction::Resume]
        );
    }

    #[test]
    fn test_every_command_has_a_non_empty_plan() {
        for command in Command::ALL {
            assert!(!command.plan().is_empty(), "{command} has no plan");
        }
    }

    #[test]
    fn test_parse_accepts_upper_and_lower_case() {
        assert_eq!("REBOOT".parse::<Command>().unwrap(), Command::Reboot);
        assert_eq!("reset".parse::<Command>().unwrap(), Command::Reset);
    }

    #[test]
    fn test_parse_rejects_unknown_command() {
        let err = "HIBERNATE".parse::<Command>().unwrap_err();
        assert!(matches!(err, VirtError::InvalidCommand(ref name) if name == "HIBERNATE"));
    }

    #[test]
    fn test_parse_rejects_state_names_that_are_not_commands() {
        // "paused" is a state, not a command.
        assert!("PAUSED".parse::<Command>().is_err());
        assert!("".parse::<Command>().is_err());
    }

    #[test]
    fn test_serde_uses_upper_case_names() {
        let json = serde_json::to_string(&Command::Restore).unwrap();
        assert_eq!(json, "\"RESTORE\"");
        let parsed: Command = serde_json::from_str("\"SHUTOFF\"").unwrap();
        assert_eq!(parsed, Command::Shutoff);
    }

    #[test]
    fn test_action_display_includes_grace() {
        assert_eq!(
            DomainAction::Shutdown { grace: SHUTDOWN_GRACE }.to_string(),
            "shutdown(1)"
        );
        assert_eq!(DomainAction::SaveMemory.to_string(), "save_memory");
    }
}
