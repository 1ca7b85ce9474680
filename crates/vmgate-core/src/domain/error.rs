//! The error taxonomy shared by every layer.
//!
//! | Variant                | When                                               |
//! |------------------------|----------------------------------------------------|
//! | `Connection`           | the hypervisor cannot be reached or was lost       |
//! | `InvalidState`         | use of a closed connection, stream or subscription |
//! | `InvalidCommand`       | unknown transition command (nothing was issued)    |
//! | `HypervisorOperation`  | the hypervisor rejected a call                     |
//! | `Stream`               | a data stream failed mid-transfer                  |
//! | `NotFound`             | unknown hypervisor / virtual machine id            |
//!
//! `HypervisorOperation` keeps the native message for logs.  API consumers
//! only ever see an [`ApiError`], whose message is built without it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::command::{Command, DomainAction};

/// Prefix of the native message for calls that are invalid in the domain's
/// current state (e.g. starting a running domain).
const OPERATION_INVALID_PREFIX: &str = "Requested operation is not valid";

/// Error type for every lifecycle, event and stream operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VirtError {
    #[error("cannot connect to hypervisor at {uri}: {message}")]
    Connection { uri: String, message: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid command {0:?}")]
    InvalidCommand(String),

    /// The hypervisor rejected or failed `operation`.
    ///
    /// `command` is set when the operation was part of a transition.
    #[error("hypervisor rejected {operation}: {message}")]
    HypervisorOperation {
        operation: String,
        command: Option<Command>,
        message: String,
    },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },
}

impl VirtError {
    /// Wraps a native failure of one transition action.
    pub fn transition_failed(
        command: Command,
        action: DomainAction,
        message: impl Into<String>,
    ) -> Self {
        VirtError::HypervisorOperation {
            operation: action.to_string(),
            command: Some(command),
            message: message.into(),
        }
    }

    /// Wraps a native failure of a non-transition call (a query, a stream setup).
    pub fn operation_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        VirtError::HypervisorOperation {
            operation: operation.into(),
            command: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VirtError::Connection { .. } => ErrorKind::Connection,
            VirtError::InvalidState(_) => ErrorKind::InvalidState,
            VirtError::InvalidCommand(_) => ErrorKind::InvalidCommand,
            VirtError::HypervisorOperation { .. } => ErrorKind::HypervisorOperation,
            VirtError::Stream(_) => ErrorKind::Stream,
            VirtError::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    /// `true` when the hypervisor refused the call because the domain is in
    /// the wrong state for it ("domain is already running" and similar).
    ///
    /// Callers may choose to treat these as no-ops; nothing in this crate
    /// does so on their behalf.
    pub fn is_operation_invalid(&self) -> bool {
        matches!(self, VirtError::HypervisorOperation { message, .. }
            if message.starts_with(OPERATION_INVALID_PREFIX))
    }

    /// Message safe to show to API consumers.
    ///
    /// Never contains the native hypervisor fault string.
    pub fn public_message(&self) -> String {
        match self {
            VirtError::Connection { .. } => "hypervisor connection unavailable".to_string(),
            VirtError::HypervisorOperation {
                operation,
                command: Some(command),
                ..
            } => format!("hypervisor rejected {command} ({operation})"),
            VirtError::HypervisorOperation { operation, .. } => {
                format!("hypervisor rejected {operation}")
            }
            VirtError::Stream(_) => "stream transfer failed".to_string(),
            other => other.to_string(),
        }
    }

    /// Converts into the structured form returned to API consumers.
    pub fn to_api_error(&self) -> ApiError {
        ApiError {
            kind: self.kind(),
            message: self.public_message(),
        }
    }
}

/// Machine-readable error kind exposed at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[serde(rename = "connection_error")]
    Connection,
    #[serde(rename = "invalid_state_error")]
    InvalidState,
    #[serde(rename = "invalid_command_error")]
    InvalidCommand,
    #[serde(rename = "hypervisor_operation_error")]
    HypervisorOperation,
    #[serde(rename = "stream_error")]
    Stream,
    NotFound,
}

/// Structured error body: a kind plus a public message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_failure_carries_command_and_action() {
        let err = VirtError::transition_failed(
            Command::Restore,
            DomainAction::Start,
            "internal error: boom",
        );
        let VirtError::HypervisorOperation {
            operation,
            command,
            message,
        } = &err
        else {
            panic!("expected HypervisorOperation, got {err:?}");
        };
        assert_eq!(operation, "start");
        assert_eq!(*command, Some(Command::Restore));
        assert_eq!(message, "internal error: boom");
    }

    #[test]
    fn test_public_message_hides_native_fault() {
        let err = VirtError::transition_failed(
            Command::Shutdown,
            DomainAction::Shutdown { grace: 1 },
            "secret native diagnostic",
        );
        let api = err.to_api_error();
        assert_eq!(api.kind, ErrorKind::HypervisorOperation);
        assert!(!api.message.contains("secret"));
        assert_eq!(api.message, "hypervisor rejected SHUTDOWN (shutdown(1))");
    }

    #[test]
    fn test_already_running_is_operation_invalid() {
        let err = VirtError::transition_failed(
            Command::Running,
            DomainAction::Start,
            "Requested operation is not valid: domain is already running",
        );
        assert!(err.is_operation_invalid());
        let unrelated = VirtError::operation_failed("get_state", "no connection driver");
        assert!(!unrelated.is_operation_invalid());
    }

    #[test]
    fn test_error_kind_serializes_to_api_names() {
        let json = serde_json::to_string(&ErrorKind::InvalidCommand).unwrap();
        assert_eq!(json, "\"invalid_command_error\"");
        let json = serde_json::to_string(&ErrorKind::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
    }

    #[test]
    fn test_invalid_command_message_names_the_value() {
        let api = VirtError::InvalidCommand("FLY".to_string()).to_api_error();
        assert_eq!(api.kind, ErrorKind::InvalidCommand);
        assert!(api.message.contains("FLY"));
    }
}
