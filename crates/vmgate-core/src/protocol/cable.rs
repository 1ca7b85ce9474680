//! JSON message types for the cable push channel.
//!
//! The cable is a long-lived WebSocket through which a browser subscribes to
//! domain events, requests power-state transitions and screenshots, and
//! receives notifications asynchronously, decoupled from any request/response
//! cycle.
//!
//! # Message flow
//!
//! ```text
//! Browser → Server:  JSON text frame  →  CableRequest
//! Server  → Browser: CablePush        →  JSON text frame
//! ```
//!
//! Every message is a JSON object with a `"type"` field naming the variant:
//!
//! ```json
//! {"type":"Subscribe","virtual_machine_id":"abc-123","event":"lifecycle"}
//! {"type":"SetState","virtual_machine_id":"abc-123","command":"SHUTDOWN"}
//! ```
//!
//! `command` travels as a plain string so an unknown value reaches the
//! transition engine and is rejected there with an `invalid_command_error`
//! instead of failing JSON parsing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::{ApiError, ErrorKind};
use crate::domain::event::{EventKind, EventPayload};
use crate::domain::snapshot::VirtualMachineView;

fn default_display() -> u32 {
    0
}

// ── Browser → Server ──────────────────────────────────────────────────────────

/// All messages a cable client can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CableRequest {
    /// Start receiving events of `event` kind for one virtual machine.
    Subscribe {
        virtual_machine_id: String,
        event: EventKind,
    },

    /// Stop a subscription created by this session.
    Unsubscribe { subscription_id: Uuid },

    /// Issue a lifecycle command (`"RUNNING"`, `"SHUTDOWN"`, ...).
    SetState {
        virtual_machine_id: String,
        command: String,
    },

    /// Capture the framebuffer of one display (default 0).
    TakeScreenshot {
        virtual_machine_id: String,
        #[serde(default = "default_display")]
        display: u32,
    },
}

// ── Server → Browser ──────────────────────────────────────────────────────────

/// All notifications the server pushes to a cable client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum CablePush {
    Subscribed {
        subscription_id: Uuid,
        virtual_machine_id: String,
        event: EventKind,
    },

    Unsubscribed { subscription_id: Uuid },

    /// A hypervisor event delivered to one of this session's subscriptions.
    DomainEvent {
        subscription_id: Uuid,
        virtual_machine_id: String,
        sequence: u64,
        event: EventPayload,
    },

    /// A fresh snapshot taken after a transition completed.
    VirtualMachineUpdated { virtual_machine: VirtualMachineView },

    /// A screenshot finished and was written under the screenshots directory.
    ScreenshotReady {
        virtual_machine_id: String,
        /// File name relative to the statically served `/screenshots` path.
        file: String,
        mime_type: String,
        size: usize,
    },

    Error { kind: ErrorKind, message: String },
}

impl From<ApiError> for CablePush {
    fn from(err: ApiError) -> Self {
        CablePush::Error {
            kind: err.kind,
            message: err.message,
        }
    }
}

/// Returns a short type-name string for a `CableRequest` variant, for logs.
pub fn request_type_name(request: &CableRequest) -> &'static str {
    match request {
        CableRequest::Subscribe { .. } => "Subscribe",
        CableRequest::Unsubscribe { .. } => "Unsubscribe",
        CableRequest::SetState { .. } => "SetState",
        CableRequest::TakeScreenshot { .. } => "TakeScreenshot",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_request_parses_from_tagged_json() {
        let json = r#"{"type":"Subscribe","virtual_machine_id":"abc-123","event":"lifecycle"}"#;
        let request: CableRequest = serde_json::from_str(json).unwrap();
        assert_eq!(
            request,
            CableRequest::Subscribe {
                virtual_machine_id: "abc-123".to_string(),
                event: EventKind::Lifecycle,
            }
        );
    }

    #[test]
    fn test_take_screenshot_display_defaults_to_zero() {
        let json = r#"{"type":"TakeScreenshot","virtual_machine_id":"abc-123"}"#;
        let request: CableRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(request, CableRequest::TakeScreenshot { display: 0, .. }));
    }

    #[test]
    fn test_set_state_keeps_unknown_command_as_text() {
        let json = r#"{"type":"SetState","virtual_machine_id":"x","command":"FLY"}"#;
        let request: CableRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(request, CableRequest::SetState { ref command, .. } if command == "FLY"));
    }

    #[test]
    fn test_error_push_serializes_kind_and_message() {
        let push = CablePush::from(ApiError {
            kind: ErrorKind::NotFound,
            message: "virtual machine x not found".to_string(),
        });
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json["type"], "Error");
        assert_eq!(json["kind"], "not_found");
    }

    #[test]
    fn test_request_type_name() {
        let request = CableRequest::Unsubscribe {
            subscription_id: Uuid::nil(),
        };
        assert_eq!(request_type_name(&request), "Unsubscribe");
    }
}
