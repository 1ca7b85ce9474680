//! Domain event kinds and payloads.
//!
//! Hypervisors emit events for a domain on their own notification loop.
//! Every event has a kind (what a subscriber registers for) and a
//! kind-specific payload.  The emitting connection stamps each event with a
//! monotonically increasing sequence number, which is how subscribers can
//! tell emission order apart from delivery order.

use serde::{Deserialize, Serialize};

/// The event kinds a subscription can register for.
///
/// These follow the native domain event ids of the virtualization library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Lifecycle,
    Reboot,
    RtcChange,
    Watchdog,
    IoError,
    Graphics,
    PmWakeup,
    PmSuspend,
    BalloonChange,
    DeviceRemoved,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Lifecycle => "lifecycle",
            EventKind::Reboot => "reboot",
            EventKind::RtcChange => "rtc_change",
            EventKind::Watchdog => "watchdog",
            EventKind::IoError => "io_error",
            EventKind::Graphics => "graphics",
            EventKind::PmWakeup => "pm_wakeup",
            EventKind::PmSuspend => "pm_suspend",
            EventKind::BalloonChange => "balloon_change",
            EventKind::DeviceRemoved => "device_removed",
        }
    }
}

/// Lifecycle event codes, as carried by a [`EventPayload::Lifecycle`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    Defined,
    Undefined,
    Started,
    Suspended,
    Resumed,
    Stopped,
    Shutdown,
    PmSuspended,
    Crashed,
}

impl LifecycleEvent {
    /// Maps a native lifecycle event code; unknown codes yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Defined,
            1 => Self::Undefined,
            2 => Self::Started,
            3 => Self::Suspended,
            4 => Self::Resumed,
            5 => Self::Stopped,
            6 => Self::Shutdown,
            7 => Self::PmSuspended,
            8 => Self::Crashed,
            _ => return None,
        })
    }
}

/// The kind-specific argument list of a domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Lifecycle { event: LifecycleEvent, detail: i32 },
    Reboot,
    RtcChange { utc_offset: i64 },
    Watchdog { action: i32 },
    IoError { src_path: String, dev_alias: String, action: i32 },
    Graphics { phase: i32, scheme: String },
    PmWakeup { reason: i32 },
    PmSuspend { reason: i32 },
    BalloonChange { actual_kib: u64 },
    DeviceRemoved { dev_alias: String },
}

impl EventPayload {
    /// The kind a subscriber must register for to receive this payload.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Lifecycle { .. } => EventKind::Lifecycle,
            EventPayload::Reboot => EventKind::Reboot,
            EventPayload::RtcChange { .. } => EventKind::RtcChange,
            EventPayload::Watchdog { .. } => EventKind::Watchdog,
            EventPayload::IoError { .. } => EventKind::IoError,
            EventPayload::Graphics { .. } => EventKind::Graphics,
            EventPayload::PmWakeup { .. } => EventKind::PmWakeup,
            EventPayload::PmSuspend { .. } => EventKind::PmSuspend,
            EventPayload::BalloonChange { .. } => EventKind::BalloonChange,
            EventPayload::DeviceRemoved { .. } => EventKind::DeviceRemoved,
        }
    }
}

/// One event emitted by a hypervisor for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// UUID of the domain the event concerns.
    pub domain_id: String,
    /// Per-connection emission sequence number.
    pub sequence: u64,
    pub payload: EventPayload,
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_kind_matches_variant() {
        let payload = EventPayload::Lifecycle {
            event: LifecycleEvent::Started,
            detail: 0,
        };
        assert_eq!(payload.kind(), EventKind::Lifecycle);
        assert_eq!(EventPayload::Reboot.kind(), EventKind::Reboot);
    }

    #[test]
    fn test_lifecycle_codes() {
        assert_eq!(LifecycleEvent::from_code(2), Some(LifecycleEvent::Started));
        assert_eq!(LifecycleEvent::from_code(8), Some(LifecycleEvent::Crashed));
        assert_eq!(LifecycleEvent::from_code(99), None);
    }

    #[test]
    fn test_event_kind_parses_from_snake_case() {
        let kind: EventKind = serde_json::from_str("\"rtc_change\"").unwrap();
        assert_eq!(kind, EventKind::RtcChange);
        assert_eq!(kind.as_str(), "rtc_change");
    }

    #[test]
    fn test_payload_json_is_tagged_by_kind() {
        let json = serde_json::to_value(EventPayload::BalloonChange { actual_kib: 1024 }).unwrap();
        assert_eq!(json["kind"], "balloon_change");
        assert_eq!(json["actual_kib"], 1024);
    }
}
