//! The hypervisor driver seam.
//!
//! Virtualization client libraries expose a blocking call for every domain
//! operation and deliver events and stream readiness through callbacks fired
//! on their own notification loop.  These traits describe exactly that
//! surface, nothing more, so that:
//!
//! - the application layer never touches a process-wide client handle (every
//!   component receives its driver explicitly);
//! - tests can inject the in-memory driver from
//!   `infrastructure::test_driver`, or a `mockall` double, per test.
//!
//! # Delivery context
//!
//! [`EventSink`]s and [`StreamCallback`]s are invoked by the driver on its
//! delivery context.  Implementations of the application layer keep those
//! callbacks short: they enqueue and return.

use std::sync::Arc;

use thiserror::Error;
use vmgate_core::{DomainEvent, EventKind, NodeInfo};

/// A native failure reported by the driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// The hypervisor rejected or failed the call; the message is verbatim.
    #[error("{0}")]
    Operation(String),
    /// The transport to the hypervisor is gone.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl DriverError {
    /// The native rejection for a call that is invalid in the domain's state.
    pub fn operation_invalid(detail: &str) -> Self {
        DriverError::Operation(format!("Requested operation is not valid: {detail}"))
    }

    /// The native message, without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            DriverError::Operation(message) | DriverError::ConnectionLost(message) => message,
        }
    }
}

/// Host-level information reported by a driver once connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: String,
    pub version: String,
    pub lib_version: String,
    pub max_vcpus: u32,
    pub node_info: NodeInfo,
    pub capabilities: Vec<String>,
}

/// Callback invoked by the driver for every matching domain event.
pub type EventSink = Arc<dyn Fn(DomainEvent) + Send + Sync>;

/// Opaque native registration handle returned by event registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

/// Stream readiness bitmask, using the native event values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamEvents(pub u32);

impl StreamEvents {
    pub const READABLE: StreamEvents = StreamEvents(1 << 0);
    pub const WRITABLE: StreamEvents = StreamEvents(1 << 1);
    pub const ERROR: StreamEvents = StreamEvents(1 << 2);
    pub const HANGUP: StreamEvents = StreamEvents(1 << 3);

    pub fn contains(self, other: StreamEvents) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn intersects(self, other: StreamEvents) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: StreamEvents) -> StreamEvents {
        StreamEvents(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Outcome of a non-blocking stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRecv {
    /// `n` bytes were copied into the buffer.
    Data(usize),
    /// Nothing is available right now; wait for the next readable event.
    WouldBlock,
    /// The producer finished; no more bytes will arrive.
    Eof,
}

/// Readiness callback registered on a stream.
pub type StreamCallback = Box<dyn FnMut(StreamEvents) + Send>;

/// A byte-oriented transfer channel from the hypervisor.
pub trait StreamDriver: Send + Sync {
    /// Registers the readiness callback for `events`.
    fn event_add_callback(
        &self,
        events: StreamEvents,
        callback: StreamCallback,
    ) -> Result<(), DriverError>;

    /// Removes the readiness callback.  Safe to call from inside the callback.
    fn event_remove_callback(&self) -> Result<(), DriverError>;

    /// Non-blocking read into `buf`.
    fn recv(&self, buf: &mut [u8]) -> Result<StreamRecv, DriverError>;

    /// Completes the transfer after end-of-stream was read.
    fn finish(&self) -> Result<(), DriverError>;

    /// Aborts the transfer; later producer writes are discarded.
    fn abort(&self) -> Result<(), DriverError>;
}

/// One domain as exposed by the driver.  Every call may block.
#[cfg_attr(test, mockall::automock)]
pub trait DomainDriver: Send + Sync {
    fn uuid(&self) -> Result<String, DriverError>;
    fn name(&self) -> Result<String, DriverError>;
    /// The native `(state_code, reason_code)` pair.
    fn state(&self) -> Result<(i32, i32), DriverError>;
    fn max_vcpus(&self) -> Result<u32, DriverError>;
    /// Maximum memory in KiB.
    fn max_memory(&self) -> Result<u64, DriverError>;
    fn xml_desc(&self) -> Result<String, DriverError>;

    fn start(&self) -> Result<(), DriverError>;
    fn shutdown(&self, grace: u32) -> Result<(), DriverError>;
    fn power_off(&self) -> Result<(), DriverError>;
    fn suspend(&self) -> Result<(), DriverError>;
    fn resume(&self) -> Result<(), DriverError>;
    fn reboot(&self) -> Result<(), DriverError>;
    fn reset(&self) -> Result<(), DriverError>;
    fn save_memory(&self) -> Result<(), DriverError>;

    /// Starts writing the framebuffer of `display` into `stream`.
    ///
    /// Returns the MIME type of the image that will be written.
    fn screenshot(
        &self,
        stream: Arc<dyn StreamDriver>,
        display: u32,
    ) -> Result<String, DriverError>;
}

/// A connection to one hypervisor host.
pub trait HypervisorDriver: Send + Sync {
    fn host_info(&self) -> Result<HostInfo, DriverError>;

    /// Every domain defined on the host, in driver order.
    fn list_all_domains(&self) -> Result<Vec<Arc<dyn DomainDriver>>, DriverError>;

    fn create_stream(&self) -> Result<Arc<dyn StreamDriver>, DriverError>;

    /// Registers `sink` for `kind` events of the domain with `domain_id`.
    fn domain_event_register_any(
        &self,
        kind: EventKind,
        domain_id: &str,
        sink: EventSink,
    ) -> Result<CallbackId, DriverError>;

    /// Drops the registration; the driver releases its `EventSink`.
    fn domain_event_deregister_any(&self, id: CallbackId) -> Result<(), DriverError>;

    fn close(&self) -> Result<(), DriverError>;
}

/// Opens a driver for a connection URI.
pub trait DriverConnector: Send + Sync {
    fn open(&self, uri: &str) -> Result<Arc<dyn HypervisorDriver>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_events_native_values() {
        assert_eq!(StreamEvents::READABLE.0, 1);
        assert_eq!(StreamEvents::WRITABLE.0, 2);
        assert_eq!(StreamEvents::ERROR.0, 4);
        assert_eq!(StreamEvents::HANGUP.0, 8);
    }

    #[test]
    fn test_stream_events_contains_and_union() {
        let mask = StreamEvents::READABLE.union(StreamEvents::HANGUP);
        assert!(mask.contains(StreamEvents::READABLE));
        assert!(mask.contains(StreamEvents::HANGUP));
        assert!(!mask.contains(StreamEvents::ERROR));
        assert!(!mask.contains(StreamEvents::default()));
        assert!(StreamEvents::default().is_empty());
    }

    #[test]
    fn test_operation_invalid_message_prefix() {
        let err = DriverError::operation_invalid("domain is already running");
        assert_eq!(
            err.message(),
            "Requested operation is not valid: domain is already running"
        );
    }
}
