//! # vmgate-core
//!
//! Shared domain types for the vmgate virtual-machine lifecycle gateway.
//!
//! This crate has zero dependencies on hypervisor client libraries, sockets,
//! or async runtimes.  It describes *what* a managed domain looks like and
//! *which* hypervisor calls a lifecycle command expands to; the
//! `vmgate-server` crate decides *how* those calls reach a hypervisor.
//!
//! # Architecture overview
//!
//! - **`domain`** – Pure lifecycle types: the power-state enumeration with its
//!   native reason code, transition commands and their fixed action plans,
//!   the read-only domain snapshot, hypervisor identity, domain event payloads
//!   and the error taxonomy shared by every layer.
//!
//! - **`protocol`** – The JSON "cable" protocol spoken over the push channel:
//!   requests a browser sends (subscribe, set state, take screenshot) and the
//!   notifications the server pushes back.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `vmgate_core::Command` instead of `vmgate_core::domain::command::Command`.
pub use domain::command::{Command, DomainAction, SHUTDOWN_GRACE};
pub use domain::error::{ApiError, ErrorKind, VirtError};
pub use domain::event::{DomainEvent, EventKind, EventPayload, LifecycleEvent};
pub use domain::hypervisor::{HypervisorId, HypervisorInfo, NodeInfo};
pub use domain::snapshot::{DomainSnapshot, MemorySize, VirtualMachineView};
pub use domain::state::{DomainState, PowerState};
pub use protocol::cable::{CablePush, CableRequest};
