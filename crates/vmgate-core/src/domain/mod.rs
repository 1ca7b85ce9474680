//! Domain entities for vmgate.
//!
//! This module contains pure lifecycle logic with no infrastructure
//! dependencies.  Every type here can be constructed and tested without a
//! hypervisor, which is what lets the server crate swap the real client
//! library for an in-memory driver in tests.
//!
//! Domain state is authoritative in the hypervisor, never here.  A
//! [`snapshot::DomainSnapshot`] is a copy taken at one point in time; nothing
//! in this module keeps it in sync.

/// Power states and their native reason codes.
pub mod state;

/// Transition commands and the hypervisor call plan each one expands to.
pub mod command;

/// The read-only projection of a domain.
pub mod snapshot;

/// Hypervisor identity and node capability info.
pub mod hypervisor;

/// Domain event kinds and payloads.
pub mod event;

/// The error taxonomy shared by every layer.
pub mod error;
