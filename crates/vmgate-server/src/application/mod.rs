//! Application layer: everything between the domain types in `vmgate-core`
//! and a concrete hypervisor driver.
//!
//! # What lives here? (for beginners)
//!
//! The code in this layer talks to a hypervisor only through the traits in
//! [`driver`].  It never opens sockets, never reads files and never links a
//! native client library, so every use case can be exercised in tests with
//! the in-memory driver or a `mockall` double.
//!
//! # Sub-modules
//!
//! - **`driver`**        – The seam: blocking domain calls, event
//!   registration and byte streams, as a driver exposes them.
//! - **`connection`**    – A live hypervisor connection and the domain
//!   handles obtained from it.  Closing it invalidates everything derived.
//! - **`snapshot`**      – Builds a read-only `DomainSnapshot` from a handle.
//! - **`transition`**    – Turns a `Command` into its fixed sequence of
//!   hypervisor calls, aborting on the first failure.
//! - **`events`**        – Per-subscription event delivery off the driver's
//!   notification context.
//! - **`screenshot`**    – Framebuffer capture over a stream, as a callback
//!   API and as an async chunk reader.
//! - **`catalog`**       – The pool of configured hypervisors and lookups
//!   across all of them.
//! - **`api`**           – JSON rendering and dispatch for the read-only
//!   hypervisor and virtual-machine endpoints.
//! - **`cable_session`** – One push-channel client: subscriptions, state
//!   changes and screenshots requested over the cable.

pub mod api;
pub mod cable_session;
pub mod catalog;
pub mod connection;
pub mod driver;
pub mod events;
pub mod screenshot;
pub mod snapshot;
pub mod transition;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
