//! Infrastructure layer for the gateway server.
//!
//! Contains the concrete adapters: hypervisor drivers behind the
//! application's driver traits, TOML configuration storage, and the cable
//! WebSocket server.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `vmgate_core`, but MUST NOT be imported by the `application` layer
//! (tests excepted).

pub mod cable;
pub mod connector;
pub mod storage;
pub mod test_driver;
