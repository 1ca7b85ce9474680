//! The cable: a WebSocket push channel for browsers.
//!
//! - Binding the TCP listener and accepting connections
//! - Performing the WebSocket upgrade handshake
//! - Parsing JSON text frames into `CableRequest`s for a `CableSession`
//! - Writing every `CablePush` back as a JSON text frame
//!
//! What a request does is decided in `application::cable_session`; this
//! module only moves frames.

pub mod ws_server;

pub use ws_server::{CableServer, CableServerConfig};
