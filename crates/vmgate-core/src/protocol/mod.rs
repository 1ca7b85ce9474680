//! Wire protocols.
//!
//! - **`cable`** – JSON messages exchanged over the WebSocket push channel.

pub mod cable;
