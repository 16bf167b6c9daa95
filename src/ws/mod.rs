//! Websocket transport modules.
//!
//! - `client`: endpoint selection, handshake, and the connection adapter.
//! - `proto`: audio framing and the messages exchanged with the server.

/// Websocket client and connection halves.
pub mod client;
/// Wire framing and protocol messages.
pub mod proto;
