//! courier-client: client library for the courier messaging service.
//!
//! Connects to a courier server over WebSocket, authenticates with a bearer
//! token, and exposes the chat operations plus a stream of push events.

pub mod client;
pub mod transport;

pub use client::{ChatEvent, ConnectConfig, CourierClient};
