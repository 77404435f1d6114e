//! # wslink transports
//!
//! The message-oriented transport a wslink session runs over: a WebSocket
//! client and an in-memory duplex pair.

#![warn(missing_docs)]

/// Transport abstraction
pub mod transport;

/// WebSocket transport
pub mod websocket;

/// In-memory transport pair
pub mod memory;

/// Transport error types
pub mod error;

pub use transport::{ReadyState, Transport, WireMessage};
pub use websocket::WsTransport;
pub use memory::MemoryTransport;
pub use error::TransportError;
