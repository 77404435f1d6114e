//! Transport abstraction

use async_trait::async_trait;
use crate::TransportError;
use bytes::Bytes;
use std::fmt;

/// One message delivered by a message-oriented transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// UTF-8 text message
    Text(String),
    /// Binary message
    Binary(Bytes),
}

impl WireMessage {
    /// Whether this is a binary message
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for WireMessage {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for WireMessage {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Opening handshake in progress
    Connecting,
    /// Messages can be sent
    Open,
    /// Close requested, not yet acknowledged
    Closing,
    /// Connection is gone
    Closed,
}

impl ReadyState {
    /// Whether messages can be sent
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Message-oriented, ordered, bidirectional transport
///
/// `recv` must be cancel safe: a session driver polls it inside
/// `tokio::select!` next to its outbound queue.
#[async_trait]
pub trait Transport: Send {
    /// Send one message
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    /// Receive the next message
    ///
    /// Returns `None` once the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<WireMessage, TransportError>>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Current connection state
    fn ready_state(&self) -> ReadyState;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> Option<Result<WireMessage, TransportError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }

    fn ready_state(&self) -> ReadyState {
        (**self).ready_state()
    }
}
