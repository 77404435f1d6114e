//! Transport error types

use thiserror::Error;
use std::io;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Connection error: {0}")]
    Connection(String),
    
    /// Transport was used after it closed
    #[error("Transport closed")]
    Closed,
    
    /// Invalid transport configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
    
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the error only reports that the connection is gone
    pub fn is_closed(&self) -> bool {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match self {
            Self::Closed => true,
            Self::WebSocket(e) => matches!(**e, WsError::ConnectionClosed | WsError::AlreadyClosed),
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
