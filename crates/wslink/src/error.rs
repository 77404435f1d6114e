//! Error types for the wslink client

use thiserror::Error;
use wslink_proto::{ProtocolError, RpcError};
use wslink_transport::TransportError;

/// Code of errors raised locally and never sent over the wire
pub const CLIENT_ERROR: i64 = -32099;

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport failed or closed unexpectedly
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    
    /// Handshake was refused
    #[error("Handshake failed: {0}")]
    Handshake(RpcError),
    
    /// Local precondition failure
    #[error("{message}")]
    ClientSide {
        /// Always [`CLIENT_ERROR`]
        code: i64,
        /// Error message
        message: String,
    },
    
    /// Error reply from the server
    #[error("Server error: {0}")]
    Server(RpcError),
    
    /// Framing or payload error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    
    /// Session closed before the operation completed
    #[error("Session closed")]
    Closed,
    
    /// Queued task panicked or was cancelled
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl SessionError {
    /// Create a client-side error
    pub fn client_side(message: impl Into<String>) -> Self {
        Self::ClientSide { code: CLIENT_ERROR, message: message.into() }
    }

    /// Numeric code, for errors that carry one
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::ClientSide { code, .. } => Some(*code),
            Self::Handshake(e) | Self::Server(e) => Some(e.code),
            _ => None,
        }
    }

    /// Whether the error was raised locally without touching the wire
    pub fn is_client_side(&self) -> bool {
        matches!(self, Self::ClientSide { .. })
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskFailed(err.to_string())
    }
}
