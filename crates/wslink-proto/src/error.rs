//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
///
/// Framing variants are scoped to a single chunk message id; none of them
/// invalidates other in-flight messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Frame shorter than the chunk header
    #[error("Frame too short for chunk header: {len} bytes")]
    TruncatedHeader {
        /// Actual frame length
        len: usize,
    },

    /// Total size disagrees with the size recorded by an earlier chunk
    #[error("Total size in chunk header for message {id} does not match total size declared by previous chunk (expected {expected}, received {received})")]
    SizeMismatch {
        /// Chunk message id
        id: u32,
        /// Size recorded by the first chunk
        expected: u32,
        /// Size carried by the offending chunk
        received: u32,
    },

    /// Chunk arrived out of order under the streaming policy
    #[error("Received an unexpected chunk for message {id} (expected offset {expected}, received offset {received})")]
    UnexpectedOffset {
        /// Chunk message id
        id: u32,
        /// Offset that was expected next
        expected: u32,
        /// Offset carried by the offending chunk
        received: u32,
    },

    /// Chunk content reaches past the declared total size
    #[error("Chunk for message {id} at offset {offset} with {len} bytes overflows total size {total}")]
    ChunkOutOfBounds {
        /// Chunk message id
        id: u32,
        /// Chunk offset
        offset: u32,
        /// Chunk content length
        len: usize,
        /// Declared total size
        total: u32,
    },

    /// A complete value was decoded before all declared bytes arrived
    #[error("Received a parsable payload shorter than expected for message {id} (expected {expected} bytes, received {received})")]
    PrematureCompletion {
        /// Chunk message id
        id: u32,
        /// Declared total size
        expected: u32,
        /// Bytes received so far
        received: u32,
    },

    /// Declared total size exceeds the allocation limit
    #[error("Total size for message {id} exceeds the allocation limit: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Chunk message id
        id: u32,
        /// Declared total size
        size: u32,
        /// Maximum allowed size
        max: usize,
    },

    /// Too many reassemblies in flight
    #[error("Too many messages pending reassembly (max: {max})")]
    TooManyPendingMessages {
        /// Maximum number of concurrent reassemblies
        max: usize,
    },

    /// Reassembled payload could not be decoded
    #[error("Malformed message {id}: {reason}")]
    Malformed {
        /// Chunk message id
        id: u32,
        /// Decoder failure
        reason: String,
        /// Leading bytes of the payload, for diagnostics only
        preview: Vec<u8>,
    },

    /// Message id does not follow `<class>:<token>:<sequence>`
    #[error("Invalid message id: {0}")]
    InvalidMessageId(String),
}

impl ProtocolError {
    /// Chunk message id the error is scoped to, if any
    pub fn message_id(&self) -> Option<u32> {
        match self {
            Self::SizeMismatch { id, .. }
            | Self::UnexpectedOffset { id, .. }
            | Self::ChunkOutOfBounds { id, .. }
            | Self::PrematureCompletion { id, .. }
            | Self::MessageTooLarge { id, .. }
            | Self::Malformed { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Whether this error describes inconsistent chunk metadata
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::TruncatedHeader { .. }
                | Self::SizeMismatch { .. }
                | Self::UnexpectedOffset { .. }
                | Self::ChunkOutOfBounds { .. }
                | Self::MessageTooLarge { .. }
                | Self::TooManyPendingMessages { .. }
        )
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("MessagePack decode error: {}", err))
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}
