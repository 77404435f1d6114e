//! # wslink protocol
//!
//! Envelope model, chunked binary framing, reassembly and codec for the
//! wslink RPC / publish-subscribe protocol.

#![warn(missing_docs)]

/// Dynamic payload values
pub mod value;

/// Envelope, message ids and error payloads
pub mod message;

/// Chunk header and chunk generation
pub mod frame;

/// Chunk reassembly
pub mod unchunk;

/// Envelope encoding and incremental decoders
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::{Decoder, FrameCodec, MsgpackDecoder, TextMessage, WireFormat};
pub use error::ProtocolError;
pub use frame::{generate_chunks, ChunkHeader, Chunks, HEADER_LEN};
pub use message::{Envelope, MessageClass, MessageId, RpcError};
pub use unchunk::{ReassemblyPolicy, Unchunker};
pub use value::Value;
