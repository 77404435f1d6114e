//! Chunk reassembly
//!
//! Frames of different messages may be interleaved arbitrarily. Two policies
//! decide how frames of the same message are handled:
//!
//! * [`ReassemblyPolicy::Buffered`] allocates the full message on its first
//!   chunk and writes every chunk at its declared offset, so chunks of one
//!   message may arrive in any order.
//! * [`ReassemblyPolicy::Streaming`] feeds each chunk straight into the
//!   message decoder and requires chunks of one message to arrive in order.
//!   Memory only grows as content arrives, and each chunk is scanned once.
//!
//! Both policies reject a first chunk claiming more than the configured
//! maximum message size, or arriving while too many messages are pending,
//! before allocating anything for it.

use crate::frame::{ChunkHeader, HEADER_LEN};
use crate::{Decoder, ProtocolError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default bound on the declared size of one message (256MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Default bound on concurrently reassembled messages
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 64;

/// Smallest frame able to carry content
pub const MIN_FRAME_SIZE: usize = HEADER_LEN + 1;

/// Bytes of payload kept in malformed-message diagnostics
const PREVIEW_LEN: usize = 100;

/// Reassembly policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReassemblyPolicy {
    /// Preallocate and write chunks at their offsets
    Buffered,
    /// Feed chunks to the decoder in arrival order
    #[default]
    Streaming,
}

#[derive(Debug)]
enum PendingMessage<D> {
    Buffered {
        received_size: u32,
        content: Vec<u8>,
        decoder: D,
    },
    Streaming {
        received_size: u32,
        total_size: u32,
        decoder: D,
    },
}

impl<D> PendingMessage<D> {
    fn total_size(&self) -> u32 {
        match self {
            // buffer length is the declared size, which fits u32
            Self::Buffered { content, .. } => content.len() as u32,
            Self::Streaming { total_size, .. } => *total_size,
        }
    }
}

/// Reassembles chunk frames into decoded messages
#[derive(Debug)]
pub struct Unchunker<D> {
    policy: ReassemblyPolicy,
    pending: HashMap<u32, PendingMessage<D>>,
    max_message_size: usize,
    max_pending_messages: usize,
}

impl<D: Decoder> Unchunker<D> {
    /// Create an unchunker with default limits
    pub fn new(policy: ReassemblyPolicy) -> Self {
        Self {
            policy,
            pending: HashMap::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
        }
    }

    /// Set the maximum declared size of one message
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Set the maximum number of messages reassembled at once
    pub fn with_max_pending_messages(mut self, max: usize) -> Self {
        self.max_pending_messages = max;
        self
    }

    /// Active policy
    pub fn policy(&self) -> ReassemblyPolicy {
        self.policy
    }

    /// Number of messages currently being reassembled
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop all partially reassembled messages
    pub fn release_pending_messages(&mut self) {
        self.pending.clear();
    }

    /// Process one frame
    ///
    /// `decoder_factory` is only called for the first chunk of a message.
    /// Returns the decoded item once the message is complete, `Ok(None)`
    /// while chunks are still missing. Errors only discard the offending
    /// message; other pending messages are untouched.
    pub fn process_chunk<F>(&mut self, frame: &[u8], decoder_factory: F) -> Result<Option<D::Item>, ProtocolError>
    where
        F: FnOnce() -> D,
    {
        let (header, content) = ChunkHeader::decode(frame)?;
        let id = header.id;

        if !self.pending.contains_key(&id) {
            self.admit(header, decoder_factory)?;
        }

        let Some(entry) = self.pending.get_mut(&id) else {
            return Ok(None);
        };

        let expected_total = entry.total_size();
        if header.total_size != expected_total {
            self.pending.remove(&id);
            return Err(ProtocolError::SizeMismatch {
                id,
                expected: expected_total,
                received: header.total_size,
            });
        }

        if header.offset as usize + content.len() > expected_total as usize {
            self.pending.remove(&id);
            return Err(ProtocolError::ChunkOutOfBounds {
                id,
                offset: header.offset,
                len: content.len(),
                total: expected_total,
            });
        }

        // content fits within total_size, a u32
        let content_len = content.len() as u32;

        match entry {
            PendingMessage::Buffered { received_size, content: buffer, .. } => {
                let start = header.offset as usize;
                buffer[start..start + content.len()].copy_from_slice(content);
                *received_size = received_size.saturating_add(content_len);

                if *received_size < expected_total {
                    return Ok(None);
                }

                let Some(PendingMessage::Buffered { content: buffer, mut decoder, .. }) = self.pending.remove(&id)
                else {
                    return Ok(None);
                };
                decoder.decode(&buffer).map(Some).map_err(|e| malformed(id, e, &buffer))
            }
            PendingMessage::Streaming { received_size, decoder, .. } => {
                if header.offset != *received_size {
                    let expected = *received_size;
                    self.pending.remove(&id);
                    return Err(ProtocolError::UnexpectedOffset { id, expected, received: header.offset });
                }

                *received_size += content_len;
                let received = *received_size;

                let decoded = match decoder.decode_partial(content) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        self.pending.remove(&id);
                        return Err(malformed(id, e, content));
                    }
                };

                match decoded {
                    Some(_) if received < expected_total => {
                        self.pending.remove(&id);
                        Err(ProtocolError::PrematureCompletion { id, expected: expected_total, received })
                    }
                    Some(item) => {
                        self.pending.remove(&id);
                        Ok(Some(item))
                    }
                    None if received >= expected_total => {
                        self.pending.remove(&id);
                        Err(ProtocolError::Malformed {
                            id,
                            reason: "message ended before a complete value was decoded".to_string(),
                            preview: Vec::new(),
                        })
                    }
                    None => Ok(None),
                }
            }
        }
    }

    fn admit<F>(&mut self, header: ChunkHeader, decoder_factory: F) -> Result<(), ProtocolError>
    where
        F: FnOnce() -> D,
    {
        if header.total_size as usize > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                id: header.id,
                size: header.total_size,
                max: self.max_message_size,
            });
        }
        if self.pending.len() >= self.max_pending_messages {
            return Err(ProtocolError::TooManyPendingMessages { max: self.max_pending_messages });
        }

        let entry = match self.policy {
            ReassemblyPolicy::Buffered => PendingMessage::Buffered {
                received_size: 0,
                content: vec![0; header.total_size as usize],
                decoder: decoder_factory(),
            },
            ReassemblyPolicy::Streaming => PendingMessage::Streaming {
                received_size: 0,
                total_size: header.total_size,
                decoder: decoder_factory(),
            },
        };
        self.pending.insert(header.id, entry);
        Ok(())
    }
}

fn malformed(id: u32, err: ProtocolError, payload: &[u8]) -> ProtocolError {
    ProtocolError::Malformed {
        id,
        reason: err.to_string(),
        preview: payload[..payload.len().min(PREVIEW_LEN)].to_vec(),
    }
}
