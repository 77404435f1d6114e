//! Chunk header and chunk generation
//!
//! Every binary transport frame starts with a 12 byte header made of three
//! little-endian `u32`: the chunk message id, the offset of this chunk's
//! content inside the full message, and the full message size.

use crate::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of the chunk header in bytes
pub const HEADER_LEN: usize = 12;

/// Decoded chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Id shared by every chunk of one message
    pub id: u32,
    /// Offset of this chunk's content
    pub offset: u32,
    /// Size of the full message
    pub total_size: u32,
}

impl ChunkHeader {
    /// Create a new header
    pub fn new(id: u32, offset: u32, total_size: u32) -> Self {
        Self { id, offset, total_size }
    }

    /// Append the encoded header to a buffer
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.total_size);
    }

    /// Split a frame into its header and content
    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::TruncatedHeader { len: frame.len() });
        }

        let (mut header, content) = frame.split_at(HEADER_LEN);
        let id = header.get_u32_le();
        let offset = header.get_u32_le();
        let total_size = header.get_u32_le();

        Ok((Self { id, offset, total_size }, content))
    }
}

/// Lazy iterator over the frames of one chunked message
///
/// Created by [`generate_chunks`] or [`Chunks::with_id`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    payload: &'a [u8],
    id: u32,
    max_content: usize,
    offset: usize,
    done: bool,
}

impl<'a> Chunks<'a> {
    /// Chunk `payload` under an explicit message id
    ///
    /// A `max_frame_size` of zero disables splitting. Otherwise each frame
    /// holds at most `max_frame_size` bytes, header included, with at least
    /// one byte of content.
    ///
    /// # Panics
    ///
    /// Panics if `payload` is longer than `u32::MAX` bytes.
    pub fn with_id(payload: &'a [u8], max_frame_size: u32, id: u32) -> Self {
        assert!(
            u32::try_from(payload.len()).is_ok(),
            "payload of {} bytes cannot be described by a chunk header",
            payload.len()
        );

        let max_content = if max_frame_size == 0 {
            payload.len().max(1)
        } else {
            (max_frame_size as usize).saturating_sub(HEADER_LEN).max(1)
        };

        Self { payload, id, max_content, offset: 0, done: false }
    }

    /// Message id carried by every frame
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of frames this iterator yields in total
    pub fn frame_count(&self) -> usize {
        self.payload.len().div_ceil(self.max_content).max(1)
    }
}

impl Iterator for Chunks<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }

        let remaining = self.payload.len() - self.offset;
        let content_len = remaining.min(self.max_content);

        let mut frame = BytesMut::with_capacity(HEADER_LEN + content_len);
        // lengths fit in u32, checked in `with_id`
        ChunkHeader::new(self.id, self.offset as u32, self.payload.len() as u32).encode(&mut frame);
        frame.put_slice(&self.payload[self.offset..self.offset + content_len]);

        self.offset += content_len;
        self.done = self.offset == self.payload.len();

        Some(frame.freeze())
    }
}

/// Chunk `payload` under a freshly drawn random message id
pub fn generate_chunks(payload: &[u8], max_frame_size: u32) -> Chunks<'_> {
    Chunks::with_id(payload, max_frame_size, rand::random())
}
