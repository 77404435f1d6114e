//! Envelope encoding and incremental decoders

use crate::frame::Chunks;
use crate::{Envelope, ProtocolError, Value};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Default maximum transport frame size (4MB)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// How envelopes are carried by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// MessagePack envelopes split into binary chunk frames; binary values inline
    #[default]
    Chunked,
    /// JSON text envelopes; binary values travel as separate raw frames
    Legacy,
}

/// Decoder turning reassembled bytes into a value
///
/// One decoder instance is created per chunked message.
pub trait Decoder {
    /// Decoded item
    type Item;

    /// Decode a fully reassembled payload
    fn decode(&mut self, payload: &[u8]) -> Result<Self::Item, ProtocolError>;

    /// Feed the next piece of a payload
    ///
    /// Returns `Ok(None)` while more data is needed.
    fn decode_partial(&mut self, content: &[u8]) -> Result<Option<Self::Item>, ProtocolError>;
}

/// Tracks where the top-level MessagePack value ends
///
/// MessagePack is prefix encoded, so the number of values still owed is a
/// single counter: every marker settles one value and opens one per array
/// element or two per map entry. Item headers are read once and payloads
/// are skipped, never re-read.
#[derive(Debug)]
struct ValueScanner {
    /// Start of the next unread item; may point past the buffered bytes
    /// while a string or binary payload is still arriving
    cursor: usize,
    /// Values still needed to complete the top-level value
    outstanding: u64,
}

impl ValueScanner {
    fn new() -> Self {
        Self { cursor: 0, outstanding: 1 }
    }

    /// Advance over `buf`; returns the length of the top-level value once complete
    fn advance(&mut self, buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
        while self.outstanding > 0 && self.cursor < buf.len() {
            let Some((header, payload, children)) = item_extent(&buf[self.cursor..])? else {
                return Ok(None);
            };
            self.outstanding = self.outstanding - 1 + children;
            self.cursor = self.cursor.saturating_add(header).saturating_add(payload);
        }

        if self.outstanding == 0 && self.cursor <= buf.len() {
            Ok(Some(self.cursor))
        } else {
            Ok(None)
        }
    }
}

fn be_len(bytes: &[u8], width: usize) -> Option<usize> {
    let raw = bytes.get(1..1 + width)?;
    Some(raw.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize))
}

/// Size of the item starting at `bytes[0]` as `(header, payload, children)`
///
/// `Ok(None)` means the length field is not complete yet.
fn item_extent(bytes: &[u8]) -> Result<Option<(usize, usize, u64)>, ProtocolError> {
    let marker = bytes[0];
    let sized = |width: usize, extra: usize| be_len(bytes, width).map(|len| (1 + width + extra, len, 0));
    let container =
        |width: usize, per_entry: u64| be_len(bytes, width).map(|len| (1 + width, 0, len as u64 * per_entry));

    let extent = match marker {
        0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => Some((1, 0, 0)),
        0x80..=0x8f => Some((1, 0, 2 * u64::from(marker & 0x0f))),
        0x90..=0x9f => Some((1, 0, u64::from(marker & 0x0f))),
        0xa0..=0xbf => Some((1, usize::from(marker & 0x1f), 0)),
        0xc4 | 0xd9 => sized(1, 0),
        0xc5 | 0xda => sized(2, 0),
        0xc6 | 0xdb => sized(4, 0),
        // ext: length, then a type byte before the payload
        0xc7 => sized(1, 1),
        0xc8 => sized(2, 1),
        0xc9 => sized(4, 1),
        0xcc | 0xd0 => Some((2, 0, 0)),
        0xcd | 0xd1 => Some((3, 0, 0)),
        0xca | 0xce | 0xd2 => Some((5, 0, 0)),
        0xcb | 0xcf | 0xd3 => Some((9, 0, 0)),
        // fixext: type byte plus 1, 2, 4, 8 or 16 data bytes
        0xd4 => Some((3, 0, 0)),
        0xd5 => Some((4, 0, 0)),
        0xd6 => Some((6, 0, 0)),
        0xd7 => Some((10, 0, 0)),
        0xd8 => Some((18, 0, 0)),
        0xdc => container(2, 1),
        0xdd => container(4, 1),
        0xde => container(2, 2),
        0xdf => container(4, 2),
        0xc1 => {
            return Err(ProtocolError::Serialization(
                "MessagePack decode error: reserved marker 0xc1".to_string(),
            ))
        }
    };
    Ok(extent)
}

/// MessagePack decoder for any deserializable type
///
/// Partial input is scanned for the end of the top-level value as it
/// arrives; deserialization runs once, when that value is complete.
#[derive(Debug)]
pub struct MsgpackDecoder<T> {
    buffer: BytesMut,
    scanner: ValueScanner,
    decode_passes: usize,
    _item: PhantomData<fn() -> T>,
}

impl<T> Default for MsgpackDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MsgpackDecoder<T> {
    /// Create a decoder with an empty buffer
    pub fn new() -> Self {
        Self { buffer: BytesMut::new(), scanner: ValueScanner::new(), decode_passes: 0, _item: PhantomData }
    }

    /// Bytes fed so far
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of deserialization passes run over buffered input
    pub fn decode_passes(&self) -> usize {
        self.decode_passes
    }
}

impl<T: DeserializeOwned> Decoder for MsgpackDecoder<T> {
    type Item = T;

    fn decode(&mut self, payload: &[u8]) -> Result<T, ProtocolError> {
        self.decode_passes += 1;
        Ok(rmp_serde::from_slice(payload)?)
    }

    fn decode_partial(&mut self, content: &[u8]) -> Result<Option<T>, ProtocolError> {
        self.buffer.extend_from_slice(content);
        let Some(end) = self.scanner.advance(&self.buffer)? else {
            return Ok(None);
        };

        self.decode_passes += 1;
        Ok(Some(rmp_serde::from_slice(&self.buffer[..end])?))
    }
}

/// Encoder producing transport frames for envelopes
///
/// Chunk message ids come from a per-codec wrapping counter seeded at random,
/// so ids of concurrently in-flight messages never collide.
#[derive(Debug)]
pub struct FrameCodec {
    /// Maximum frame size, header included; zero disables splitting
    max_frame_size: u32,
    /// Next chunk message id
    next_chunk_id: u32,
    /// Number of the next outgoing legacy attachment
    next_attachment: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self { max_frame_size, next_chunk_id: rand::random(), next_attachment: 1 }
    }

    /// Current maximum frame size
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Change the maximum frame size for subsequent messages
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    /// Encode an envelope into chunk frames
    pub fn encode_chunked(&mut self, envelope: &Envelope) -> Result<Vec<Bytes>, ProtocolError> {
        let payload = envelope.to_msgpack()?;
        if u32::try_from(payload.len()).is_err() {
            return Err(ProtocolError::Serialization(format!(
                "encoded message of {} bytes exceeds the chunk header range",
                payload.len()
            )));
        }

        let id = self.next_chunk_id;
        self.next_chunk_id = self.next_chunk_id.wrapping_add(1);

        Ok(Chunks::with_id(&payload, self.max_frame_size, id).collect())
    }

    /// Encode an envelope for the legacy text format
    ///
    /// Binary values in `args` and `kwargs` cannot travel inside JSON. Each
    /// one is swapped for a fresh placeholder token and returned as an
    /// attachment, declared by a header that must be sent first.
    pub fn encode_text(&mut self, envelope: &Envelope) -> Result<TextMessage, ProtocolError> {
        let mut envelope = envelope.clone();
        let mut keys = Vec::new();
        let mut attachments = Vec::new();
        let mut extract = |payload: Bytes| {
            let token = Value::placeholder(self.next_attachment);
            self.next_attachment = self.next_attachment.wrapping_add(1);
            if let Some(key) = token.as_str() {
                keys.push(key.to_string());
            }
            attachments.push(payload);
            token
        };

        for arg in envelope.args.iter_mut().flatten() {
            arg.replace_binaries(&mut extract);
        }
        for arg in envelope.kwargs.iter_mut().flat_map(|kwargs| kwargs.values_mut()) {
            arg.replace_binaries(&mut extract);
        }

        let header = if keys.is_empty() { None } else { Some(Envelope::attachment_header(keys).to_json()?) };
        Ok(TextMessage { header, attachments, text: envelope.to_json()? })
    }
}

/// Legacy text envelope with the attachments it refers to
#[derive(Debug, Clone, PartialEq)]
pub struct TextMessage {
    /// Attachment declaration, present when there are attachments
    pub header: Option<String>,
    /// Binary payloads, in the order the header declares their keys
    pub attachments: Vec<Bytes>,
    /// JSON envelope carrying placeholder tokens
    pub text: String,
}
