//! Scripted in-memory server for end-to-end session tests

#![allow(dead_code)]

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use wslink::proto::{Envelope, FrameCodec, MessageId, MsgpackDecoder, ReassemblyPolicy, Unchunker, Value, WireFormat};
use wslink::transport::{MemoryTransport, Transport, WireMessage};
use wslink::{ConnectionEvents, Session, SessionConfig};

/// Install a test log subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a session over an in-memory transport
pub fn start(config: SessionConfig) -> (Session, ConnectionEvents, ScriptedServer) {
    init_tracing();

    let wire_format = config.wire_format;
    let (client, server) = MemoryTransport::pair();
    let (session, events) = Session::start(client, config);
    (session, events, ScriptedServer::new(server, wire_format))
}

/// Server side of the connection, driven step by step by a test
pub struct ScriptedServer {
    transport: MemoryTransport,
    wire_format: WireFormat,
    codec: FrameCodec,
    unchunker: Unchunker<MsgpackDecoder<Envelope>>,
    /// Sizes of the binary frames that made up the last request
    pub last_frame_sizes: Vec<usize>,
}

impl ScriptedServer {
    fn new(transport: MemoryTransport, wire_format: WireFormat) -> Self {
        Self {
            transport,
            wire_format,
            codec: FrameCodec::new(),
            unchunker: Unchunker::new(ReassemblyPolicy::Buffered),
            last_frame_sizes: Vec::new(),
        }
    }

    /// Limit the size of frames sent to the client
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.codec.set_max_frame_size(max_frame_size);
    }

    /// Next envelope from the client, or `None` once it hung up
    pub async fn next_request(&mut self) -> Result<Option<Envelope>> {
        self.last_frame_sizes.clear();
        loop {
            let message = match self.transport.recv().await {
                Some(message) => message?,
                None => return Ok(None),
            };

            match message {
                WireMessage::Binary(frame) => {
                    self.last_frame_sizes.push(frame.len());
                    if let Some(envelope) = self.unchunker.process_chunk(&frame, MsgpackDecoder::new)? {
                        return Ok(Some(envelope));
                    }
                }
                WireMessage::Text(text) => return Ok(Some(Envelope::from_json(&text)?)),
            }
        }
    }

    /// Next envelope from the client, failing if it hung up
    pub async fn expect_request(&mut self) -> Result<Envelope> {
        self.next_request().await?.context("client closed the connection")
    }

    /// Send an envelope in the session's wire format
    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        match self.wire_format {
            WireFormat::Chunked => {
                for frame in self.codec.encode_chunked(envelope)? {
                    self.transport.send(WireMessage::Binary(frame)).await?;
                }
            }
            WireFormat::Legacy => self.transport.send(WireMessage::Text(envelope.to_json()?)).await?,
        }
        Ok(())
    }

    /// Send a raw transport message
    pub async fn send_raw(&mut self, message: impl Into<WireMessage>) -> Result<()> {
        self.transport.send(message.into()).await?;
        Ok(())
    }

    /// Answer the hello, optionally negotiating a frame size
    ///
    /// Returns the hello envelope.
    pub async fn accept(&mut self, client_id: &str, max_msg_size: Option<u64>) -> Result<Envelope> {
        let hello = self.expect_request().await?;
        if hello.id != Some(MessageId::handshake()) {
            bail!("expected hello, got {:?}", hello);
        }

        let mut result = BTreeMap::new();
        result.insert("clientID".to_string(), Value::from(client_id));
        if let Some(max) = max_msg_size {
            result.insert("maxMsgSize".to_string(), Value::from(max));
        }
        self.send(&Envelope::reply(MessageId::handshake(), result)).await?;
        Ok(hello)
    }

    /// Reply to the next request with `f(request)`
    pub async fn answer<F>(&mut self, f: F) -> Result<Envelope>
    where
        F: FnOnce(&Envelope) -> Value,
    {
        let request = self.expect_request().await?;
        let id = request.id.clone().context("request without id")?;
        self.send(&Envelope::reply(id, f(&request))).await?;
        Ok(request)
    }

    /// Hang up
    pub async fn close(mut self) -> Result<()> {
        self.transport.close().await?;
        Ok(())
    }
}
