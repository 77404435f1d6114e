//! Sans-io protocol state machine
//!
//! [`SessionCore`] owns every piece of per-connection protocol state: the
//! handshake, the pending call table, subscriptions, reassembly and legacy
//! attachments. It never touches the transport. Outbound frames are pushed
//! on a channel drained by the driver, inbound messages are handed in by the
//! driver, and caller-visible effects are returned as [`Delivery`] values so
//! they can be applied after the core lock is released.

use crate::attachment::AttachmentQueue;
use crate::session::{ConnectionEvent, SessionConfig, SessionState};
use crate::subscription::{Callback, SubscriptionRegistry};
use crate::{Result, SessionError, CLIENT_ERROR};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use wslink_proto::{
    Envelope, FrameCodec, MessageClass, MessageId, MsgpackDecoder, ProtocolError, RpcError, Unchunker, Value,
    WireFormat,
};
use wslink_transport::{TransportError, WireMessage};

/// Sender half of a pending call
pub(crate) type ReplySender = oneshot::Sender<Result<Value>>;

/// Work for the session driver
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Send a message on the transport
    Message(WireMessage),
    /// Close the transport and stop
    Close,
}

/// Caller-visible effect produced while the core was locked
pub(crate) enum Delivery {
    /// Settle a pending call
    Reply { tx: ReplySender, outcome: Result<Value> },
    /// Run topic callbacks with a one-element payload
    Publish { callbacks: Vec<Callback>, payload: Vec<Value> },
}

impl Delivery {
    fn apply(self) {
        match self {
            Self::Reply { tx, outcome } => {
                if tx.send(outcome).is_err() {
                    debug!("Reply dropped, caller no longer waiting");
                }
            }
            Self::Publish { callbacks, payload } => {
                for callback in callbacks {
                    callback(&payload);
                }
            }
        }
    }
}

/// Apply deliveries; must be called without holding the core lock
pub(crate) fn deliver(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        delivery.apply();
    }
}

/// Lock the core, recovering from a poisoned lock
pub(crate) fn lock(core: &Mutex<SessionCore>) -> MutexGuard<'_, SessionCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Protocol state of one session
pub(crate) struct SessionCore {
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: mpsc::UnboundedSender<Outbound>,
    codec: FrameCodec,
    unchunker: Unchunker<MsgpackDecoder<Envelope>>,
    next_sequence: u64,
    pending: HashMap<MessageId, ReplySender>,
    subscriptions: SubscriptionRegistry,
    attachments: AttachmentQueue,
    handshake_error: Option<RpcError>,
}

impl SessionCore {
    pub(crate) fn new(
        config: SessionConfig,
        state_tx: watch::Sender<SessionState>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let codec = FrameCodec::with_max_frame_size(config.max_frame_size);
        let unchunker = Unchunker::new(config.reassembly)
            .with_max_message_size(config.max_message_size)
            .with_max_pending_messages(config.max_pending_messages);

        Self {
            config,
            state_tx,
            events,
            outbound,
            codec,
            unchunker,
            next_sequence: 0,
            pending: HashMap::new(),
            subscriptions: SubscriptionRegistry::new(),
            attachments: AttachmentQueue::new(),
            handshake_error: None,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&mut self, state: SessionState) {
        debug!("Session state -> {:?}", state);
        self.state_tx.send_replace(state);
    }

    fn ready_client_id(&self) -> Option<String> {
        match &*self.state_tx.borrow() {
            SessionState::Ready { client_id } => Some(client_id.clone()),
            _ => None,
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            debug!("Connection event dropped, no listener");
        }
    }

    pub(crate) fn handshake_error(&self) -> Option<&RpcError> {
        self.handshake_error.as_ref()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        self.codec.max_frame_size()
    }

    /// Send the hello envelope and wait for its reply
    pub(crate) fn begin_handshake(&mut self) -> Result<()> {
        if self.state() != SessionState::Disconnected {
            warn!("Handshake requested in state {:?}, ignored", self.state());
            return Ok(());
        }

        self.set_state(SessionState::Handshaking);
        let hello = Envelope::hello(&self.config.secret);
        self.send_envelope(&hello)
    }

    fn encode(&mut self, envelope: &Envelope) -> std::result::Result<Vec<WireMessage>, ProtocolError> {
        match self.config.wire_format {
            WireFormat::Chunked => {
                let frames = self.codec.encode_chunked(envelope)?;
                Ok(frames.into_iter().map(WireMessage::Binary).collect())
            }
            WireFormat::Legacy => {
                let message = self.codec.encode_text(envelope)?;
                let mut frames = Vec::with_capacity(message.attachments.len() + 2);
                if let Some(header) = message.header {
                    debug!("Sending {} binary attachments", message.attachments.len());
                    frames.push(WireMessage::Text(header));
                }
                frames.extend(message.attachments.into_iter().map(WireMessage::Binary));
                frames.push(WireMessage::Text(message.text));
                Ok(frames)
            }
        }
    }

    fn send_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        let frames = self.encode(envelope)?;
        self.send_frames(frames)
    }

    fn send_frames(&self, frames: Vec<WireMessage>) -> Result<()> {
        for frame in frames {
            self.outbound.send(Outbound::Message(frame)).map_err(|_| SessionError::Closed)?;
        }
        Ok(())
    }

    /// Issue a request; fails without sending anything unless ready
    pub(crate) fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<(MessageId, oneshot::Receiver<Result<Value>>)> {
        let Some(client_id) = self.ready_client_id() else {
            return Err(SessionError::client_side(format!(
                "RPC call {} unsuccessful: connection not open",
                method
            )));
        };

        let id = MessageId::rpc(client_id, self.next_sequence);
        self.next_sequence += 1;

        let frames = self.encode(&Envelope::request(id.clone(), method, args, kwargs))?;
        debug!("Calling {} as {} ({} frames)", method, id, frames.len());

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        if let Err(e) = self.send_frames(frames) {
            self.pending.remove(&id);
            return Err(e);
        }

        Ok((id, rx))
    }

    pub(crate) fn subscribe(&mut self, topic: &str, callback: Callback) -> Result<()> {
        if self.ready_client_id().is_none() {
            return Err(SessionError::client_side(format!(
                "Subscribe call {} unsuccessful: connection not open",
                topic
            )));
        }

        self.subscriptions.add(topic, callback);
        debug!("Subscribed to {} ({} callbacks)", topic, self.subscriptions.count(topic));
        Ok(())
    }

    pub(crate) fn unsubscribe(&mut self, topic: &str, callback: &Callback) -> Result<()> {
        self.subscriptions.remove(topic, callback)?;
        debug!("Unsubscribed from {}", topic);
        Ok(())
    }

    /// Process one message delivered by the transport
    pub(crate) fn handle_wire_message(&mut self, message: WireMessage) -> Vec<Delivery> {
        match message {
            WireMessage::Binary(data) => match self.config.wire_format {
                WireFormat::Chunked => match self.unchunker.process_chunk(&data, MsgpackDecoder::new) {
                    Ok(Some(envelope)) => self.route(envelope),
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        report_protocol_error(&e);
                        Vec::new()
                    }
                },
                WireFormat::Legacy => {
                    if !self.attachments.fill(data) {
                        error!("Missing header for received binary message");
                    }
                    Vec::new()
                }
            },
            WireMessage::Text(text) => match Envelope::from_json(&text) {
                Ok(envelope) => self.route(envelope),
                Err(e) => {
                    error!("Dropping malformed text message: {}", e);
                    Vec::new()
                }
            },
        }
    }

    /// Route a decoded envelope by the class of its id
    pub(crate) fn route(&mut self, mut envelope: Envelope) -> Vec<Delivery> {
        let Some(id) = envelope.id.take() else {
            self.handle_notification(envelope);
            return Vec::new();
        };

        if let Some(err) = envelope.error.take() {
            // pending attachments never outlive an error reply
            self.attachments.clear();
            return self.route_error(id, err);
        }

        let mut result = envelope.result.take().unwrap_or_default();
        if !self.attachments.is_empty() {
            for token in self.attachments.substitute(&mut result) {
                error!("Binary attachment key {} found without matching attachment", token);
            }
        }

        match id.class {
            MessageClass::Rpc => match self.pending.remove(&id) {
                Some(tx) => vec![Delivery::Reply { tx, outcome: Ok(result) }],
                None => {
                    debug!("Reply {} without matching call, dropped", id);
                    Vec::new()
                }
            },
            MessageClass::Publish => {
                let callbacks = self.subscriptions.callbacks(&id.token);
                if callbacks.is_empty() {
                    return Vec::new();
                }
                vec![Delivery::Publish { callbacks, payload: vec![result] }]
            }
            MessageClass::System if id.is_handshake() => self.complete_handshake(result),
            MessageClass::System => {
                error!("Unknown system message {}", id);
                let message = format!("Unknown system message {}", id);
                self.pending
                    .remove(&id)
                    .map(|tx| Delivery::Reply { tx, outcome: Err(SessionError::client_side(message)) })
                    .into_iter()
                    .collect()
            }
        }
    }

    fn route_error(&mut self, id: MessageId, err: RpcError) -> Vec<Delivery> {
        if id.is_handshake() {
            return self.fail_handshake(err);
        }

        match self.pending.remove(&id) {
            Some(tx) => vec![Delivery::Reply { tx, outcome: Err(SessionError::Server(err)) }],
            None => {
                error!("Server error for {}: {}", id, err);
                Vec::new()
            }
        }
    }

    fn handle_notification(&mut self, envelope: Envelope) {
        if envelope.is_attachment_header() {
            let keys: Vec<String> = envelope
                .args
                .unwrap_or_default()
                .iter()
                .filter_map(|key| key.as_str().map(str::to_owned))
                .collect();
            debug!("Expecting {} binary attachments", keys.len());
            self.attachments.declare(keys);
        } else {
            debug!("Ignoring notification {:?}", envelope.method);
        }
    }

    fn complete_handshake(&mut self, result: Value) -> Vec<Delivery> {
        if self.state() != SessionState::Handshaking {
            warn!("Handshake reply in state {:?}, ignored", self.state());
            return Vec::new();
        }

        let Some(client_id) = result.get("clientID").and_then(Value::as_str).map(str::to_owned) else {
            return self.fail_handshake(RpcError::new(CLIENT_ERROR, "Handshake reply carried no clientID"));
        };

        if let Some(max) = result.get("maxMsgSize").and_then(Value::as_u64) {
            let max = u32::try_from(max).unwrap_or(u32::MAX);
            debug!("Server negotiated a maximum frame size of {} bytes", max);
            self.codec.set_max_frame_size(max);
        }

        info!("Session ready as client {}", client_id);
        self.set_state(SessionState::Ready { client_id: client_id.clone() });
        self.emit(ConnectionEvent::Ready { client_id });
        Vec::new()
    }

    fn fail_handshake(&mut self, err: RpcError) -> Vec<Delivery> {
        error!("Handshake failed: {}", err);
        self.handshake_error = Some(err.clone());
        self.emit(ConnectionEvent::Error(SessionError::Handshake(err)));
        self.shutdown(true)
    }

    /// Report a transport failure to the connection listener
    pub(crate) fn report_transport_error(&self, err: TransportError) {
        self.emit(ConnectionEvent::Error(SessionError::Transport(err)));
    }

    /// Tear the session down
    ///
    /// Rejects every pending call, drops reassembly and attachment state and,
    /// when `locally` is set, asks the driver to close the transport. The
    /// closed event is emitted once.
    pub(crate) fn shutdown(&mut self, locally: bool) -> Vec<Delivery> {
        let deliveries = self
            .pending
            .drain()
            .map(|(_, tx)| Delivery::Reply { tx, outcome: Err(SessionError::Closed) })
            .collect::<Vec<_>>();
        self.attachments.clear();
        self.unchunker.release_pending_messages();

        if self.state() != SessionState::Closed {
            info!("Session closed ({} pending calls rejected)", deliveries.len());
            self.set_state(SessionState::Closed);
            if locally && self.outbound.send(Outbound::Close).is_err() {
                debug!("Driver already stopped");
            }
            self.emit(ConnectionEvent::Closed { locally });
        }

        deliveries
    }
}

fn report_protocol_error(err: &ProtocolError) {
    if err.is_framing() {
        warn!("Framing error, chunk message {:?} discarded: {}", err.message_id(), err);
    } else {
        error!("Dropping malformed message: {}", err);
    }
}

#[cfg(test)]
mod tests;
