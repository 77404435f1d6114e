//! Unit tests for the protocol state machine

use super::*;
use bytes::Bytes;
use proptest::prelude::*;
use std::sync::Arc;
use wslink_proto::{Chunks, ReassemblyPolicy};

/// Core plus the far ends of its channels
struct Harness {
    core: SessionCore,
    state_rx: watch::Receiver<SessionState>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    server_codec: FrameCodec,
    server_unchunker: Unchunker<MsgpackDecoder<Envelope>>,
}

impl Harness {
    fn new(config: SessionConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();

        Self {
            core: SessionCore::new(config, state_tx, events_tx, outbound_tx),
            state_rx,
            events,
            outbound,
            server_codec: FrameCodec::with_max_frame_size(0),
            server_unchunker: Unchunker::new(ReassemblyPolicy::Buffered),
        }
    }

    /// Harness whose handshake completed with client id `c3`
    fn ready(config: SessionConfig) -> Self {
        let mut harness = Self::new(config);
        harness.core.begin_handshake().unwrap();
        harness.sent();

        let reply = Envelope::reply(MessageId::handshake(), handshake_result("c3", None));
        assert!(harness.receive(&reply).is_empty());
        assert!(matches!(harness.events.try_recv(), Ok(ConnectionEvent::Ready { .. })));
        harness
    }

    fn drain(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            out.push(item);
        }
        out
    }

    /// Envelopes the core queued for sending
    fn sent(&mut self) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        for item in self.drain() {
            match item {
                Outbound::Message(WireMessage::Binary(frame)) => {
                    if let Some(env) = self.server_unchunker.process_chunk(&frame, MsgpackDecoder::new).unwrap() {
                        envelopes.push(env);
                    }
                }
                Outbound::Message(WireMessage::Text(text)) => envelopes.push(Envelope::from_json(&text).unwrap()),
                Outbound::Close => {}
            }
        }
        envelopes
    }

    /// Feed an envelope the way the server would send it
    fn receive(&mut self, envelope: &Envelope) -> Vec<Delivery> {
        let messages = match self.core.config.wire_format {
            WireFormat::Chunked => self
                .server_codec
                .encode_chunked(envelope)
                .unwrap()
                .into_iter()
                .map(WireMessage::Binary)
                .collect::<Vec<_>>(),
            WireFormat::Legacy => vec![WireMessage::Text(envelope.to_json().unwrap())],
        };

        messages.into_iter().flat_map(|m| self.core.handle_wire_message(m)).collect()
    }
}

fn handshake_result(client_id: &str, max_msg_size: Option<u64>) -> Value {
    let mut map = BTreeMap::new();
    map.insert("clientID".to_string(), Value::from(client_id));
    if let Some(max) = max_msg_size {
        map.insert("maxMsgSize".to_string(), Value::from(max));
    }
    Value::Map(map)
}

fn legacy_config() -> SessionConfig {
    SessionConfig { wire_format: WireFormat::Legacy, ..SessionConfig::default() }
}

fn settle(deliveries: Vec<Delivery>, mut rx: oneshot::Receiver<Result<Value>>) -> Result<Value> {
    deliver(deliveries);
    rx.try_recv().expect("call not settled")
}

#[test]
fn test_call_before_ready_sends_nothing() {
    let mut harness = Harness::new(SessionConfig::default());

    let err = harness.core.call("math.add", vec![], BTreeMap::new()).unwrap_err();
    assert!(err.is_client_side());
    assert_eq!(err.code(), Some(CLIENT_ERROR));
    assert_eq!(err.to_string(), "RPC call math.add unsuccessful: connection not open");
    assert!(harness.drain().is_empty());

    harness.core.begin_handshake().unwrap();
    harness.drain();
    assert!(harness.core.call("math.add", vec![], BTreeMap::new()).is_err());
    assert!(harness.drain().is_empty());
}

#[test]
fn test_handshake_sends_secret() {
    let config = SessionConfig { secret: "s3cret".to_string(), ..SessionConfig::default() };
    let mut harness = Harness::new(config);

    harness.core.begin_handshake().unwrap();
    assert_eq!(*harness.state_rx.borrow(), SessionState::Handshaking);

    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    let hello = &sent[0];
    assert_eq!(hello.id, Some(MessageId::handshake()));
    assert_eq!(hello.method.as_deref(), Some("wslink.hello"));
    assert_eq!(hello.version, "1.0");
    let args = hello.args.as_ref().unwrap();
    assert_eq!(args[0].get("secret"), Some(&Value::from("s3cret")));
}

#[test]
fn test_handshake_reply_makes_session_ready() {
    let harness = Harness::ready(SessionConfig::default());

    assert_eq!(*harness.state_rx.borrow(), SessionState::Ready { client_id: "c3".to_string() });
    assert!(harness.core.handshake_error().is_none());
}

#[test]
fn test_sequential_call_ids() {
    let mut harness = Harness::ready(SessionConfig::default());

    let (first, _rx1) = harness.core.call("math.add", vec![], BTreeMap::new()).unwrap();
    let (second, _rx2) = harness.core.call("math.add", vec![], BTreeMap::new()).unwrap();

    assert_eq!(first.to_string(), "rpc:c3:0");
    assert_eq!(second.to_string(), "rpc:c3:1");

    let sent = harness.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].id, Some(first));
    assert_eq!(sent[1].id, Some(second));
    assert_eq!(harness.core.pending_count(), 2);
}

#[test]
fn test_reply_resolves_call() {
    let mut harness = Harness::ready(SessionConfig::default());
    let numbers = Value::Array(vec![1.into(), 2.into(), 3.into()]);
    let (id, rx) = harness.core.call("math.add", vec![numbers.clone()], BTreeMap::new()).unwrap();

    let request = harness.sent().pop().unwrap();
    assert_eq!(request.method.as_deref(), Some("math.add"));
    assert_eq!(request.args, Some(vec![numbers]));
    assert_eq!(request.kwargs, Some(BTreeMap::new()));

    let deliveries = harness.receive(&Envelope::reply(id, 6));
    assert_eq!(settle(deliveries, rx).unwrap(), Value::from(6));
    assert_eq!(harness.core.pending_count(), 0);
}

#[test]
fn test_error_reply_rejects_call() {
    let mut harness = Harness::ready(SessionConfig::default());
    let (id, rx) = harness.core.call("math.div", vec![], BTreeMap::new()).unwrap();

    let deliveries = harness.receive(&Envelope::error_reply(id, RpcError::new(-32000, "division by zero")));
    match settle(deliveries, rx) {
        Err(SessionError::Server(err)) => {
            assert_eq!(err.code, -32000);
            assert_eq!(err.message, "division by zero");
        }
        other => panic!("expected server error, got {:?}", other),
    }
}

#[test]
fn test_unmatched_reply_is_ignored() {
    let mut harness = Harness::ready(SessionConfig::default());

    assert!(harness.receive(&Envelope::reply(MessageId::rpc("c3", 41), 1)).is_empty());
    assert!(harness
        .receive(&Envelope::error_reply(MessageId::rpc("c3", 42), RpcError::new(1, "late")))
        .is_empty());
    assert!(harness.state_rx.borrow().is_ready());
}

#[test]
fn test_duplicate_reply_settles_once() {
    let mut harness = Harness::ready(SessionConfig::default());
    let (id, rx) = harness.core.call("echo", vec![], BTreeMap::new()).unwrap();

    let first = harness.receive(&Envelope::reply(id.clone(), "one"));
    let second = harness.receive(&Envelope::reply(id, "two"));

    assert!(second.is_empty());
    assert_eq!(settle(first, rx).unwrap(), Value::from("one"));
}

#[test]
fn test_publish_invokes_subscribers_until_unsubscribed() {
    let mut harness = Harness::ready(SessionConfig::default());
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    let callback: Callback = {
        let seen = Arc::clone(&seen);
        Arc::new(move |payload: &[Value]| seen.lock().unwrap().push(payload.to_vec()))
    };
    harness.core.subscribe("image", Arc::clone(&callback)).unwrap();

    let event = Envelope::reply(MessageId::publish("image", 7), "frame");
    deliver(harness.receive(&event));
    assert_eq!(*seen.lock().unwrap(), vec![vec![Value::from("frame")]]);

    harness.core.unsubscribe("image", &callback).unwrap();
    assert!(harness.receive(&event).is_empty());
    assert_eq!(seen.lock().unwrap().len(), 1);

    // subscribing never talks to the server
    assert!(harness.drain().is_empty());
}

#[test]
fn test_publish_to_dotted_topic() {
    let mut harness = Harness::ready(SessionConfig::default());
    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let callback: Callback = {
        let count = Arc::clone(&count);
        Arc::new(move |_: &[Value]| {
            count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        })
    };

    harness.core.subscribe("viewport.image.push", Arc::clone(&callback)).unwrap();
    harness.core.subscribe("viewport.image.push", callback).unwrap();

    deliver(harness.receive(&Envelope::reply(MessageId::publish("viewport.image.push", 1), Value::Nil)));
    deliver(harness.receive(&Envelope::reply(MessageId::publish("viewport.image", 2), Value::Nil)));
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[test]
fn test_subscribe_before_ready_fails() {
    let mut harness = Harness::new(SessionConfig::default());
    let err = harness.core.subscribe("image", Arc::new(|_: &[Value]| {})).unwrap_err();
    assert_eq!(err.to_string(), "Subscribe call image unsuccessful: connection not open");
}

#[test]
fn test_unknown_system_message() {
    let mut harness = Harness::ready(SessionConfig::default());
    let (_id, _rx) = harness.core.call("echo", vec![], BTreeMap::new()).unwrap();

    let deliveries = harness.receive(&Envelope::reply("system:c9:1".parse().unwrap(), Value::Nil));
    assert!(deliveries.is_empty());
    assert_eq!(harness.core.pending_count(), 1);
    assert!(harness.state_rx.borrow().is_ready());
}

#[test]
fn test_handshake_error_closes_session() {
    let mut harness = Harness::new(SessionConfig::default());
    harness.core.begin_handshake().unwrap();
    harness.drain();

    let reply = Envelope::error_reply(MessageId::handshake(), RpcError::new(-32001, "bad secret"));
    assert!(harness.receive(&reply).is_empty());

    assert_eq!(*harness.state_rx.borrow(), SessionState::Closed);
    assert_eq!(harness.core.handshake_error().map(|e| e.code), Some(-32001));
    assert!(matches!(
        harness.events.try_recv(),
        Ok(ConnectionEvent::Error(SessionError::Handshake(ref e))) if e.message == "bad secret"
    ));
    assert!(matches!(harness.events.try_recv(), Ok(ConnectionEvent::Closed { locally: true })));
    assert!(matches!(harness.drain().as_slice(), [Outbound::Close]));
}

#[test]
fn test_handshake_without_client_id_fails() {
    let mut harness = Harness::new(SessionConfig::default());
    harness.core.begin_handshake().unwrap();

    harness.receive(&Envelope::reply(MessageId::handshake(), Value::Map(BTreeMap::new())));

    assert_eq!(*harness.state_rx.borrow(), SessionState::Closed);
    assert_eq!(harness.core.handshake_error().map(|e| e.code), Some(CLIENT_ERROR));
}

#[test]
fn test_negotiated_frame_size() {
    let mut harness = Harness::new(SessionConfig::default());
    harness.core.begin_handshake().unwrap();
    harness.drain();
    harness.receive(&Envelope::reply(MessageId::handshake(), handshake_result("c1", Some(64))));
    assert_eq!(harness.core.max_frame_size(), 64);

    harness.core.call("upload", vec![Value::from(vec![7u8; 500])], BTreeMap::new()).unwrap();
    let frames = harness.drain();
    assert!(frames.len() > 1);
    for frame in &frames {
        match frame {
            Outbound::Message(WireMessage::Binary(data)) => assert!(data.len() <= 64),
            other => panic!("unexpected outbound item {:?}", other),
        }
    }
}

#[test]
fn test_large_reply_reassembled_from_chunks() {
    let config = SessionConfig { reassembly: ReassemblyPolicy::Streaming, ..SessionConfig::default() };
    let mut harness = Harness::ready(config);
    harness.server_codec.set_max_frame_size(100);
    let (id, rx) = harness.core.call("image.get", vec![], BTreeMap::new()).unwrap();

    let payload = Value::from(vec![42u8; 5000]);
    let deliveries = harness.receive(&Envelope::reply(id, payload.clone()));
    assert_eq!(settle(deliveries, rx).unwrap(), payload);
}

#[test]
fn test_framing_error_scoped_to_one_message() {
    let mut harness = Harness::ready(SessionConfig::default());
    let (id_a, rx_a) = harness.core.call("a", vec![], BTreeMap::new()).unwrap();
    let (id_b, _rx_b) = harness.core.call("b", vec![], BTreeMap::new()).unwrap();

    let reply_a = Envelope::reply(id_a, Value::from(vec![1u8; 200])).to_msgpack().unwrap();
    let reply_b = Envelope::reply(id_b, Value::from(vec![2u8; 200])).to_msgpack().unwrap();
    let frames_a: Vec<Bytes> = Chunks::with_id(&reply_a, 64, 1).collect();
    let frames_b: Vec<Bytes> = Chunks::with_id(&reply_b, 64, 2).collect();

    let mut deliveries = Vec::new();
    deliveries.extend(harness.core.handle_wire_message(WireMessage::Binary(frames_a[0].clone())));
    deliveries.extend(harness.core.handle_wire_message(WireMessage::Binary(frames_b[0].clone())));

    // second chunk of b claims a different total size
    let mut bogus = frames_b[1].to_vec();
    bogus[8..12].copy_from_slice(&9999u32.to_le_bytes());
    deliveries.extend(harness.core.handle_wire_message(WireMessage::Binary(Bytes::from(bogus))));

    for frame in &frames_a[1..] {
        deliveries.extend(harness.core.handle_wire_message(WireMessage::Binary(frame.clone())));
    }

    assert_eq!(settle(deliveries, rx_a).unwrap(), Value::from(vec![1u8; 200]));
    assert_eq!(harness.core.pending_count(), 1);
    assert!(harness.state_rx.borrow().is_ready());
}

#[test]
fn test_malformed_payload_is_dropped() {
    let mut harness = Harness::ready(SessionConfig::default());
    let garbage: Vec<Bytes> = Chunks::with_id(&[0xc1, 0xc1, 0xc1], 0, 5).collect();

    assert!(harness.core.handle_wire_message(WireMessage::Binary(garbage[0].clone())).is_empty());
    assert!(harness.core.handle_wire_message(WireMessage::Text("{not json".to_string())).is_empty());
    assert!(harness.state_rx.borrow().is_ready());
}

#[test]
fn test_text_envelopes_accepted_in_chunked_mode() {
    let mut harness = Harness::ready(SessionConfig::default());
    let (id, rx) = harness.core.call("echo", vec![], BTreeMap::new()).unwrap();

    let text = Envelope::reply(id, "via text").to_json().unwrap();
    let deliveries = harness.core.handle_wire_message(WireMessage::Text(text));
    assert_eq!(settle(deliveries, rx).unwrap(), Value::from("via text"));
}

#[test]
fn test_legacy_attachments_substituted() {
    let mut harness = Harness::ready(legacy_config());
    let (id, rx) = harness.core.call("image.get", vec![], BTreeMap::new()).unwrap();
    assert_eq!(id.to_string(), "rpc:c3:0");

    // legacy requests travel as JSON text
    assert!(matches!(harness.drain().as_slice(), [Outbound::Message(WireMessage::Text(_))]));

    let header = Envelope::attachment_header(["wslink_bin1", "wslink_bin2"]).to_json().unwrap();
    assert!(harness.core.handle_wire_message(WireMessage::Text(header)).is_empty());
    harness.core.handle_wire_message(WireMessage::Binary(Bytes::from_static(b"b1")));
    harness.core.handle_wire_message(WireMessage::Binary(Bytes::from_static(b"b2")));
    assert_eq!(harness.core.attachments.len(), 2);

    let reply = r#"{"wslink":"1.0","id":"rpc:c3:0","result":{"a":"wslink_bin1","b":["wslink_bin2"]}}"#;
    let deliveries = harness.core.handle_wire_message(WireMessage::Text(reply.to_string()));
    let result = settle(deliveries, rx).unwrap();

    assert_eq!(result.get("a"), Some(&Value::Binary(Bytes::from_static(b"b1"))));
    assert_eq!(
        result.get("b"),
        Some(&Value::Array(vec![Value::Binary(Bytes::from_static(b"b2"))]))
    );
    assert!(harness.core.attachments.is_empty());
}

#[test]
fn test_legacy_binary_without_header_is_dropped() {
    let mut harness = Harness::ready(legacy_config());

    assert!(harness.core.handle_wire_message(WireMessage::Binary(Bytes::from_static(b"x"))).is_empty());
    assert!(harness.core.attachments.is_empty());
}

#[test]
fn test_legacy_call_sends_binary_arguments_as_attachments() {
    let mut harness = Harness::ready(legacy_config());
    let args = vec![Value::from("scene"), Value::from(vec![0xffu8, 0x00, 0x10])];
    harness.core.call("image.upload", args, BTreeMap::new()).unwrap();

    let sent = harness.drain();
    let [Outbound::Message(WireMessage::Text(header)), Outbound::Message(WireMessage::Binary(payload)), Outbound::Message(WireMessage::Text(request))] =
        sent.as_slice()
    else {
        panic!("expected header, attachment and request, got {:?}", sent);
    };

    let header = Envelope::from_json(header).unwrap();
    assert!(header.is_attachment_header());
    assert_eq!(payload.as_ref(), &[0xff, 0x00, 0x10]);

    let request = Envelope::from_json(request).unwrap();
    let token = header.args.unwrap()[0].clone();
    assert_eq!(request.args, Some(vec![Value::from("scene"), token]));
}

#[test]
fn test_error_reply_discards_attachments() {
    let mut harness = Harness::ready(legacy_config());
    let (id, rx) = harness.core.call("image.get", vec![], BTreeMap::new()).unwrap();

    let header = Envelope::attachment_header(["wslink_bin1"]).to_json().unwrap();
    harness.core.handle_wire_message(WireMessage::Text(header));
    harness.core.handle_wire_message(WireMessage::Binary(Bytes::from_static(b"b1")));

    let deliveries = harness.receive(&Envelope::error_reply(id, RpcError::new(-1, "render failed")));
    assert!(harness.core.attachments.is_empty());
    assert!(matches!(settle(deliveries, rx), Err(SessionError::Server(_))));
}

#[test]
fn test_shutdown_rejects_pending_calls() {
    let mut harness = Harness::ready(SessionConfig::default());
    let (_a, rx_a) = harness.core.call("a", vec![], BTreeMap::new()).unwrap();
    let (_b, rx_b) = harness.core.call("b", vec![], BTreeMap::new()).unwrap();
    harness.drain();

    let deliveries = harness.core.shutdown(true);
    assert_eq!(deliveries.len(), 2);
    deliver(deliveries);

    let mut rx_a = rx_a;
    let mut rx_b = rx_b;
    assert!(matches!(rx_a.try_recv(), Ok(Err(SessionError::Closed))));
    assert!(matches!(rx_b.try_recv(), Ok(Err(SessionError::Closed))));
    assert_eq!(*harness.state_rx.borrow(), SessionState::Closed);
    assert!(matches!(harness.drain().as_slice(), [Outbound::Close]));
    assert!(matches!(harness.events.try_recv(), Ok(ConnectionEvent::Closed { locally: true })));

    // a second shutdown is silent
    assert!(harness.core.shutdown(false).is_empty());
    assert!(harness.events.try_recv().is_err());
    assert!(harness.core.call("a", vec![], BTreeMap::new()).is_err());
}

#[test]
fn test_shutdown_releases_reassembly() {
    let mut harness = Harness::ready(SessionConfig::default());
    let (id, _rx) = harness.core.call("big", vec![], BTreeMap::new()).unwrap();

    let reply = Envelope::reply(id, Value::from(vec![0u8; 300])).to_msgpack().unwrap();
    let frames: Vec<Bytes> = Chunks::with_id(&reply, 64, 77).collect();
    harness.core.handle_wire_message(WireMessage::Binary(frames[0].clone()));
    assert_eq!(harness.core.unchunker.pending_count(), 1);

    harness.core.shutdown(false);
    assert_eq!(harness.core.unchunker.pending_count(), 0);
}

proptest! {
    #[test]
    fn prop_replies_in_any_order_settle_their_own_calls(
        order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle(),
        frame_size in 16u32..200,
    ) {
        let mut harness = Harness::ready(SessionConfig::default());
        harness.server_codec.set_max_frame_size(frame_size);

        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..8u64 {
            let (id, rx) = harness.core.call("echo", vec![Value::from(i)], BTreeMap::new()).unwrap();
            ids.push(id);
            receivers.push(rx);
        }

        for &i in &order {
            deliver(harness.receive(&Envelope::reply(ids[i].clone(), Value::from(i as u64))));
        }

        for (i, mut rx) in receivers.into_iter().enumerate() {
            prop_assert_eq!(rx.try_recv().unwrap().unwrap(), Value::from(i as u64));
        }
        prop_assert_eq!(harness.core.pending_count(), 0);
    }
}
