//! Session handle, configuration and lifecycle

use crate::driver::Driver;
use crate::protocol::{deliver, lock, SessionCore};
use crate::subscription::Callback;
use crate::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wslink_proto::codec::DEFAULT_MAX_FRAME_SIZE;
use wslink_proto::unchunk::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_PENDING_MESSAGES};
use wslink_proto::{MessageId, ReassemblyPolicy, Value, WireFormat};
use wslink_transport::{Transport, WsTransport};

/// Default shared secret sent in the handshake
pub const DEFAULT_SECRET: &str = "wslink-secret";

/// Environment variable overriding the maximum frame size
pub const ENV_MAX_MSG_SIZE: &str = "WSLINK_MAX_MSG_SIZE";

/// Environment variable overriding the shared secret
pub const ENV_SECRET: &str = "WSLINK_SECRET";

/// Method asking a launcher-spawned server to exit after a delay
pub const EXIT_LATER_METHOD: &str = "application.exit.later";

/// Conventional delay, in seconds, for [`Session::destroy`]
pub const DEFAULT_EXIT_TIMEOUT: u64 = 10;

/// Session configuration
///
/// Deserializable from any serde format; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shared secret sent in the handshake
    pub secret: String,
    /// Maximum outbound frame size, header included; zero disables splitting
    pub max_frame_size: u32,
    /// How envelopes are carried by the transport
    pub wire_format: WireFormat,
    /// How inbound chunks are reassembled
    pub reassembly: ReassemblyPolicy,
    /// Largest inbound message accepted for reassembly
    pub max_message_size: usize,
    /// Most inbound messages reassembled concurrently
    pub max_pending_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: DEFAULT_SECRET.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            wire_format: WireFormat::default(),
            reassembly: ReassemblyPolicy::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
        }
    }
}

impl SessionConfig {
    /// Defaults overlaid with `WSLINK_MAX_MSG_SIZE` and `WSLINK_SECRET`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secret) = lookup(ENV_SECRET) {
            config.secret = secret;
        }

        if let Some(raw) = lookup(ENV_MAX_MSG_SIZE) {
            match raw.trim().parse() {
                Ok(size) => config.max_frame_size = size,
                Err(_) => debug!("Ignoring invalid {}: {:?}", ENV_MAX_MSG_SIZE, raw),
            }
        }

        config
    }
}

/// Protocol state of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Transport not yet usable
    Disconnected,
    /// Hello sent, waiting for the reply
    Handshaking,
    /// Handshake completed
    Ready {
        /// Client id assigned by the server
        client_id: String,
    },
    /// Session is over
    Closed,
}

impl SessionState {
    /// Whether calls can be issued
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Connection lifecycle notification
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Handshake completed
    Ready {
        /// Client id assigned by the server
        client_id: String,
    },
    /// Transport or handshake failure
    Error(SessionError),
    /// Session closed
    Closed {
        /// Whether the close was requested on this side
        locally: bool,
    },
}

/// Receiver of a session's lifecycle notifications
pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Session builder for configuring connections
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    /// WebSocket url
    url: String,
    /// Session configuration
    config: SessionConfig,
}

impl SessionBuilder {
    /// Create a builder for a `ws://` or `wss://` url
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), config: SessionConfig::default() }
    }

    /// Target url
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the handshake secret
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.secret = secret.into();
        self
    }

    /// Set the maximum outbound frame size
    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.config.max_frame_size = max_frame_size;
        self
    }

    /// Set the wire format
    pub fn with_wire_format(mut self, wire_format: WireFormat) -> Self {
        self.config.wire_format = wire_format;
        self
    }

    /// Set the reassembly policy
    pub fn with_reassembly(mut self, reassembly: ReassemblyPolicy) -> Self {
        self.config.reassembly = reassembly;
        self
    }

    /// Set the largest inbound message accepted
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.config.max_message_size = max_message_size;
        self
    }

    /// Set the number of inbound messages reassembled concurrently
    pub fn with_max_pending_messages(mut self, max_pending_messages: usize) -> Self {
        self.config.max_pending_messages = max_pending_messages;
        self
    }

    /// Build the session configuration
    pub fn build_config(self) -> SessionConfig {
        self.config
    }

    /// Open the WebSocket, start a session and wait for the handshake
    pub async fn connect(self) -> Result<(Session, ConnectionEvents)> {
        info!("Connecting to {}", self.url);

        let transport = WsTransport::connect(&self.url).await?;
        let (session, events) = Session::start(transport, self.config);
        let client_id = session.ready().await?;

        info!("Session {} established as client {}", session.id(), client_id);
        Ok((session, events))
    }
}

/// Handle to a running session
///
/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct Session {
    id: Uuid,
    core: Arc<Mutex<SessionCore>>,
    state_rx: watch::Receiver<SessionState>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).field("state", &*self.state_rx.borrow()).finish()
    }
}

impl Session {
    /// Start a session over an open transport
    ///
    /// Spawns the driver task on the current tokio runtime, which sends the
    /// handshake right away. Use [`Session::ready`] to wait for it.
    pub fn start<T>(transport: T, config: SessionConfig) -> (Self, ConnectionEvents)
    where
        T: Transport + 'static,
    {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let core = Arc::new(Mutex::new(SessionCore::new(config, state_tx, events_tx, outbound_tx)));
        let driver = Driver::new(transport, Arc::clone(&core), outbound_rx);
        let handle = tokio::spawn(driver.run());

        let session = Self { id: Uuid::new_v4(), core, state_rx, driver: Arc::new(Mutex::new(Some(handle))) };
        debug!("Session {} started", session.id);
        (session, events_rx)
    }

    /// Unique session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current protocol state
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Client id assigned at handshake
    pub fn client_id(&self) -> Option<String> {
        match &*self.state_rx.borrow() {
            SessionState::Ready { client_id } => Some(client_id.clone()),
            _ => None,
        }
    }

    /// Current maximum outbound frame size
    pub fn max_frame_size(&self) -> u32 {
        lock(&self.core).max_frame_size()
    }

    /// Number of calls waiting for a reply
    pub fn pending_calls(&self) -> usize {
        lock(&self.core).pending_count()
    }

    /// Wait for the handshake to complete
    ///
    /// Returns the assigned client id, or the handshake error if the server
    /// refused it.
    pub async fn ready(&self) -> Result<String> {
        let mut state_rx = self.state_rx.clone();
        let state = state_rx
            .wait_for(|state| matches!(state, SessionState::Ready { .. } | SessionState::Closed))
            .await
            .map_err(|_| SessionError::Closed)?
            .clone();

        match state {
            SessionState::Ready { client_id } => Ok(client_id),
            _ => match lock(&self.core).handshake_error() {
                Some(err) => Err(SessionError::Handshake(err.clone())),
                None => Err(SessionError::Closed),
            },
        }
    }

    /// Call a remote method
    ///
    /// Fails immediately, without sending anything, unless the session is
    /// ready. The returned future resolves with the reply's result.
    pub fn call(
        &self,
        method: impl AsRef<str>,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<PendingCall> {
        let (id, rx) = lock(&self.core).call(method.as_ref(), args, kwargs)?;
        Ok(PendingCall { id, rx })
    }

    /// Register a callback for events published on `topic`
    ///
    /// Nothing is sent to the server. The callback receives the event's
    /// result wrapped in a one-element slice.
    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> Result<Subscription>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let callback: Callback = Arc::new(callback);

        lock(&self.core).subscribe(&topic, Arc::clone(&callback))?;
        Ok(Subscription { topic, callback, core: Arc::downgrade(&self.core) })
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        lock(&self.core).unsubscribe(&subscription.topic, &subscription.callback)
    }

    /// Close the session
    ///
    /// Outstanding calls are rejected with [`SessionError::Closed`]. Returns
    /// once the transport is closed.
    pub async fn close(&self) -> Result<()> {
        info!("Closing session {}", self.id);

        let deliveries = lock(&self.core).shutdown(true);
        deliver(deliveries);

        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = driver {
            handle.await?;
        }
        Ok(())
    }

    /// Ask the server to exit after `timeout` seconds, then close
    ///
    /// The exit request is only sent while the session is ready and
    /// `timeout` is non-zero. Its reply is not awaited.
    pub async fn destroy(&self, timeout: u64) -> Result<()> {
        if timeout > 0 && self.state().is_ready() {
            match self.call(EXIT_LATER_METHOD, vec![Value::from(timeout)], BTreeMap::new()) {
                Ok(pending) => debug!("Server asked to exit in {}s ({})", timeout, pending.id()),
                Err(e) => warn!("Could not ask the server to exit: {}", e),
            }
        }
        self.close().await
    }
}

/// Reply to an issued call
#[derive(Debug)]
pub struct PendingCall {
    id: MessageId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    /// Request id
    pub fn id(&self) -> &MessageId {
        &self.id
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(SessionError::Closed)))
    }
}

/// Registered topic callback
pub struct Subscription {
    topic: String,
    callback: Callback,
    core: Weak<Mutex<SessionCore>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("topic", &self.topic).finish_non_exhaustive()
    }
}

impl Subscription {
    /// Subscribed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove this subscription from its session
    pub fn unsubscribe(&self) -> Result<()> {
        let core = self.core.upgrade().ok_or(SessionError::Closed)?;
        let result = lock(&core).unsubscribe(&self.topic, &self.callback);
        result
    }
}
