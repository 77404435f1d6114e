//! WebSocket transport

use async_trait::async_trait;
use crate::{ReadyState, Transport, TransportError, WireMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// WebSocket client transport
pub struct WsTransport<S = MaybeTlsStream<TcpStream>> {
    /// Underlying WebSocket stream
    stream: WebSocketStream<S>,
    /// Connection state
    state: ReadyState,
}

impl WsTransport {
    /// Open a WebSocket connection to `url`
    ///
    /// Only `ws://` and `wss://` urls are accepted.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        check_scheme(url)?;

        info!("Connecting to {}", url);
        let (stream, response) = connect_async(url).await?;
        debug!("WebSocket handshake completed with status {}", response.status());

        Ok(Self::new(stream))
    }
}

impl<S> WsTransport<S> {
    /// Wrap an established WebSocket stream
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream, state: ReadyState::Open }
    }

    /// Consume the transport and return the underlying stream
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.stream
    }
}

fn check_scheme(url: &str) -> Result<(), TransportError> {
    match url.split_once("://") {
        Some((scheme, _)) if scheme.eq_ignore_ascii_case("ws") || scheme.eq_ignore_ascii_case("wss") => Ok(()),
        _ => Err(TransportError::Configuration(format!("Unknown protocol: {}", url))),
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        if !self.state.is_open() {
            return Err(TransportError::Closed);
        }

        let message = match message {
            WireMessage::Text(text) => Message::Text(text.into()),
            WireMessage::Binary(data) => Message::Binary(data),
        };

        self.stream.send(message).await.map_err(|e| {
            let err = TransportError::from(e);
            if err.is_closed() {
                self.state = ReadyState::Closed;
            }
            err
        })
    }

    async fn recv(&mut self) -> Option<Result<WireMessage, TransportError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Some(Ok(WireMessage::Binary(data))),
                Some(Ok(Message::Text(text))) => return Some(Ok(WireMessage::Text(text.as_str().to_owned()))),
                Some(Ok(Message::Close(frame))) => {
                    debug!("Peer closed the connection: {:?}", frame);
                    self.state = ReadyState::Closed;
                    return None;
                }
                // pongs are queued by tungstenite itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    let err = TransportError::from(e);
                    if err.is_closed() {
                        self.state = ReadyState::Closed;
                        return None;
                    }
                    warn!("WebSocket receive failed: {}", err);
                    return Some(Err(err));
                }
                None => {
                    self.state = ReadyState::Closed;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.state == ReadyState::Closed {
            return Ok(());
        }

        self.state = ReadyState::Closing;
        let result = self.stream.close(None).await.map_err(TransportError::from);
        self.state = ReadyState::Closed;

        match result {
            Err(e) if !e.is_closed() => Err(e),
            _ => Ok(()),
        }
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }
}
