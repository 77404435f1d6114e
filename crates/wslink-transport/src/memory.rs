//! In-memory transport pair

use async_trait::async_trait;
use crate::{ReadyState, Transport, TransportError, WireMessage};
use tokio::sync::mpsc;
use tracing::trace;

/// One end of an in-memory duplex connection
///
/// Messages sent on one end are received, in order, on the other. Closing
/// or dropping one end makes the peer's `recv` return `None`.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<WireMessage>>,
    rx: mpsc::UnboundedReceiver<WireMessage>,
    state: ReadyState,
}

impl MemoryTransport {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = Self { tx: Some(a_tx), rx: b_rx, state: ReadyState::Open };
        let b = Self { tx: Some(b_tx), rx: a_rx, state: ReadyState::Open };
        (a, b)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        trace!("memory transport send: {} bytes", message.len());

        tx.send(message).map_err(|_| {
            self.state = ReadyState::Closed;
            TransportError::Closed
        })
    }

    async fn recv(&mut self) -> Option<Result<WireMessage, TransportError>> {
        match self.rx.recv().await {
            Some(message) => Some(Ok(message)),
            None => {
                self.state = ReadyState::Closed;
                None
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        self.rx.close();
        self.state = ReadyState::Closed;
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }
}
