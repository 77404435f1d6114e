//! Session driver task
//!
//! Owns the transport. Drains the outbound queue into it and funnels every
//! inbound message through a [`SequentialTaskQueue`], so protocol effects
//! are applied in delivery order while decoding runs on the blocking pool.

use crate::protocol::{deliver, lock, Outbound, SessionCore};
use crate::SequentialTaskQueue;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use wslink_transport::{Transport, TransportError, WireMessage};

pub(crate) struct Driver<T> {
    transport: T,
    core: Arc<Mutex<SessionCore>>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    inbound: SequentialTaskQueue,
}

impl<T: Transport> Driver<T> {
    pub(crate) fn new(
        transport: T,
        core: Arc<Mutex<SessionCore>>,
        outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> Self {
        Self { transport, core, outbound_rx, inbound: SequentialTaskQueue::new() }
    }

    /// Run until the session closes or the transport goes away
    pub(crate) async fn run(mut self) {
        info!("Starting session driver ({})", self.transport.ready_state());

        let started = lock(&self.core).begin_handshake();
        if let Err(e) = started {
            error!("Failed to send handshake: {}", e);
        }

        loop {
            tokio::select! {
                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(Outbound::Message(message)) => {
                            if let Err(e) = self.transport.send(message).await {
                                error!("Failed to send message: {}", e);
                                if e.is_closed() || !self.transport.ready_state().is_open() {
                                    self.finish(Some(e)).await;
                                    break;
                                }
                            }
                        }
                        Some(Outbound::Close) | None => {
                            debug!("Closing transport");
                            if let Err(e) = self.transport.close().await {
                                warn!("Failed to close transport: {}", e);
                            }
                            break;
                        }
                    }
                }

                inbound = self.transport.recv() => {
                    match inbound {
                        Some(Ok(message)) => self.dispatch(message),
                        Some(Err(e)) => {
                            error!("Failed to receive message: {}", e);
                            self.finish(Some(e)).await;
                            break;
                        }
                        None => {
                            debug!("Transport closed by peer");
                            self.finish(None).await;
                            break;
                        }
                    }
                }
            }
        }

        info!("Session driver stopped");
    }

    fn dispatch(&self, message: WireMessage) {
        let core = Arc::clone(&self.core);

        // detached: the queue alone orders inbound effects
        drop(self.inbound.enqueue(async move {
            let handled = tokio::task::spawn_blocking(move || {
                let deliveries = lock(&core).handle_wire_message(message);
                deliver(deliveries);
            })
            .await;

            if let Err(e) = handled {
                error!("Inbound message task failed: {}", e);
            }
        }));
    }

    /// Shut the core down once every message received so far was handled
    async fn finish(&mut self, error: Option<TransportError>) {
        let core = Arc::clone(&self.core);

        let shutdown = self.inbound.enqueue(async move {
            let deliveries = {
                let mut core = lock(&core);
                if let Some(e) = error {
                    core.report_transport_error(e);
                }
                core.shutdown(false)
            };
            deliver(deliveries);
        });

        if let Err(e) = shutdown.await {
            error!("Session shutdown task failed: {}", e);
        }
    }
}
