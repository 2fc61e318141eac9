//! Channel-backed in-process transport.
//!
//! Each [`MemoryTransportFactory::connect`] call produces a transport for
//! the connection and a matching [`MemoryServer`] for the far side. The
//! server handle can observe every frame the client writes, inject inbound
//! frames, and end the session with or without an error. Tests drive the
//! whole connection through it; it also works for wiring two in-process
//! peers together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Transport, TransportEvent, TransportFactory};
use crate::error::{HubError, HubResult};
use crate::protocol::TransferFormat;

/// State shared by the client half and the server handle. The closed flag
/// makes sure only one side delivers the closed event.
struct Shared {
    events: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
}

impl Shared {
    /// First close wins; later calls are no-ops.
    fn deliver_closed(&self, error: Option<HubError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Buffered channel; a full buffer at teardown only loses the event
        // for a receiver that is already gone.
        let _ = self.events.try_send(TransportEvent::Closed(error));
    }
}

pub struct MemoryTransport {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Bytes>,
    inherent_keep_alive: bool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, data: Bytes) -> HubResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(HubError::Transport("transport is closed".into()));
        }
        self.outbound
            .send(data)
            .map_err(|_| HubError::Transport("peer hung up".into()))
    }

    fn abort(&self, error: HubError) {
        self.shared.deliver_closed(Some(error));
    }

    async fn close(&self) {
        self.shared.deliver_closed(None);
    }

    fn has_inherent_keep_alive(&self) -> bool {
        self.inherent_keep_alive
    }
}

/// The far end of an in-memory transport.
pub struct MemoryServer {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    format: TransferFormat,
}

impl MemoryServer {
    /// Next frame written by the client, or `None` once the client half is
    /// gone.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    /// Frame already buffered, if any. Does not wait.
    pub fn try_next_frame(&mut self) -> Option<Bytes> {
        self.outbound.try_recv().ok()
    }

    /// Delivers one inbound batch to the client.
    pub async fn inject(&self, data: impl Into<Bytes>) -> HubResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(HubError::Transport("transport is closed".into()));
        }
        self.shared
            .events
            .send(TransportEvent::Data(data.into()))
            .await
            .map_err(|_| HubError::Transport("client hung up".into()))
    }

    /// Ends the session from the server side.
    pub fn close(&self, error: Option<HubError>) {
        self.shared.deliver_closed(error);
    }

    /// Transfer format the client connected with.
    pub fn transfer_format(&self) -> TransferFormat {
        self.format
    }
}

/// Factory producing paired in-memory transports. Every connect pushes the
/// server half into the receiver returned by [`MemoryTransportFactory::new`].
pub struct MemoryTransportFactory {
    servers: mpsc::UnboundedSender<MemoryServer>,
    inherent_keep_alive: bool,
}

impl MemoryTransportFactory {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryServer>) {
        let (servers, accept) = mpsc::unbounded_channel();
        (
            Self {
                servers,
                inherent_keep_alive: false,
            },
            accept,
        )
    }

    /// Marks produced transports as self-keep-aliving, which disables the
    /// connection's idle watchdog.
    #[must_use]
    pub fn with_inherent_keep_alive(mut self, value: bool) -> Self {
        self.inherent_keep_alive = value;
        self
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn connect(
        &self,
        format: TransferFormat,
        events: mpsc::Sender<TransportEvent>,
    ) -> HubResult<Box<dyn Transport>> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events,
            closed: AtomicBool::new(false),
        });
        let server = MemoryServer {
            shared: Arc::clone(&shared),
            outbound: outbound_rx,
            format,
        };
        self.servers
            .send(server)
            .map_err(|_| HubError::Transport("nobody is accepting".into()))?;
        Ok(Box::new(MemoryTransport {
            shared,
            outbound: outbound_tx,
            inherent_keep_alive: self.inherent_keep_alive,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (factory, mut accept) = MemoryTransportFactory::new();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let transport = factory
            .connect(TransferFormat::Text, events_tx)
            .await
            .unwrap();
        let mut server = accept.recv().await.unwrap();

        transport.send(Bytes::from_static(b"out")).await.unwrap();
        assert_eq!(server.next_frame().await.unwrap().as_ref(), b"out");

        server.inject(Bytes::from_static(b"in")).await.unwrap();
        let TransportEvent::Data(data) = events_rx.recv().await.unwrap() else {
            panic!("expected data");
        };
        assert_eq!(data.as_ref(), b"in");
    }

    #[tokio::test]
    async fn closed_is_delivered_once() {
        let (factory, mut accept) = MemoryTransportFactory::new();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let transport = factory
            .connect(TransferFormat::Binary, events_tx)
            .await
            .unwrap();
        let server = accept.recv().await.unwrap();

        transport.abort(HubError::NotConnected);
        server.close(None);
        transport.close().await;

        let TransportEvent::Closed(Some(err)) = events_rx.recv().await.unwrap()
        else {
            panic!("expected errored close");
        };
        assert_eq!(err, HubError::NotConnected);
        assert!(events_rx.try_recv().is_err());

        assert!(
            transport.send(Bytes::from_static(b"late")).await.is_err()
        );
    }
}
