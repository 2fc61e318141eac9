//! The byte transport consumed by the connection.
//!
//! The connection core never touches sockets. It talks to a [`Transport`]
//! trait object that moves opaque, whole frames in both directions: outbound
//! via [`Transport::send`], inbound as [`TransportEvent`]s pushed into the
//! channel handed to the factory at connect time.
//!
//! Handing the event sender to [`TransportFactory::connect`] means the
//! transport has its delivery path wired up before it starts, so nothing
//! received during startup can be dropped.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{HubError, HubResult};
use crate::protocol::TransferFormat;

pub mod memory;

/// Inbound notifications from a running transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// One delivery batch. Contains a whole number of protocol frames.
    Data(Bytes),
    /// The transport is gone. `None` means a clean close.
    Closed(Option<HubError>),
}

/// A started, full-duplex, ordered byte transport.
///
/// Implementations must deliver [`TransportEvent::Closed`] exactly once, for
/// every way the transport can end, including [`Transport::abort`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queues one whole frame. Resolves when the transport has accepted the
    /// bytes, not when the peer has seen them.
    async fn send(&self, data: Bytes) -> HubResult<()>;

    /// Tears the transport down with an error. The error is reported through
    /// the event channel as [`TransportEvent::Closed`].
    fn abort(&self, error: HubError);

    /// Graceful close. Reports a clean [`TransportEvent::Closed`].
    async fn close(&self);

    /// Whether the transport layer itself generates periodic traffic. When
    /// true the connection does not run its own idle watchdog.
    fn has_inherent_keep_alive(&self) -> bool {
        false
    }
}

/// Creates and starts transports for the connection.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Builds a transport, wires `events` as its delivery channel, and
    /// starts it in `format` mode.
    async fn connect(
        &self,
        format: TransferFormat,
        events: mpsc::Sender<TransportEvent>,
    ) -> HubResult<Box<dyn Transport>>;
}
