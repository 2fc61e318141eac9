//! Client core for bidirectional RPC over a framed message transport.
//!
//! A [`HubConnection`] is a long-lived session over one ordered, reliable,
//! full-duplex byte transport. On top of it a client can invoke named server
//! methods and await a single result, consume server streams lazily, push
//! fire-and-forget notifications, and register handlers the server may
//! invoke at any time.
//!
//! The crate owns the connection core only. How bytes move is the
//! [`transport`]'s business; how messages look on the wire is the
//! [`protocol`]'s. Both are traits, and both come with ready
//! implementations: an in-memory transport for tests and in-process wiring,
//! plus JSON and compressed-CBOR codecs.
//!
//! ```ignore
//! use hubwire::{HubConnectionBuilder, JsonHubProtocol, TypeHint};
//! use serde_json::json;
//!
//! let connection = HubConnectionBuilder::new(factory, JsonHubProtocol::new())
//!     .server_timeout(std::time::Duration::from_secs(30))
//!     .build();
//! connection.start().await?;
//!
//! let sum = connection
//!     .invoke("Add", TypeHint::Int, vec![json!(2), json!(3)])
//!     .await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{
    HandlerFn, HandlerFuture, HandlerState, HubConnection,
    HubConnectionBuilder, HubStream, InvocationIdSource, SequentialIds,
    Subscription,
};
pub use config::{HubConfig, LogConfig};
pub use error::{HubError, HubResult};
pub use protocol::cbor::CborHubProtocol;
pub use protocol::json::JsonHubProtocol;
pub use protocol::{
    Binder, HubMessage, HubProtocol, MessageKind, TransferFormat, TypeHint,
};
pub use transport::{Transport, TransportEvent, TransportFactory};
