use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the hub connection.
///
/// The enum is `Clone` because a single terminating error fans out to every
/// pending invocation at shutdown, in addition to the `closed` callbacks.
/// Foreign error sources are therefore carried as rendered strings rather
/// than boxed causes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("the hub connection has not been started")]
    NotStarted,
    #[error("the hub connection is already started")]
    AlreadyStarted,
    #[error("the hub connection is not connected")]
    NotConnected,
    #[error("the hub connection has been disposed")]
    Disposed,
    #[error("the connection was terminated while the operation was in flight")]
    ConnectionTerminated,
    #[error("an invocation with id {0} is already in flight")]
    DuplicateInvocationId(String),
    #[error("no message was received from the server within {0:?}")]
    ServerTimeout(Duration),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("the invocation was canceled")]
    Canceled,
    /// Error text from a server completion frame.
    #[error("the server returned an error: {0}")]
    Server(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;
