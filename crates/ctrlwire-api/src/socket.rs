//! Bidirectional message-channel abstraction for the control socket.
//!
//! A [`Connector`] opens a [`Connection`]: a write half implementing
//! [`Transport`] plus an unbounded receiver of [`TransportEvent`]s. The live
//! WebSocket connector and the simulated backend's connector both honour
//! this contract, so the connection supervisor never knows which one it has.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use url::Url;

use crate::error::Error;

/// Something that happened on an open transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A text frame that is not a keep-alive reply.
    Message(String),
    /// The server answered a keep-alive `ping`.
    Pong,
    /// Read or write failure. The transport is unusable afterwards.
    Error(Error),
    /// Peer closed the channel.
    Closed { code: Option<u16>, reason: String },
}

/// Write half of an open channel.
pub trait Transport: Send + Sync {
    /// Queue a text frame for delivery.
    fn send(&self, frame: String) -> Result<(), Error>;

    /// Close the channel. Idempotent; no events are guaranteed afterwards.
    fn close(&self);
}

/// An open channel: write half plus the event stream.
pub struct Connection {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Parameters for opening a channel.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Fully-built `ws://` or `wss://` URL including query parameters.
    pub url: Url,
    /// Value for a `Cookie` header on the upgrade request, if any.
    pub cookie: Option<String>,
}

/// Opens channels. Implementations must not block the caller.
pub trait Connector: Send + Sync {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Connection, Error>>;
}
