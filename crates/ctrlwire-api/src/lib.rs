// ctrlwire-api: wire-level pieces for the control platform (HTTP auth, REST, control socket)

pub mod auth;
pub mod error;
pub mod protocol;
pub mod rest;
pub mod socket;
pub mod transport;
pub mod websocket;

pub use auth::{AuthClient, Authority, AuthorizeRequest, TokenGrant, TokenResponse};
pub use error::Error;
pub use protocol::{Command, CommandKind, ErrorCode, Inbound};
pub use rest::{Page, ResourceClient, TokenSource, UpdateMethod};
pub use socket::{ConnectRequest, Connection, Connector, Transport, TransportEvent};
pub use transport::{TlsMode, TransportConfig};
pub use websocket::WebSocketConnector;
