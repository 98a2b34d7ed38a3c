use thiserror::Error;

/// Top-level error type for the `ctrlwire-api` crate.
///
/// Covers every failure mode across the wire surfaces: HTTP transport,
/// auth endpoints, REST resources and the control socket.
/// `ctrlwire-core` maps these into its own error kinds.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── HTTP endpoints ──────────────────────────────────────────────
    /// Non-success status from an auth or REST endpoint.
    #[error("HTTP {status} from {url}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },

    // ── Control socket ──────────────────────────────────────────────
    /// Socket handshake or read failure. `status` carries the HTTP status
    /// when the upgrade request itself was rejected.
    #[error("WebSocket connection failed: {message}")]
    WebSocketConnect {
        message: String,
        status: Option<u16>,
    },

    /// Socket closed by the peer.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// Write attempted on a transport that has already been closed.
    #[error("Transport is closed")]
    TransportClosed,

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::Http { status, .. } => Some(*status),
            Self::WebSocketConnect { status, .. } => *status,
            _ => None,
        }
    }

    /// Returns `true` when the server rejected our credentials.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::WebSocketConnect { status, .. } => status.is_none_or(|s| s >= 500),
            Self::WebSocketClosed { .. } | Self::TransportClosed => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
