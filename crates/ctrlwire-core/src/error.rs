// ── Core error types ──
//
// AuthError and RequestError are Clone because coalesced operations hand
// the same outcome to every waiter. CoreError is the facade error returned
// by `Client` and wraps both.

use thiserror::Error;

use ctrlwire_api::ErrorCode;

/// Credential lifecycle failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authority is not loaded")]
    AuthorityNotLoaded,

    #[error("Credential manager is not configured: call setup() first")]
    NotConfigured,

    /// The user has been sent to the login page; the flow resumes through
    /// `handle_callback`.
    #[error("Interactive login required at {login_url}")]
    LoginRequired { login_url: String },

    #[error("Callback state does not match the stored nonce")]
    NonceMismatch,

    #[error("Callback carries neither an access token nor a code")]
    InvalidCallback,

    #[error("Token exchange failed: {message}")]
    TokenExchange {
        message: String,
        status: Option<u16>,
    },

    #[error("Silent authorization timed out")]
    SilentAuthTimeout,

    #[error("Auth API error: {message}")]
    Api {
        message: String,
        status: Option<u16>,
    },

    #[error("Authorization was cancelled")]
    Cancelled,
}

impl From<ctrlwire_api::Error> for AuthError {
    fn from(err: ctrlwire_api::Error) -> Self {
        Self::Api {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

/// Failures of a single control-channel request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The server answered with an `error` frame.
    #[error("{code}: {message}")]
    Protocol { code: ErrorCode, message: String },

    #[error("Gave up connecting after {attempts} attempts")]
    ConnectionExhausted { attempts: u32 },

    #[error("Client is shutting down")]
    Shutdown,

    #[error("Failed to encode command: {0}")]
    Encode(String),

    /// The pending entry vanished without an answer.
    #[error("Request was dropped before a response arrived")]
    Dropped,
}

impl RequestError {
    /// The protocol error code, if the server rejected the request.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("API error: {0}")]
    Api(#[from] ctrlwire_api::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Credential storage error: {message}")]
    Storage { message: String },

    #[error("Client is not set up: call setup() first")]
    NotConfigured,
}
