//! CLI error types with miette diagnostics.
//!
//! Maps core and config errors into user-facing errors with actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use ctrlwire_config::ConfigError;
use ctrlwire_core::{AuthError, CoreError, ErrorCode, RequestError};

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const PERMISSION: i32 = 5;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach the control channel: {reason}")]
    #[diagnostic(
        code(ctrlwire::connection_failed),
        help(
            "Check that the platform is reachable and the profile host is right.\n\
             Try: ctrlwire authority"
        )
    )]
    ConnectionFailed { reason: String },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(ctrlwire::auth_failed),
        help("Verify your credentials, then run: ctrlwire login")
    )]
    AuthFailed { message: String },

    #[error("Interactive login required")]
    #[diagnostic(
        code(ctrlwire::login_required),
        help(
            "Open {login_url} in a browser, sign in, then run:\n\
             ctrlwire login --callback '<redirect URL>'"
        )
    )]
    LoginRequired { login_url: String },

    #[error("Not logged in to profile '{profile}'")]
    #[diagnostic(code(ctrlwire::not_logged_in), help("Run: ctrlwire login --profile {profile}"))]
    NotLoggedIn { profile: String },

    #[error("No credentials configured for profile '{profile}'")]
    #[diagnostic(
        code(ctrlwire::no_credentials),
        help(
            "Store a password with: ctrlwire config set-password\n\
             Or set CTRLWIRE_USERNAME and CTRLWIRE_PASSWORD."
        )
    )]
    NoCredentials { profile: String },

    // ── Control channel ──────────────────────────────────────────────
    #[error("{kind} not found: {message}")]
    #[diagnostic(code(ctrlwire::not_found))]
    NotFound { kind: String, message: String },

    #[error("Access denied: {message}")]
    #[diagnostic(code(ctrlwire::access_denied))]
    AccessDenied { message: String },

    #[error("Request failed ({code}): {message}")]
    #[diagnostic(code(ctrlwire::request_failed))]
    Request { code: String, message: String },

    // ── API ──────────────────────────────────────────────────────────
    #[error("API error: {message}")]
    #[diagnostic(code(ctrlwire::api_error))]
    Api { status: Option<u16>, message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(ctrlwire::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(ctrlwire::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: ctrlwire config init"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("Configuration file not found")]
    #[diagnostic(
        code(ctrlwire::no_config),
        help(
            "Create one with: ctrlwire config init\n\
             Expected at: {path}\n\
             Or pass --host, or --mock for the simulated backend."
        )
    )]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(ctrlwire::config))]
    Config(ConfigError),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Timed out after {seconds}s")]
    #[diagnostic(
        code(ctrlwire::timeout),
        help("Increase timeout with --timeout or check platform responsiveness.")
    )]
    Timeout { seconds: u64 },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(ctrlwire::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. }
            | Self::LoginRequired { .. }
            | Self::NotLoggedIn { .. }
            | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::AccessDenied { .. } => exit_code::PERMISSION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::ProfileNotFound { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

/// Map a dialoguer / interactive I/O failure into CliError.
pub fn prompt_err(e: impl std::fmt::Display) -> CliError {
    CliError::Validation {
        field: "interactive".into(),
        reason: format!("prompt failed: {e}"),
    }
}

// ── Conversions ──────────────────────────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials { profile } => Self::NoCredentials { profile },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}

impl From<AuthError> for CliError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::LoginRequired { login_url } => Self::LoginRequired { login_url },
            AuthError::Api { message, status } => Self::Api { status, message },
            other => Self::AuthFailed {
                message: other.to_string(),
            },
        }
    }
}

impl From<RequestError> for CliError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Protocol { code, message } => match code {
                ErrorCode::SystemNotFound => Self::NotFound {
                    kind: "system".into(),
                    message,
                },
                ErrorCode::ModuleNotFound => Self::NotFound {
                    kind: "module".into(),
                    message,
                },
                ErrorCode::AccessDenied => Self::AccessDenied { message },
                other => Self::Request {
                    code: other.to_string(),
                    message,
                },
            },
            other @ (RequestError::ConnectionExhausted { .. } | RequestError::Dropped) => Self::ConnectionFailed {
                reason: other.to_string(),
            },
            other => Self::Request {
                code: "client".into(),
                message: other.to_string(),
            },
        }
    }
}

impl From<ctrlwire_api::Error> for CliError {
    fn from(err: ctrlwire_api::Error) -> Self {
        match err.status() {
            Some(401) => Self::AuthFailed {
                message: err.to_string(),
            },
            Some(404) => Self::NotFound {
                kind: "resource".into(),
                message: err.to_string(),
            },
            status => Self::Api {
                status,
                message: err.to_string(),
            },
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Auth(e) => e.into(),
            CoreError::Request(e) => e.into(),
            CoreError::Api(e) => e.into(),
            CoreError::Config { message } | CoreError::Storage { message } => Self::Validation {
                field: "config".into(),
                reason: message,
            },
            CoreError::NotConfigured => Self::AuthFailed {
                message: "client is not set up".into(),
            },
        }
    }
}
