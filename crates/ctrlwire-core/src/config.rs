// ── Runtime client configuration ──
//
// These types describe how to authenticate and how to supervise the control
// channel. They carry credential data and timing constants but never touch
// config files: the CLI builds them and hands them in.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use ctrlwire_api::rest::DEFAULT_API_ROUTE;
use ctrlwire_api::{TlsMode, TransportConfig};

// ── Auth ────────────────────────────────────────────────────────────

/// Where credentials are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StorageMode {
    /// In memory; lost when the process exits.
    #[default]
    Session,
    /// JSON file in the platform data directory.
    Persistent,
}

/// Which OAuth flow obtains tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum GrantType {
    /// Resource-owner password grant.
    Password,
    /// Authorization code with PKCE.
    #[default]
    AuthCode,
    /// Implicit grant: the access token arrives on the redirect.
    Implicit,
}

impl GrantType {
    /// `response_type` sent to the authorize endpoint.
    pub fn response_type(self) -> &'static str {
        match self {
            Self::Implicit => "token",
            Self::Password | Self::AuthCode => "code",
        }
    }
}

/// Username/password for the password grant.
#[derive(Debug, Clone)]
pub struct PasswordCredentials {
    pub username: String,
    pub password: SecretString,
    pub client_secret: Option<SecretString>,
}

/// Options for [`CredentialManager::setup`](crate::auth::CredentialManager::setup).
#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Platform root, e.g. `https://bms.example.com`.
    pub host: Url,
    /// Registered redirect URI. Its hash is the client identifier.
    pub redirect_uri: String,
    pub scope: String,
    pub storage: StorageMode,
    /// Override for the persistent credential file.
    pub storage_path: Option<PathBuf>,
    pub auth_uri: String,
    pub token_uri: String,
    pub grant: GrantType,
    pub credentials: Option<PasswordCredentials>,
    /// Use the simulated backend; no HTTP calls are made.
    pub mock: bool,
    /// Base delay for authority load retries.
    pub authority_retry_base: Duration,
    /// Delay between logout and navigating to the logout URL.
    pub logout_delay: Duration,
    pub silent_auth_timeout: Duration,
}

impl AuthOptions {
    pub fn new(host: Url, redirect_uri: impl Into<String>) -> Self {
        Self {
            host,
            redirect_uri: redirect_uri.into(),
            scope: "public".into(),
            storage: StorageMode::default(),
            storage_path: None,
            auth_uri: "/auth/oauth/authorize".into(),
            token_uri: "/auth/oauth/token".into(),
            grant: GrantType::default(),
            credentials: None,
            mock: false,
            authority_retry_base: Duration::from_millis(300),
            logout_delay: Duration::from_millis(100),
            silent_auth_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_password(mut self, credentials: PasswordCredentials) -> Self {
        self.grant = GrantType::Password;
        self.credentials = Some(credentials);
        self
    }
}

// ── Supervisor ──────────────────────────────────────────────────────

/// Timing and URL knobs for the connection supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Silence after which a connection is declared unhealthy.
    pub health_check: Duration,
    /// Interval between `ping` frames.
    pub keep_alive: Duration,
    /// Unit of the credential-gate backoff.
    pub retry_step: Duration,
    /// Cap on the credential-gate backoff multiplier.
    pub max_retry_multiplier: u32,
    /// Attempts before giving up and asking the host to reload.
    pub max_attempts: u32,
    /// Cap on the backoff after a transport error.
    pub error_retry_cap: Duration,
    /// Poll interval for sends while a connect is in progress.
    pub send_poll: Duration,
    pub api_route: String,
    /// Send the bearer token as a cookie instead of a query parameter.
    pub token_in_cookie: bool,
    /// Add `fixed_device=true` to the socket URL.
    pub fixed_device: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check: Duration::from_secs(30),
            keep_alive: Duration::from_secs(20),
            retry_step: Duration::from_secs(1),
            max_retry_multiplier: 10,
            max_attempts: 40,
            error_retry_cap: Duration::from_secs(5),
            send_poll: Duration::from_secs(1),
            api_route: DEFAULT_API_ROUTE.into(),
            token_in_cookie: false,
            fixed_device: false,
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    #[default]
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(PathBuf),
    /// Skip verification (self-signed lab installs).
    DangerAcceptInvalid,
}

/// Everything a [`Client`](crate::Client) needs besides auth options.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub supervisor: SupervisorConfig,
    pub tls: TlsVerification,
    /// HTTP request timeout.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            tls: TlsVerification::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn transport(&self) -> TransportConfig {
        let tls = match &self.tls {
            TlsVerification::SystemDefaults => TlsMode::System,
            TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
            TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
        };
        TransportConfig {
            tls,
            timeout: self.timeout,
        }
    }
}
