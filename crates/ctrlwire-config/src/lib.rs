//! Shared configuration for ctrlwire tools.
//!
//! TOML profiles, credential resolution (env + keyring + plaintext),
//! and translation to `ctrlwire_core::{AuthOptions, ClientConfig}`.
//! The CLI layers its flag overrides on top of these.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use ctrlwire_core::{
    AuthOptions, ClientConfig, GrantType, PasswordCredentials, StorageMode, SupervisorConfig, TlsVerification,
};

/// Keyring service name shared by every ctrlwire binary.
pub const KEYRING_SERVICE: &str = "ctrlwire";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no credentials configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named platform profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default)]
    pub insecure: bool,

    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            insecure: false,
            timeout: default_timeout(),
        }
    }
}

fn default_output() -> String {
    "table".into()
}
fn default_timeout() -> u64 {
    30
}

/// A named platform profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Profile {
    /// Platform root URL (e.g., "https://bms.example.com").
    pub host: String,

    /// Registered OAuth redirect URI.
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    #[serde(default = "default_scope")]
    pub scope: String,

    /// Grant: "password", "auth_code", or "implicit".
    #[serde(default = "default_grant")]
    pub grant: String,

    /// Credential storage: "session" or "persistent".
    #[serde(default = "default_storage")]
    pub storage: String,

    /// Username for the password grant.
    pub username: Option<String>,

    /// Password (plaintext, prefer keyring).
    pub password: Option<String>,

    /// Environment variable name containing the password.
    pub password_env: Option<String>,

    pub client_secret: Option<String>,

    /// Talk to the built-in simulated backend instead of a platform.
    #[serde(default)]
    pub mock: bool,

    /// Send the bearer token as a cookie on the socket handshake.
    #[serde(default)]
    pub token_in_cookie: bool,

    /// Mark this client as a fixed-location panel.
    #[serde(default)]
    pub fixed_device: bool,

    /// Override the engine API route (default `/api/engine/v2`).
    pub api_route: Option<String>,

    /// Path to custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    /// Override insecure TLS setting.
    pub insecure: Option<bool>,

    /// Override timeout.
    pub timeout: Option<u64>,
}

impl Profile {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            redirect_uri: default_redirect_uri(),
            scope: default_scope(),
            grant: default_grant(),
            storage: default_storage(),
            username: None,
            password: None,
            password_env: None,
            client_secret: None,
            mock: false,
            token_in_cookie: false,
            fixed_device: false,
            api_route: None,
            ca_cert: None,
            insecure: None,
            timeout: None,
        }
    }

    pub fn grant_type(&self) -> Result<GrantType, ConfigError> {
        self.grant.parse().map_err(|_| ConfigError::Validation {
            field: "grant".into(),
            reason: format!("expected 'password', 'auth_code', or 'implicit', got '{}'", self.grant),
        })
    }

    pub fn storage_mode(&self) -> Result<StorageMode, ConfigError> {
        self.storage.parse().map_err(|_| ConfigError::Validation {
            field: "storage".into(),
            reason: format!("expected 'session' or 'persistent', got '{}'", self.storage),
        })
    }

    pub fn host_url(&self) -> Result<Url, ConfigError> {
        self.host.parse().map_err(|_| ConfigError::Validation {
            field: "host".into(),
            reason: format!("invalid URL: {}", self.host),
        })
    }
}

fn default_redirect_uri() -> String {
    "http://localhost:8400/oauth-resp.html".into()
}
fn default_scope() -> String {
    "public".into()
}
fn default_grant() -> String {
    "auth_code".into()
}
fn default_storage() -> String {
    "persistent".into()
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "ctrlwire", "ctrlwire").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("ctrlwire");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file. `CTRLWIRE_` variables override it, with
/// `__` separating nested keys (`CTRLWIRE_DEFAULTS__TIMEOUT=5`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("CTRLWIRE_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution (without CLI flags) ───────────────────────

fn keyring_entry(profile_name: &str) -> Result<keyring::Entry, keyring::Error> {
    keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/password"))
}

/// Store a profile's password in the system keyring.
pub fn store_password(profile_name: &str, password: &str) -> Result<(), ConfigError> {
    keyring_entry(profile_name)?.set_password(password)?;
    Ok(())
}

/// Resolve password-grant credentials without CLI flags.
///
/// Username comes from the profile or `CTRLWIRE_USERNAME`. The password
/// is the first hit of: the profile's `password_env` variable,
/// `CTRLWIRE_PASSWORD`, the system keyring, plaintext in the profile.
pub fn resolve_password(profile: &Profile, profile_name: &str) -> Result<PasswordCredentials, ConfigError> {
    let username = profile
        .username
        .clone()
        .or_else(|| std::env::var("CTRLWIRE_USERNAME").ok())
        .ok_or_else(|| ConfigError::NoCredentials {
            profile: profile_name.into(),
        })?;
    let client_secret = profile.client_secret.clone().map(SecretString::from);
    let credentials = |password: String| PasswordCredentials {
        username: username.clone(),
        password: SecretString::from(password),
        client_secret: client_secret.clone(),
    };

    // 1. Profile's password_env → env var lookup
    if let Some(ref env_name) = profile.password_env {
        if let Ok(pw) = std::env::var(env_name) {
            return Ok(credentials(pw));
        }
    }

    // 2. Well-known env var
    if let Ok(pw) = std::env::var("CTRLWIRE_PASSWORD") {
        return Ok(credentials(pw));
    }

    // 3. Keyring
    if let Ok(entry) = keyring_entry(profile_name) {
        if let Ok(pw) = entry.get_password() {
            return Ok(credentials(pw));
        }
    }

    // 4. Plaintext in config
    if let Some(ref pw) = profile.password {
        return Ok(credentials(pw.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

/// Build `AuthOptions` from a profile, no CLI flag overrides.
///
/// Password credentials are only resolved for the password grant, and
/// never for mock profiles.
pub fn profile_to_auth_options(profile: &Profile, profile_name: &str) -> Result<AuthOptions, ConfigError> {
    let mut options = AuthOptions::new(profile.host_url()?, profile.redirect_uri.clone());
    options.scope.clone_from(&profile.scope);
    options.storage = profile.storage_mode()?;
    options.grant = profile.grant_type()?;
    options.mock = profile.mock;

    if options.grant == GrantType::Password && !profile.mock {
        options.credentials = Some(resolve_password(profile, profile_name)?);
    }
    Ok(options)
}

/// Build a `ClientConfig` from a profile and the global defaults.
pub fn profile_to_client_config(profile: &Profile, defaults: &Defaults) -> ClientConfig {
    let tls = if profile.insecure.unwrap_or(defaults.insecure) {
        TlsVerification::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsVerification::CustomCa(ca_path.clone())
    } else {
        TlsVerification::SystemDefaults
    };

    let mut supervisor = SupervisorConfig::default();
    if let Some(ref route) = profile.api_route {
        supervisor.api_route.clone_from(route);
    }
    supervisor.token_in_cookie = profile.token_in_cookie;
    supervisor.fixed_device = profile.fixed_device;

    ClientConfig {
        supervisor,
        tls,
        timeout: Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout)),
    }
}
