// ── Credential store ──
//
// Tokens, expiry and in-progress flow values (nonce, PKCE verifier, auth
// code) live in a pluggable key-value backend under keys prefixed with the
// client identifier, so several redirect URIs can share one store and a
// logout only purges its own keys.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use directories::ProjectDirs;
use sha2::{Digest, Sha256};

use crate::error::CoreError;

// ── Backends ────────────────────────────────────────────────────────

/// String key-value storage with browser-storage semantics.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    fn keys(&self) -> Vec<String>;
}

/// Session-scoped storage, dropped with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

/// Durable storage backed by a JSON object on disk.
///
/// Every mutation rewrites the file. Write failures are logged and the
/// in-memory copy stays authoritative for the rest of the process.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|e| CoreError::Storage {
                message: format!("{}: {e}", path.display()),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(CoreError::Storage {
                    message: format!("{}: {e}", path.display()),
                });
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// `<data dir>/credentials.json` per platform conventions.
    pub fn default_path() -> PathBuf {
        ProjectDirs::from("com", "ctrlwire", "ctrlwire").map_or_else(
            || PathBuf::from(".ctrlwire").join("credentials.json"),
            |dirs| dirs.data_dir().join("credentials.json"),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_entries<R>(&self, mutate: impl FnOnce(&mut BTreeMap<String, String>) -> R) -> R {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let out = mutate(&mut entries);
        if let Err(e) = self.flush(&entries) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to persist credentials");
        }
        out
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(entries)?;
        open_private(&self.path)?.write_all(text.as_bytes())
    }
}

/// Open `path` for rewriting, owner read/write only on Unix.
fn open_private(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options.open(path)?;
    // Files written before the mode was applied keep their old bits.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.with_entries(|entries| entries.insert(key.to_owned(), value.to_owned()));
    }

    fn remove(&self, key: &str) {
        self.with_entries(|entries| entries.remove(key));
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

// ── Credential fields ───────────────────────────────────────────────

/// Stored credential fields, suffixed onto the client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CredentialField {
    AccessToken,
    RefreshToken,
    /// Absolute expiry in unix milliseconds.
    ExpiresAt,
    AuthorizationCode,
    Nonce,
    CodeVerifier,
}

/// Stable client identifier: lowercase hex SHA-256 of the redirect URI.
pub fn client_id_for(redirect_uri: &str) -> String {
    let digest = Sha256::digest(redirect_uri.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut hex, byte| {
        use fmt::Write;
        let _ = write!(hex, "{byte:02x}");
        hex
    })
}

// ── CredentialStore ─────────────────────────────────────────────────

/// Client-scoped view over a [`KeyValueStore`].
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
    client_id: String,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, client_id: impl Into<String>) -> Self {
        Self {
            backend,
            client_id: client_id.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn key(&self, field: CredentialField) -> String {
        format!("{}_{}", self.client_id, field.as_ref())
    }

    pub fn get(&self, field: CredentialField) -> Option<String> {
        self.backend.get(&self.key(field)).filter(|v| !v.is_empty())
    }

    pub fn set(&self, field: CredentialField, value: &str) {
        self.backend.set(&self.key(field), value);
    }

    pub fn remove(&self, field: CredentialField) {
        self.backend.remove(&self.key(field));
    }

    /// Stored absolute expiry, if any.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.get(CredentialField::ExpiresAt)
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
    }

    pub fn set_expires_at(&self, at: DateTime<Utc>) {
        self.set(CredentialField::ExpiresAt, &at.timestamp_millis().to_string());
    }

    /// Remove the access token and its expiry.
    pub fn clear_access(&self) {
        self.remove(CredentialField::AccessToken);
        self.remove(CredentialField::ExpiresAt);
    }

    /// Remove every key belonging to this client.
    pub fn purge(&self) {
        let prefix = format!("{}_", self.client_id);
        for key in self.backend.keys() {
            if key.starts_with(&prefix) {
                self.backend.remove(&key);
            }
        }
    }
}
