// ── Credential lifecycle manager ──
//
// Obtains, refreshes and invalidates access tokens against the platform's
// authorization endpoints. One `AuthSession` exists per `setup()` call; it
// owns the configuration, the client-scoped credential store, the loaded
// authority and the single-flight slots, so re-running setup starts from a
// clean slate while long-lived watchers (`online`) keep their receivers.

pub mod navigator;
pub mod pkce;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use ctrlwire_api::{AuthClient, Authority, AuthorizeRequest, TokenGrant, TokenResponse, TransportConfig};

use crate::config::{AuthOptions, GrantType, StorageMode};
use crate::error::{AuthError, CoreError};
use crate::single_flight::SingleFlight;
use crate::supervisor::CredentialSource;

pub use navigator::{HeadlessNavigator, Navigator};
pub use pkce::{PkceChallenge, generate_nonce};
pub use store::{CredentialField, CredentialStore, FileStore, KeyValueStore, MemoryStore, client_id_for};

const AUTHORISE: &str = "authorise";
const LOAD_AUTHORITY: &str = "load_authority";
const MAX_AUTHORITY_BACKOFF_STEPS: u32 = 20;

// ── Session ─────────────────────────────────────────────────────────

struct AuthSession {
    options: AuthOptions,
    store: CredentialStore,
    http: AuthClient,
    authority: ArcSwapOption<Authority>,
    auth_flight: SingleFlight<Result<String, AuthError>>,
    authority_flight: SingleFlight<Result<Arc<Authority>, AuthError>>,
}

impl AuthSession {
    /// Stored access token, or `""` when absent or expired.
    fn token(&self) -> String {
        let Some(token) = self.store.get(CredentialField::AccessToken) else {
            return String::new();
        };
        match self.store.expires_at() {
            Some(at) if at <= Utc::now() => {
                debug!(expired_at = %at, "Access token expired, invalidating");
                self.store.clear_access();
                String::new()
            }
            _ => token,
        }
    }

    fn client_id(&self) -> &str {
        self.store.client_id()
    }
}

fn mock_authority() -> Authority {
    Authority {
        id: "mock-authority".into(),
        name: "Simulated platform".into(),
        domain: "localhost".into(),
        version: "2.0.0".into(),
        ..Authority::default()
    }
}

// ── Manager ─────────────────────────────────────────────────────────

struct AuthInner {
    session: ArcSwapOption<AuthSession>,
    session_store: Arc<MemoryStore>,
    navigator: Arc<dyn Navigator>,
    transport: TransportConfig,
    online: watch::Sender<bool>,
    cancel: CancellationToken,
}

/// Token acquisition, refresh and invalidation for one platform host.
///
/// Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<AuthInner>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("configured", &self.inner.session.load().is_some())
            .field("online", &*self.inner.online.borrow())
            .finish_non_exhaustive()
    }
}

impl CredentialManager {
    pub fn new(
        navigator: Arc<dyn Navigator>,
        transport: TransportConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (online, _) = watch::channel(false);
        Self {
            inner: Arc::new(AuthInner {
                session: ArcSwapOption::empty(),
                session_store: Arc::new(MemoryStore::new()),
                navigator,
                transport,
                online,
                cancel,
            }),
        }
    }

    fn session(&self) -> Result<Arc<AuthSession>, AuthError> {
        self.inner.session.load_full().ok_or(AuthError::NotConfigured)
    }

    /// Configure the manager and load the authority.
    ///
    /// Replaces any previous configuration. In mock mode a fixed authority
    /// is installed and no HTTP calls are made.
    pub async fn setup(&self, options: AuthOptions) -> Result<(), CoreError> {
        let client_id = client_id_for(&options.redirect_uri);
        let backend: Arc<dyn KeyValueStore> = match options.storage {
            StorageMode::Session => self.inner.session_store.clone(),
            StorageMode::Persistent => {
                let path = options.storage_path.clone().unwrap_or_else(FileStore::default_path);
                Arc::new(FileStore::open(path)?)
            }
        };
        let http = AuthClient::new(options.host.clone(), &self.inner.transport)?;

        info!(
            host = %options.host,
            grant = %options.grant,
            storage = %options.storage,
            mock = options.mock,
            "Configuring credential manager"
        );

        let mock = options.mock;
        let session = Arc::new(AuthSession {
            options,
            store: CredentialStore::new(backend, client_id),
            http,
            authority: ArcSwapOption::empty(),
            auth_flight: SingleFlight::new(),
            authority_flight: SingleFlight::new(),
        });
        self.inner.session.store(Some(Arc::clone(&session)));

        if mock {
            session.authority.store(Some(Arc::new(mock_authority())));
            return Ok(());
        }

        self.load_authority().await?;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.inner.session.load().is_some()
    }

    pub fn options(&self) -> Option<AuthOptions> {
        self.inner.session.load().as_ref().map(|s| s.options.clone())
    }

    // ── Token accessors ─────────────────────────────────────────────

    /// The current access token, or `""` when none is held or it expired.
    ///
    /// An expired token is invalidated on the spot rather than refreshed.
    pub fn token(&self) -> String {
        self.inner
            .session
            .load_full()
            .map(|s| s.token())
            .unwrap_or_default()
    }

    pub fn has_token(&self) -> bool {
        !self.token().is_empty()
    }

    /// Clear the cached access token and expiry.
    pub fn invalidate_token(&self) {
        if let Some(session) = self.inner.session.load_full() {
            debug!("Invalidating access token");
            session.store.clear_access();
        }
    }

    /// Online flag stream: `true` once tokens are held, `false` after logout.
    pub fn online(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    /// Current authority snapshot.
    pub fn authority(&self) -> Option<Arc<Authority>> {
        self.inner.session.load().as_ref().and_then(|s| s.authority.load_full())
    }

    // ── Flows ───────────────────────────────────────────────────────

    /// Obtain a token, sharing one flow among concurrent callers.
    ///
    /// `state` is carried through the login redirect after the nonce.
    pub async fn authorise(&self, state: Option<String>) -> Result<String, AuthError> {
        let session = self.session()?;
        let inner = Arc::clone(&self.inner);
        let flow_session = Arc::clone(&session);
        session
            .auth_flight
            .run(AUTHORISE, move || async move { inner.authorise(&flow_session, state.as_deref()).await })
            .await
    }

    /// Process the URL the authorize endpoint redirected back to.
    pub async fn handle_callback(&self, url: &Url) -> Result<String, AuthError> {
        let session = self.session()?;
        self.inner.process_callback(&session, url).await
    }

    /// Revoke the current token server-side, then drop it locally.
    pub async fn revoke_token(&self) -> Result<(), AuthError> {
        let session = self.session()?;
        let token = session.store.get(CredentialField::AccessToken);
        let result = match token {
            Some(token) if !session.options.mock => session
                .http
                .revoke(&session.options.token_uri, &token)
                .await
                .map_err(AuthError::from),
            _ => Ok(()),
        };
        session.store.clear_access();
        result
    }

    /// Revoke, purge every stored credential, go offline and navigate to the
    /// authority's logout page.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let session = self.session()?;
        if let Err(e) = self.revoke_token().await {
            warn!(error = %e, "Token revocation failed during logout");
        }
        session.store.purge();
        self.inner.online.send_replace(false);
        info!("Logged out");

        let logout_url = session
            .authority
            .load_full()
            .filter(|a| !a.logout_url.is_empty())
            .and_then(|a| session.options.host.join(&a.logout_url).ok());
        if let Some(url) = logout_url {
            tokio::time::sleep(session.options.logout_delay).await;
            self.inner.navigator.navigate(&url);
        }
        Ok(())
    }

    /// Load the authority unless already loaded. Retries until it succeeds,
    /// the manager is reconfigured, or shutdown.
    pub async fn load_authority(&self) -> Result<Arc<Authority>, AuthError> {
        let session = self.session()?;
        if let Some(authority) = session.authority.load_full() {
            return Ok(authority);
        }
        self.fetch_authority(session).await
    }

    /// Re-fetch the authority even if one is loaded.
    pub async fn refresh_authority(&self) -> Result<Arc<Authority>, AuthError> {
        let session = self.session()?;
        if session.options.mock {
            return session.authority.load_full().ok_or(AuthError::AuthorityNotLoaded);
        }
        self.fetch_authority(session).await
    }

    async fn fetch_authority(&self, session: Arc<AuthSession>) -> Result<Arc<Authority>, AuthError> {
        let inner = Arc::clone(&self.inner);
        let flow_session = Arc::clone(&session);
        session
            .authority_flight
            .run(LOAD_AUTHORITY, move || async move { inner.load_authority(&flow_session).await })
            .await
    }
}

// ── Flow implementations ────────────────────────────────────────────

impl AuthInner {
    fn is_current(&self, session: &Arc<AuthSession>) -> bool {
        self.session
            .load()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    async fn load_authority(&self, session: &Arc<AuthSession>) -> Result<Arc<Authority>, AuthError> {
        let base = session.options.authority_retry_base;
        let mut attempt: u32 = 0;
        loop {
            if !self.is_current(session) {
                return Err(AuthError::Cancelled);
            }
            match session.http.authority().await {
                Ok(authority) => {
                    info!(
                        authority = %authority.id,
                        version = %authority.version,
                        session = authority.session,
                        "Authority loaded"
                    );
                    let authority = Arc::new(authority);
                    session.authority.store(Some(Arc::clone(&authority)));
                    return Ok(authority);
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = base * attempt.min(MAX_AUTHORITY_BACKOFF_STEPS);
                    warn!(
                        error = %e,
                        retries = attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Failed to load authority, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Err(AuthError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn authorise(&self, session: &AuthSession, state: Option<&str>) -> Result<String, AuthError> {
        let token = session.token();
        if !token.is_empty() {
            self.online.send_replace(true);
            return Ok(token);
        }

        let Some(authority) = session.authority.load_full() else {
            return Err(AuthError::AuthorityNotLoaded);
        };
        let options = &session.options;

        if options.grant == GrantType::Password {
            if let Some(creds) = &options.credentials {
                debug!(username = %creds.username, "Requesting token with password grant");
                let grant = TokenGrant::Password {
                    username: &creds.username,
                    password: &creds.password,
                    client_secret: creds.client_secret.as_ref(),
                    scope: &options.scope,
                };
                return self.exchange(session, &grant).await;
            }
        }

        if let Some(code) = session.store.get(CredentialField::AuthorizationCode) {
            debug!("Exchanging stored authorization code");
            return self.exchange_code(session, &code).await;
        }

        if let Some(refresh_token) = session.store.get(CredentialField::RefreshToken) {
            debug!("Refreshing access token");
            return self
                .exchange(session, &TokenGrant::RefreshToken { refresh_token: &refresh_token })
                .await;
        }

        if authority.session {
            match self.silent_authorise(session, state).await {
                Ok(token) => return Ok(token),
                Err(e @ (AuthError::SilentAuthTimeout | AuthError::NonceMismatch)) => return Err(e),
                Err(e) => warn!(error = %e, "Silent authorization failed, falling back to login"),
            }
        }

        Err(self.redirect_to_login(session, &authority, state))
    }

    /// Generate and persist nonce (+ PKCE verifier for code flows), then
    /// build the authorize URL.
    fn prepare_authorize(session: &AuthSession, state: Option<&str>) -> Result<Url, AuthError> {
        let options = &session.options;
        let nonce = generate_nonce();
        session.store.set(CredentialField::Nonce, &nonce);

        let response_type = options.grant.response_type();
        let pkce = (response_type == "code").then(PkceChallenge::generate);
        match &pkce {
            Some(pkce) => session.store.set(CredentialField::CodeVerifier, &pkce.verifier),
            None => session.store.remove(CredentialField::CodeVerifier),
        }

        let state = format!("{nonce};{}", state.unwrap_or_default());
        let url = session.http.authorize_url(
            &options.auth_uri,
            &AuthorizeRequest {
                client_id: session.client_id(),
                redirect_uri: &options.redirect_uri,
                response_type,
                scope: &options.scope,
                state: &state,
                code_challenge: pkce.as_ref().map(|p| p.challenge.as_str()),
            },
        )?;
        Ok(url)
    }

    async fn silent_authorise(&self, session: &AuthSession, state: Option<&str>) -> Result<String, AuthError> {
        let url = Self::prepare_authorize(session, state)?;
        debug!("Attempting silent authorization");
        let landed = tokio::time::timeout(
            session.options.silent_auth_timeout,
            self.navigator.authorize_silently(url),
        )
        .await
        .map_err(|_| AuthError::SilentAuthTimeout)??;
        self.process_callback(session, &landed).await
    }

    fn redirect_to_login(&self, session: &AuthSession, authority: &Authority, state: Option<&str>) -> AuthError {
        let authorize_url = match Self::prepare_authorize(session, state) {
            Ok(url) => url,
            Err(e) => return e,
        };
        let target = if authority.login_url.is_empty() {
            authorize_url
        } else {
            let login = authority.login_url_for(&authorize_url);
            session.options.host.join(&login).unwrap_or(authorize_url)
        };
        info!(url = %target, "Interactive login required");
        self.navigator.navigate(&target);
        AuthError::LoginRequired {
            login_url: target.to_string(),
        }
    }

    async fn process_callback(&self, session: &AuthSession, url: &Url) -> Result<String, AuthError> {
        let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        if let Some(fragment) = url.fragment() {
            params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
        }

        if let Some(error) = params.get("error") {
            let description = params.get("error_description").map_or("", String::as_str);
            return Err(AuthError::TokenExchange {
                message: format!("{error}: {description}"),
                status: None,
            });
        }

        let stored_nonce = session.store.get(CredentialField::Nonce);
        let returned_nonce = params
            .get("state")
            .map(|state| state.split(';').next().unwrap_or_default());
        match (stored_nonce.as_deref(), returned_nonce) {
            (Some(expected), Some(got)) if expected == got => {}
            _ => {
                warn!("Callback state does not match stored nonce");
                return Err(AuthError::NonceMismatch);
            }
        }
        session.store.remove(CredentialField::Nonce);

        if let Some(access_token) = params.get("access_token") {
            let tokens = TokenResponse {
                access_token: access_token.clone(),
                refresh_token: params.get("refresh_token").cloned(),
                expires_in: params.get("expires_in").and_then(|s| s.parse().ok()),
                token_type: params.get("token_type").cloned(),
            };
            self.persist(session, &tokens);
            return Ok(tokens.access_token);
        }

        if let Some(code) = params.get("code") {
            session.store.set(CredentialField::AuthorizationCode, code);
            return self.exchange_code(session, code).await;
        }

        Err(AuthError::InvalidCallback)
    }

    async fn exchange_code(&self, session: &AuthSession, code: &str) -> Result<String, AuthError> {
        let verifier = session.store.get(CredentialField::CodeVerifier);
        session.store.remove(CredentialField::AuthorizationCode);
        let result = self
            .exchange(
                session,
                &TokenGrant::AuthorizationCode {
                    code,
                    code_verifier: verifier.as_deref(),
                },
            )
            .await;
        session.store.remove(CredentialField::CodeVerifier);
        result
    }

    async fn exchange(&self, session: &AuthSession, grant: &TokenGrant<'_>) -> Result<String, AuthError> {
        let options = &session.options;
        match session
            .http
            .exchange(&options.token_uri, session.client_id(), &options.redirect_uri, grant)
            .await
        {
            Ok(tokens) => {
                self.persist(session, &tokens);
                Ok(tokens.access_token)
            }
            Err(e) => {
                warn!(error = %e, "Token exchange failed, clearing refresh token");
                session.store.remove(CredentialField::RefreshToken);
                Err(AuthError::TokenExchange {
                    status: e.status(),
                    message: e.to_string(),
                })
            }
        }
    }

    fn persist(&self, session: &AuthSession, tokens: &TokenResponse) {
        let store = &session.store;
        store.set(CredentialField::AccessToken, &tokens.access_token);
        if let Some(refresh) = &tokens.refresh_token {
            store.set(CredentialField::RefreshToken, refresh);
        }
        match tokens.expires_in {
            Some(secs) => match expiry_after(secs) {
                Some(at) => store.set_expires_at(at),
                None => {
                    warn!(expires_in = secs, "Token lifetime out of range, treating as non-expiring");
                    store.remove(CredentialField::ExpiresAt);
                }
            },
            None => store.remove(CredentialField::ExpiresAt),
        }
        debug!(expires_in = ?tokens.expires_in, "Stored access token");
        self.online.send_replace(true);
    }
}

/// Absolute expiry `secs` from now, if representable.
fn expiry_after(secs: i64) -> Option<DateTime<Utc>> {
    ChronoDuration::try_seconds(secs).and_then(|ttl| Utc::now().checked_add_signed(ttl))
}

// ── Supervisor seam ─────────────────────────────────────────────────

impl CredentialSource for CredentialManager {
    fn token(&self) -> String {
        CredentialManager::token(self)
    }

    fn authority(&self) -> Option<Arc<Authority>> {
        CredentialManager::authority(self)
    }

    fn host(&self) -> Option<Url> {
        self.inner.session.load().as_ref().map(|s| s.options.host.clone())
    }

    fn is_mock(&self) -> bool {
        self.inner.session.load().as_ref().is_some_and(|s| s.options.mock)
    }

    fn authorise(&self) -> BoxFuture<'static, Result<String, AuthError>> {
        let this = self.clone();
        async move { this.authorise(None).await }.boxed()
    }

    fn invalidate_token(&self) {
        CredentialManager::invalidate_token(self);
    }

    fn refresh_authority(&self) -> BoxFuture<'static, Result<Arc<Authority>, AuthError>> {
        let this = self.clone();
        async move { this.refresh_authority().await }.boxed()
    }
}
