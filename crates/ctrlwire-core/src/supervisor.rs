// ── Connection supervisor ──
//
// Owns at most one live control-channel transport. Connecting is gated on
// credentials (a token or mock mode, plus a loaded authority), coalesced so
// concurrent callers share one attempt, and bounded by an attempt ceiling.
// Each installed transport gets a generation number; a reader task per
// transport re-arms the health timer on any traffic, sends keep-alive pings
// and forwards frames to the dispatcher only while its generation is current.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use ctrlwire_api::protocol::PING;
use ctrlwire_api::{Authority, ConnectRequest, Connection, Connector, Transport, TransportEvent};

use crate::auth::Navigator;
use crate::config::SupervisorConfig;
use crate::error::{AuthError, RequestError};
use crate::single_flight::SingleFlight;

const CONNECT: &str = "connect";
const LEGACY_SOCKET_PATH: &str = "/control/websocket";

// ── Seams ───────────────────────────────────────────────────────────

/// What the supervisor needs from the credential lifecycle manager.
pub trait CredentialSource: Send + Sync {
    /// Current access token or `""`.
    fn token(&self) -> String;
    fn authority(&self) -> Option<Arc<Authority>>;
    /// Platform root the socket URL is derived from.
    fn host(&self) -> Option<Url>;
    /// Mock mode skips the token gate.
    fn is_mock(&self) -> bool;
    fn authorise(&self) -> BoxFuture<'static, Result<String, AuthError>>;
    fn invalidate_token(&self);
    fn refresh_authority(&self) -> BoxFuture<'static, Result<Arc<Authority>, AuthError>>;
}

/// Receives every non-keep-alive frame from the current transport.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, frame: &str);
}

/// Lifecycle of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Health check expired; a reconnect follows.
    Unhealthy,
}

// ── Socket URL ──────────────────────────────────────────────────────

/// Build the socket URL and optional cookie for `host`.
///
/// Legacy platforms (authority major version 1) use `/control/websocket`;
/// newer ones `{api_route}/systems/control`.
pub fn socket_request(
    config: &SupervisorConfig,
    host: &Url,
    authority: &Authority,
    token: &str,
) -> Result<ConnectRequest, RequestError> {
    let path = if authority.major_version() == Some(1) {
        LEGACY_SOCKET_PATH.to_owned()
    } else {
        format!("{}/systems/control", config.api_route.trim_end_matches('/'))
    };

    let mut url = host
        .join(&path)
        .map_err(|e| RequestError::Encode(format!("invalid socket URL: {e}")))?;
    let scheme = if host.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|()| RequestError::Encode(format!("cannot use {scheme} for {host}")))?;

    let mut cookie = None;
    {
        let mut query = url.query_pairs_mut();
        if !token.is_empty() {
            if config.token_in_cookie {
                cookie = Some(format!("bearer_token={token}"));
            } else {
                query.append_pair("bearer_token", token);
            }
        }
        if config.fixed_device {
            query.append_pair("fixed_device", "true");
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }

    Ok(ConnectRequest { url, cookie })
}

// ── Supervisor ──────────────────────────────────────────────────────

struct ActiveTransport {
    generation: u64,
    transport: Box<dyn Transport>,
    cancel: CancellationToken,
}

struct SupervisorInner {
    config: SupervisorConfig,
    credentials: Arc<dyn CredentialSource>,
    connector: RwLock<Arc<dyn Connector>>,
    dispatch: Arc<dyn Dispatch>,
    navigator: Arc<dyn Navigator>,
    state: watch::Sender<ConnectionState>,
    connected: watch::Sender<bool>,
    generation: AtomicU64,
    active: Mutex<Option<ActiveTransport>>,
    connect_flight: SingleFlight<Result<(), RequestError>>,
    cancel: CancellationToken,
}

/// Connect / health-check / keep-alive / reconnect state machine.
///
/// Cheaply cloneable; clones share the same transport.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &*self.inner.state.borrow())
            .field("generation", &self.inner.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        credentials: Arc<dyn CredentialSource>,
        connector: Arc<dyn Connector>,
        dispatch: Arc<dyn Dispatch>,
        navigator: Arc<dyn Navigator>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                credentials,
                connector: RwLock::new(connector),
                dispatch,
                navigator,
                state,
                connected,
                generation: AtomicU64::new(0),
                active: Mutex::new(None),
                connect_flight: SingleFlight::new(),
                cancel,
            }),
        }
    }

    /// Swap the connector used for future connection attempts.
    pub fn set_connector(&self, connector: Arc<dyn Connector>) {
        *self.inner.connector.write().unwrap_or_else(PoisonError::into_inner) = connector;
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    // ── Observation ─────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.connect_flight.in_flight(CONNECT)
    }

    /// Boolean connected stream.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Generation of the current (or last) transport.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    // ── Control ─────────────────────────────────────────────────────

    /// Connect unless already connected. Concurrent callers share one
    /// attempt sequence.
    pub async fn ensure_connected(&self) -> Result<(), RequestError> {
        if self.is_connected() {
            return Ok(());
        }
        self.inner.ensure_connected().await
    }

    /// Write a frame to the current transport.
    pub fn send(&self, frame: String) -> Result<(), ctrlwire_api::Error> {
        let active = lock(&self.inner.active);
        match active.as_ref() {
            Some(active) => active.transport.send(frame),
            None => Err(ctrlwire_api::Error::TransportClosed),
        }
    }

    /// Write a frame only if transport `generation` is still the live one.
    pub fn send_to(&self, generation: u64, frame: &str) -> Result<(), ctrlwire_api::Error> {
        self.inner.send_on(generation, frame)
    }

    /// Drop the current transport and connect again.
    pub async fn reconnect(&self) -> Result<(), RequestError> {
        self.inner.drop_active(ConnectionState::Connecting);
        self.inner.ensure_connected().await
    }

    /// Close the transport and stop all supervision.
    pub fn shutdown(&self) {
        info!("Shutting down control channel");
        self.inner.cancel.cancel();
        self.inner.drop_active(ConnectionState::Disconnected);
    }
}

impl SupervisorInner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        let connected = state == ConnectionState::Connected;
        self.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector.read().unwrap_or_else(PoisonError::into_inner))
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<(), RequestError> {
        let inner = Arc::clone(self);
        self.connect_flight
            .run(CONNECT, move || async move { inner.connect_loop().await })
            .await
    }

    async fn pause(&self, delay: Duration) -> Result<(), RequestError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(RequestError::Shutdown),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn gate_backoff(&self, attempt: u32) -> Duration {
        self.config.retry_step * attempt.min(self.config.max_retry_multiplier)
    }

    fn error_backoff(&self, attempt: u32) -> Duration {
        (self.config.retry_step * attempt).min(self.config.error_retry_cap)
    }

    async fn connect_loop(self: Arc<Self>) -> Result<(), RequestError> {
        let max_attempts = self.config.max_attempts;
        self.set_state(ConnectionState::Connecting);

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return Err(RequestError::Shutdown);
            }

            let creds = &self.credentials;
            let mock = creds.is_mock();
            if !mock && creds.token().is_empty() {
                if let Err(e) = creds.authorise().await {
                    warn!(error = %e, attempt, "Authorization before connect failed");
                }
            }

            let token = creds.token();
            let ready = (mock || !token.is_empty())
                .then(|| creds.authority().zip(creds.host()))
                .flatten();
            let Some((authority, host)) = ready else {
                let delay = self.gate_backoff(attempt);
                debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Credentials not ready, backing off"
                );
                self.pause(delay).await?;
                continue;
            };

            let request = match socket_request(&self.config, &host, &authority, &token) {
                Ok(request) => request,
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            };

            match self.connector().connect(request).await {
                Ok(connection) => {
                    if self.cancel.is_cancelled() {
                        connection.transport.close();
                        self.set_state(ConnectionState::Disconnected);
                        return Err(RequestError::Shutdown);
                    }
                    self.install(connection);
                    return Ok(());
                }
                Err(e) if e.is_unauthorized() => {
                    warn!(attempt, "Control socket rejected credentials, refreshing");
                    creds.invalidate_token();
                    if let Err(e) = creds.refresh_authority().await {
                        warn!(error = %e, "Authority refresh failed");
                    }
                    self.pause(self.error_backoff(attempt)).await?;
                }
                Err(e) => {
                    let delay = self.error_backoff(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Control socket connect failed"
                    );
                    self.pause(delay).await?;
                }
            }
        }

        error!(attempts = max_attempts, "Giving up on control channel, requesting reload");
        self.set_state(ConnectionState::Disconnected);
        self.navigator.reload();
        Err(RequestError::ConnectionExhausted {
            attempts: max_attempts,
        })
    }

    /// Make `connection` the live transport, superseding any previous one.
    fn install(self: &Arc<Self>, connection: Connection) {
        let Connection { transport, events } = connection;
        let cancel = self.cancel.child_token();
        let generation = {
            let mut active = lock(&self.active);
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(previous) = active.replace(ActiveTransport {
                generation,
                transport,
                cancel: cancel.clone(),
            }) {
                debug!(generation = previous.generation, "Closing superseded transport");
                previous.cancel.cancel();
                previous.transport.close();
            }
            generation
        };

        info!(generation, "Control channel connected");
        self.set_state(ConnectionState::Connected);

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.pump(generation, events, cancel).await });
    }

    /// Close the active transport, if any, and publish `state`.
    fn drop_active(&self, state: ConnectionState) {
        if let Some(active) = lock(&self.active).take() {
            active.cancel.cancel();
            active.transport.close();
        }
        self.set_state(state);
    }

    /// The transport of `generation` failed: tear it down and reconnect.
    fn connection_lost(self: &Arc<Self>, generation: u64, state: ConnectionState) {
        {
            let mut active = lock(&self.active);
            if active.as_ref().is_none_or(|a| a.generation != generation) {
                trace!(generation, "Ignoring loss of superseded transport");
                return;
            }
            if let Some(active) = active.take() {
                active.transport.close();
            }
        }
        self.set_state(state);

        if self.cancel.is_cancelled() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.ensure_connected().await {
                error!(error = %e, "Reconnect failed");
            }
        });
    }

    fn send_on(&self, generation: u64, frame: &str) -> Result<(), ctrlwire_api::Error> {
        let active = lock(&self.active);
        match active.as_ref() {
            Some(active) if active.generation == generation => active.transport.send(frame.to_owned()),
            _ => Err(ctrlwire_api::Error::TransportClosed),
        }
    }

    /// Reader loop for one transport generation.
    async fn pump(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        let health_window = self.config.health_check;
        let health = tokio::time::sleep(health_window);
        tokio::pin!(health);

        let mut keep_alive = tokio::time::interval(self.config.keep_alive);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(TransportEvent::Message(frame)) => {
                        health.as_mut().reset(Instant::now() + health_window);
                        if self.is_current(generation) {
                            self.dispatch.dispatch(&frame);
                        } else {
                            trace!(generation, "Dropping frame from superseded transport");
                        }
                    }
                    Some(TransportEvent::Pong) => {
                        health.as_mut().reset(Instant::now() + health_window);
                        trace!(generation, "pong");
                    }
                    Some(TransportEvent::Error(e)) => {
                        warn!(error = %e, generation, "Control channel error");
                        self.connection_lost(generation, ConnectionState::Connecting);
                        break;
                    }
                    Some(TransportEvent::Closed { code, reason }) => {
                        info!(?code, %reason, generation, "Control channel closed");
                        self.connection_lost(generation, ConnectionState::Connecting);
                        break;
                    }
                    None => {
                        debug!(generation, "Transport event stream ended");
                        self.connection_lost(generation, ConnectionState::Connecting);
                        break;
                    }
                },
                () = &mut health => {
                    warn!(
                        generation,
                        window_secs = health_window.as_secs(),
                        "No traffic within health-check window, reconnecting"
                    );
                    self.connection_lost(generation, ConnectionState::Unhealthy);
                    break;
                }
                _ = keep_alive.tick() => {
                    if let Err(e) = self.send_on(generation, PING) {
                        debug!(error = %e, generation, "Keep-alive ping failed");
                    }
                }
            }
        }
        trace!(generation, "Transport pump exiting");
    }
}
