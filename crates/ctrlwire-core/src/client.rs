// ── Client facade ──
//
// Owns one of each engine part (credential manager, connection supervisor,
// request correlator, binding registry, simulated backend) and wires them
// together: inbound frames are routed to the correlator or the registry,
// outbound requests go through the supervisor's send path. After every
// reconnect, unanswered commands are re-sent and bound keys re-bound.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use ctrlwire_api::{CommandKind, Connector, ErrorCode, Inbound, ResourceClient, WebSocketConnector};

use crate::auth::{CredentialManager, HeadlessNavigator, Navigator};
use crate::bindings::{BindingKey, BindingRegistry, BindingStream, DebugEvent};
use crate::config::{AuthOptions, ClientConfig};
use crate::correlator::{Correlator, Registration};
use crate::error::{CoreError, RequestError};
use crate::mock::{MockConnector, SimulatedBackend};
use crate::supervisor::{ConnectionState, Dispatch, Supervisor};

/// Binding name used for `debug` / `ignore` commands.
const DEBUG_NAME: &str = "debug";

// ── Inbound routing ─────────────────────────────────────────────────

/// Routes parsed frames to the correlator and the binding registry.
struct Router {
    correlator: Arc<Correlator>,
    bindings: Arc<BindingRegistry>,
}

impl Dispatch for Router {
    fn dispatch(&self, frame: &str) {
        let inbound: Inbound = match serde_json::from_str(frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                let preview: String = frame.chars().take(200).collect();
                warn!(error = %e, frame = %preview, "Unrecognised control frame");
                return;
            }
        };

        match inbound {
            Inbound::Success { id, value } => {
                self.correlator.resolve(id, value);
            }
            Inbound::Error { id, code, msg } => {
                let code = ErrorCode::from(code);
                debug!(id, %code, %msg, "Request rejected");
                self.correlator.reject(id, RequestError::Protocol { code, message: msg });
            }
            Inbound::Notify { value, meta } => {
                let key = BindingKey::from(&meta);
                trace!(%key, "notify");
                self.bindings.notify(&key, value);
            }
            Inbound::Debug {
                mod_id,
                klass,
                msg,
                level,
                meta,
            } => self.bindings.emit_debug(DebugEvent {
                mod_id,
                module: format!("{}_{}", meta.module, meta.index),
                class_name: klass,
                message: msg,
                level,
                time: Utc::now(),
            }),
        }
    }
}

// ── Builder ─────────────────────────────────────────────────────────

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    navigator: Option<Arc<dyn Navigator>>,
    connector: Option<Arc<dyn Connector>>,
    backend: Option<Arc<SimulatedBackend>>,
}

impl ClientBuilder {
    /// Host hooks for login redirects and reloads.
    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    /// Replace the live WebSocket connector (ignored in mock mode).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Share a pre-populated simulated backend.
    pub fn backend(mut self, backend: Arc<SimulatedBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Client {
        let cancel = CancellationToken::new();
        let navigator = self.navigator.unwrap_or_else(|| Arc::new(HeadlessNavigator));
        let backend = self.backend.unwrap_or_default();
        let correlator = Arc::new(Correlator::new());
        let bindings = Arc::new(BindingRegistry::new());

        let auth = CredentialManager::new(
            Arc::clone(&navigator),
            self.config.transport(),
            cancel.child_token(),
        );
        let live: Arc<dyn Connector> = self
            .connector
            .clone()
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()));
        let router = Router {
            correlator: Arc::clone(&correlator),
            bindings: Arc::clone(&bindings),
        };
        let supervisor = Supervisor::new(
            self.config.supervisor.clone(),
            Arc::new(auth.clone()),
            live,
            Arc::new(router),
            navigator,
            cancel.child_token(),
        );

        Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                auth,
                supervisor,
                correlator,
                bindings,
                backend,
                connector: self.connector,
                bound: Mutex::new(BTreeSet::new()),
                resync_started: AtomicBool::new(false),
                cancel,
            }),
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

struct ClientInner {
    config: ClientConfig,
    auth: CredentialManager,
    supervisor: Supervisor,
    correlator: Arc<Correlator>,
    bindings: Arc<BindingRegistry>,
    backend: Arc<SimulatedBackend>,
    connector: Option<Arc<dyn Connector>>,
    /// Keys with a successful `bind` and no `unbind` since.
    bound: Mutex<BTreeSet<BindingKey>>,
    resync_started: AtomicBool,
    cancel: CancellationToken,
}

/// The control-platform client.
///
/// Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("auth", &self.inner.auth)
            .field("supervisor", &self.inner.supervisor)
            .field("pending", &self.inner.correlator.pending_count())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            navigator: None,
            connector: None,
            backend: None,
        }
    }

    pub fn new(config: ClientConfig) -> Self {
        Self::builder(config).build()
    }

    /// Configure credentials and pick the transport.
    ///
    /// Mock mode routes the control channel to the simulated backend.
    /// Otherwise an authorization attempt is made right away; failure is
    /// logged and retried by the supervisor on connect.
    pub async fn setup(&self, options: AuthOptions) -> Result<(), CoreError> {
        let mock = options.mock;
        let connector: Arc<dyn Connector> = if mock {
            Arc::new(MockConnector::new(Arc::clone(&self.inner.backend)))
        } else if let Some(connector) = &self.inner.connector {
            Arc::clone(connector)
        } else {
            Arc::new(WebSocketConnector::new())
        };
        self.inner.supervisor.set_connector(connector);

        self.inner.auth.setup(options).await?;
        self.start_resync();

        if !mock {
            if let Err(e) = self.inner.auth.authorise(None).await {
                warn!(error = %e, "Initial authorization did not complete");
            }
        }
        Ok(())
    }

    /// Connect now instead of on the first request.
    pub async fn connect(&self) -> Result<(), CoreError> {
        self.inner.supervisor.ensure_connected().await?;
        Ok(())
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Subscribe to a variable and ask the server to stream it.
    ///
    /// The returned stream is taken before the command is sent, so no
    /// update is missed.
    pub async fn bind(&self, key: &BindingKey) -> Result<BindingStream, CoreError> {
        let stream = self.inner.bindings.listen(key);
        self.inner.request(CommandKind::Bind, key, None).await?;
        lock(&self.inner.bound).insert(key.clone());
        Ok(stream)
    }

    /// Stop server-side streaming of a variable. Local subscribers stay
    /// valid and keep the last value.
    pub async fn unbind(&self, key: &BindingKey) -> Result<(), CoreError> {
        self.inner.request(CommandKind::Unbind, key, None).await?;
        lock(&self.inner.bound).remove(key);
        Ok(())
    }

    /// Call method `method.name` on a module instance.
    pub async fn exec(&self, method: &BindingKey, args: Vec<Value>) -> Result<Value, CoreError> {
        Ok(self.inner.request(CommandKind::Exec, method, Some(args)).await?)
    }

    /// Start receiving a module's log lines on [`debug_events`](Self::debug_events).
    pub async fn debug(&self, system: &str, module: &str, index: u32) -> Result<(), CoreError> {
        let key = BindingKey::new(system, module, index, DEBUG_NAME);
        self.inner.request(CommandKind::Debug, &key, None).await?;
        Ok(())
    }

    /// Stop receiving a module's log lines.
    pub async fn ignore(&self, system: &str, module: &str, index: u32) -> Result<(), CoreError> {
        let key = BindingKey::new(system, module, index, DEBUG_NAME);
        self.inner.request(CommandKind::Ignore, &key, None).await?;
        Ok(())
    }

    // ── Observation ─────────────────────────────────────────────────

    /// Local subscription only; does not send `bind`.
    pub fn listen(&self, key: &BindingKey) -> BindingStream {
        self.inner.bindings.listen(key)
    }

    pub fn value(&self, key: &BindingKey) -> Option<Value> {
        self.inner.bindings.value(key)
    }

    pub fn debug_events(&self) -> broadcast::Receiver<DebugEvent> {
        self.inner.bindings.debug_events()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.inner.supervisor.connected()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.supervisor.state()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    // ── Collaborators ───────────────────────────────────────────────

    pub fn auth(&self) -> &CredentialManager {
        &self.inner.auth
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn backend(&self) -> &Arc<SimulatedBackend> {
        &self.inner.backend
    }

    /// REST client for the platform API, authenticated with the current
    /// access token.
    pub fn rest(&self) -> Result<ResourceClient, CoreError> {
        let options = self.inner.auth.options().ok_or(CoreError::NotConfigured)?;
        let auth = self.inner.auth.clone();
        Ok(ResourceClient::new(
            options.host,
            self.inner.config.supervisor.api_route.clone(),
            Arc::new(move || auth.token()),
            &self.inner.config.transport(),
        )?)
    }

    /// Close the control channel, fail pending requests and stop every
    /// background task.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.supervisor.shutdown();
        self.inner.correlator.fail_all(&RequestError::Shutdown);
    }

    // ── Reconnect resync ────────────────────────────────────────────

    fn start_resync(&self) {
        if self.inner.resync_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let mut state = self.inner.supervisor.state();
        let cancel = self.inner.cancel.clone();
        let mut seen = self.inner.supervisor.generation();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if *state.borrow_and_update() != ConnectionState::Connected {
                    continue;
                }
                let Some(inner) = Weak::upgrade(&weak) else { break };
                let generation = inner.supervisor.generation();
                if generation == seen {
                    continue;
                }
                let first = seen == 0;
                seen = generation;
                if !first {
                    inner.resync();
                }
            }
        });
    }
}

impl ClientInner {
    /// Register, transmit if new, and await the shared reply.
    async fn request(
        &self,
        kind: CommandKind,
        key: &BindingKey,
        args: Option<Vec<Value>>,
    ) -> Result<Value, RequestError> {
        let registration = self.correlator.register(kind, key, args)?;
        let reply = registration.reply();
        if let Registration::New { command, .. } = registration {
            let frame = serde_json::to_string(&command).map_err(|e| RequestError::Encode(e.to_string()))?;
            if let Err(e) = self.deliver(command.id, &frame).await {
                self.correlator.reject(command.id, e);
            }
        }
        reply.await
    }

    /// Write request `id` once a transport is up, at most once per transport
    /// generation.
    async fn deliver(&self, id: u64, frame: &str) -> Result<(), RequestError> {
        let poll = self.config.supervisor.send_poll;
        loop {
            if self.cancel.is_cancelled() {
                return Err(RequestError::Shutdown);
            }
            if self.supervisor.is_connected() {
                if self.transmit(id, frame) {
                    return Ok(());
                }
                self.pause(poll).await?;
            } else if self.supervisor.is_connecting() {
                self.pause(poll).await?;
            } else {
                self.supervisor.ensure_connected().await?;
            }
        }
    }

    /// Write request `id` on the live transport unless it already went out
    /// there. `false` means the write raced a disconnect.
    fn transmit(&self, id: u64, frame: &str) -> bool {
        let generation = self.supervisor.generation();
        if !self.correlator.claim_send(id, generation) {
            return true;
        }
        match self.supervisor.send_to(generation, frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, id, generation, "Send raced a disconnect");
                false
            }
        }
    }

    async fn pause(&self, delay: std::time::Duration) -> Result<(), RequestError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(RequestError::Shutdown),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Re-send unanswered commands under their original ids, then re-bind
    /// every bound key that has no bind in flight.
    fn resync(self: &Arc<Self>) {
        let pending = self.correlator.pending_commands();
        let bound: Vec<BindingKey> = lock(&self.bound).iter().cloned().collect();
        info!(pending = pending.len(), bound = bound.len(), "Resyncing after reconnect");

        for command in pending {
            match serde_json::to_string(&command) {
                Ok(frame) => {
                    if !self.transmit(command.id, &frame) {
                        debug!(id = command.id, "Resend failed");
                    }
                }
                Err(e) => {
                    self.correlator.reject(command.id, RequestError::Encode(e.to_string()));
                }
            }
        }

        for key in bound {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = inner.request(CommandKind::Bind, &key, None).await {
                    warn!(error = %e, %key, "Re-bind after reconnect failed");
                }
            });
        }
    }
}
