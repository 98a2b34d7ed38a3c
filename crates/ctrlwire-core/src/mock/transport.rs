// ── Mock transport ──
//
// A control-channel transport that answers commands from a
// SimulatedBackend instead of the network. Variable changes on bound
// modules are re-published as `notify` frames after a random delay, one
// ordered stream per binding.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use ctrlwire_api::protocol::{PING, PONG};
use ctrlwire_api::{Command, CommandKind, ConnectRequest, Connection, Connector, ErrorCode, Transport, TransportEvent};

use super::{SimulatedBackend, SimulatedModule, VariableChange};

/// Delay applied to every re-published variable change.
const DEFAULT_LATENCY_MS: RangeInclusive<u64> = 50..=150;

/// Opens [`MockTransport`]s against a shared backend.
#[derive(Debug, Clone)]
pub struct MockConnector {
    backend: Arc<SimulatedBackend>,
    latency_ms: RangeInclusive<u64>,
}

impl MockConnector {
    pub fn new(backend: Arc<SimulatedBackend>) -> Self {
        Self {
            backend,
            latency_ms: DEFAULT_LATENCY_MS,
        }
    }

    /// Override the notify latency window, in milliseconds.
    pub fn with_latency(mut self, latency_ms: RangeInclusive<u64>) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

impl Connector for MockConnector {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Connection, ctrlwire_api::Error>> {
        debug!(path = request.url.path(), "Opening simulated control channel");
        let (transport, events) = MockTransport::open(Arc::clone(&self.backend), self.latency_ms.clone());
        Box::pin(async move {
            Ok(Connection {
                transport: Box::new(transport),
                events,
            })
        })
    }
}

struct MockInner {
    backend: Arc<SimulatedBackend>,
    latency_ms: RangeInclusive<u64>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    bindings: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
}

/// Transport half backed by a [`SimulatedBackend`].
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("closed", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn success(id: u64, value: &Value) -> String {
    json!({ "type": "success", "id": id, "value": value }).to_string()
}

fn failure(id: u64, code: ErrorCode, msg: &str) -> String {
    json!({ "type": "error", "id": id, "code": code.as_i64(), "msg": msg }).to_string()
}

fn notify(command: &Command, value: &Value) -> String {
    json!({
        "type": "notify",
        "value": value,
        "meta": {
            "sys": command.sys,
            "mod": command.module,
            "index": command.index,
            "name": command.name,
        },
    })
    .to_string()
}

fn binding_key(command: &Command) -> String {
    format!("{}|{}_{}|{}", command.sys, command.module, command.index, command.name)
}

impl MockTransport {
    pub fn open(
        backend: Arc<SimulatedBackend>,
        latency_ms: RangeInclusive<u64>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(MockInner {
                backend,
                latency_ms,
                events: Mutex::new(Some(tx)),
                bindings: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
        };
        (transport, rx)
    }

    /// Number of live `bind` streams.
    pub fn binding_count(&self) -> usize {
        lock(&self.inner.bindings).len()
    }
}

impl MockInner {
    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn reply(&self, frame: String) {
        self.emit(TransportEvent::Message(frame));
    }

    fn handle(self: &Arc<Self>, frame: &str) {
        let raw: Value = match serde_json::from_str(frame) {
            Ok(raw) => raw,
            Err(e) => {
                self.reply(failure(0, ErrorCode::ParseError, &e.to_string()));
                return;
            }
        };
        let id = raw.get("id").and_then(Value::as_u64).unwrap_or(0);
        let command: Command = match serde_json::from_value(raw.clone()) {
            Ok(command) => command,
            Err(e) => {
                let unknown_verb = raw
                    .get("cmd")
                    .and_then(Value::as_str)
                    .is_some_and(|cmd| cmd.parse::<CommandKind>().is_err());
                let code = if unknown_verb {
                    ErrorCode::UnknownCmd
                } else {
                    ErrorCode::BadRequest
                };
                self.reply(failure(id, code, &e.to_string()));
                return;
            }
        };

        trace!(id, cmd = %command.cmd, key = %binding_key(&command), "Simulated command");
        let module = match self.backend.module(&command.sys, &command.module, command.index) {
            Ok(module) => module,
            Err(code) => {
                let msg = format!("{}_{} not found on {}", command.module, command.index, command.sys);
                self.reply(failure(id, code, &msg));
                return;
            }
        };

        match command.cmd {
            CommandKind::Bind => self.bind(&command, &module),
            CommandKind::Unbind => {
                if let Some(token) = lock(&self.bindings).remove(&binding_key(&command)) {
                    token.cancel();
                }
                self.reply(success(id, &Value::Null));
            }
            CommandKind::Exec => {
                let args = command.args.unwrap_or_default();
                match module.call(&command.name, args) {
                    Ok(value) => self.reply(success(id, &value)),
                    Err(msg) => self.reply(failure(id, ErrorCode::RequestFailed, &msg)),
                }
            }
            CommandKind::Debug | CommandKind::Ignore => self.reply(success(id, &Value::Null)),
        }
    }

    /// Acknowledge with the current value, push it as a notify, then stream
    /// later changes of the bound variable.
    fn bind(self: &Arc<Self>, command: &Command, module: &Arc<SimulatedModule>) {
        let key = binding_key(command);
        // Subscribe first so no change slips between the ack and the stream.
        let changes = module.subscribe();
        let current = module.get(&command.name);
        self.reply(success(command.id, &current));
        self.reply(notify(command, &current));

        let token = self.cancel.child_token();
        if let Some(previous) = lock(&self.bindings).insert(key, token.clone()) {
            previous.cancel();
        }

        let inner = Arc::clone(self);
        let command = command.clone();
        tokio::spawn(async move { inner.stream(command, changes, token).await });
    }

    async fn stream(
        self: Arc<Self>,
        command: Command,
        mut changes: broadcast::Receiver<VariableChange>,
        token: CancellationToken,
    ) {
        loop {
            let change = tokio::select! {
                biased;
                () = token.cancelled() => break,
                change = changes.recv() => change,
            };
            let change = match change {
                Ok(change) if change.name == command.name => change,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let delay = rand::thread_rng().gen_range(self.latency_ms.clone());
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                () = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
            self.reply(notify(&command, &change.value));
        }
        trace!(key = %binding_key(&command), "Simulated binding stream ended");
    }
}

impl Transport for MockTransport {
    fn send(&self, frame: String) -> Result<(), ctrlwire_api::Error> {
        if self.inner.cancel.is_cancelled() {
            return Err(ctrlwire_api::Error::TransportClosed);
        }
        if frame == PING {
            self.inner.emit(TransportEvent::Pong);
            return Ok(());
        }
        if frame == PONG {
            return Ok(());
        }
        self.inner.handle(&frame);
        Ok(())
    }

    fn close(&self) {
        self.inner.cancel.cancel();
        lock(&self.inner.bindings).clear();
        // Dropping the sender ends the event stream.
        lock(&self.inner.events).take();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::mock::{SimulatedSystem, demo_light};
    use ctrlwire_api::Inbound;

    fn open() -> (MockTransport, mpsc::UnboundedReceiver<TransportEvent>, Arc<SimulatedBackend>) {
        let backend = Arc::new(SimulatedBackend::new());
        backend.register("S", SimulatedSystem::new().with_module("Light", demo_light()));
        let (transport, events) = MockTransport::open(Arc::clone(&backend), 1..=2);
        (transport, events, backend)
    }

    async fn next_frame(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Inbound {
        match events.recv().await {
            Some(TransportEvent::Message(frame)) => serde_json::from_str(&frame).unwrap(),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    fn command(id: u64, cmd: &str, sys: &str, name: &str, args: Option<Value>) -> String {
        let mut frame = json!({ "id": id, "cmd": cmd, "sys": sys, "mod": "Light", "index": 1, "name": name });
        if let Some(args) = args {
            frame["args"] = args;
        }
        frame.to_string()
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let (transport, mut events, _) = open();
        transport.send(PING.to_owned()).unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Pong)));
    }

    #[tokio::test]
    async fn malformed_frames_are_rejected() {
        let (transport, mut events, _) = open();

        transport.send("{not json".to_owned()).unwrap();
        assert!(matches!(
            next_frame(&mut events).await,
            Inbound::Error { id: 0, code: 0, .. }
        ));

        transport.send(command(4, "dance", "S", "power", None)).unwrap();
        assert!(matches!(
            next_frame(&mut events).await,
            Inbound::Error { id: 4, code: 4, .. }
        ));
    }

    #[tokio::test]
    async fn missing_system_and_module() {
        let (transport, mut events, _) = open();

        transport.send(command(1, "exec", "nope", "toggle", None)).unwrap();
        assert!(matches!(
            next_frame(&mut events).await,
            Inbound::Error { id: 1, code: 5, .. }
        ));

        let frame = json!({ "id": 2, "cmd": "bind", "sys": "S", "mod": "Light", "index": 2, "name": "power" });
        transport.send(frame.to_string()).unwrap();
        assert!(matches!(
            next_frame(&mut events).await,
            Inbound::Error { id: 2, code: 6, .. }
        ));
    }

    #[tokio::test]
    async fn exec_results_and_failures() {
        let (transport, mut events, _) = open();

        transport
            .send(command(1, "exec", "S", "level", Some(json!([30]))))
            .unwrap();
        assert_eq!(
            next_frame(&mut events).await,
            Inbound::Success {
                id: 1,
                value: json!(30)
            }
        );

        transport
            .send(command(2, "exec", "S", "level", Some(json!(["high"]))))
            .unwrap();
        assert!(matches!(
            next_frame(&mut events).await,
            Inbound::Error { id: 2, code: 3, .. }
        ));
    }

    #[tokio::test]
    async fn bind_streams_until_unbind() {
        let (transport, mut events, backend) = open();
        let light = backend.module("S", "Light", 1).unwrap();

        transport.send(command(1, "bind", "S", "power", None)).unwrap();
        assert_eq!(
            next_frame(&mut events).await,
            Inbound::Success {
                id: 1,
                value: json!(false)
            }
        );
        assert!(matches!(next_frame(&mut events).await, Inbound::Notify { value, .. } if value == json!(false)));
        assert_eq!(transport.binding_count(), 1);

        light.set("level", json!(10));
        light.set("power", json!(true));
        match next_frame(&mut events).await {
            Inbound::Notify { value, meta } => {
                assert_eq!(value, json!(true));
                assert_eq!(meta.name, "power");
            }
            other => panic!("expected notify, got {other:?}"),
        }

        transport.send(command(2, "unbind", "S", "power", None)).unwrap();
        assert!(matches!(next_frame(&mut events).await, Inbound::Success { id: 2, .. }));
        assert_eq!(transport.binding_count(), 0);

        light.set("power", json!(false));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_ends_the_event_stream() {
        let (transport, mut events, _) = open();
        transport.close();
        assert!(events.recv().await.is_none());
        assert!(transport.send(PING.to_owned()).is_err());
    }
}
