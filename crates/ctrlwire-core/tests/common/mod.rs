// Shared fixtures for ctrlwire-core integration tests.
#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use ctrlwire_api::{Authority, Command, ConnectRequest, Connection, Connector, Transport, TransportEvent};
use ctrlwire_core::auth::Navigator;
use ctrlwire_core::{AuthError, CredentialSource, Dispatch};

/// Ordered record of interesting calls across fakes.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(log: &CallLog, entry: &str) {
    log.lock().unwrap().push(entry.to_owned());
}

// ── Scripted connector ──────────────────────────────────────────────

/// Server end of one scripted connection.
pub struct ServerSide {
    pub request: ConnectRequest,
    events: mpsc::UnboundedSender<TransportEvent>,
    frames: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl ServerSide {
    /// Next frame the client wrote, pings included.
    pub async fn next_raw(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client transport dropped")
    }

    /// Next frame the client wrote, keep-alive pings excluded.
    pub async fn next_frame(&mut self) -> String {
        loop {
            let frame = self.next_raw().await;
            if frame != "ping" {
                return frame;
            }
        }
    }

    pub async fn next_command(&mut self) -> Command {
        serde_json::from_str(&self.next_frame().await).unwrap()
    }

    /// Non-ping frames already written, without waiting.
    pub fn drain_frames(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            if frame != "ping" {
                frames.push(frame);
            }
        }
        frames
    }

    pub fn push(&self, frame: &Value) {
        let _ = self.events.send(TransportEvent::Message(frame.to_string()));
    }

    pub fn pong(&self) {
        let _ = self.events.send(TransportEvent::Pong);
    }

    pub fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed {
            code: Some(1006),
            reason: "gone".into(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedTransport {
    frames: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl Transport for ScriptedTransport {
    fn send(&self, frame: String) -> Result<(), ctrlwire_api::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ctrlwire_api::Error::TransportClosed);
        }
        self.frames
            .send(frame)
            .map_err(|_| ctrlwire_api::Error::TransportClosed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector whose connections are driven by the test.
pub struct ScriptedConnector {
    failures: Mutex<VecDeque<ctrlwire_api::Error>>,
    attempts: AtomicU32,
    servers: mpsc::UnboundedSender<ServerSide>,
    log: CallLog,
}

impl ScriptedConnector {
    pub fn new(log: CallLog) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicU32::new(0),
            servers,
            log,
        });
        (connector, rx)
    }

    /// Make the next connect attempt fail with `error`.
    pub fn fail_next(&self, error: ctrlwire_api::Error) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Connection, ctrlwire_api::Error>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        record(&self.log, "connect");
        let failure = self.failures.lock().unwrap().pop_front();
        let result = match failure {
            Some(error) => Err(error),
            None => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let (frames_tx, frames_rx) = mpsc::unbounded_channel();
                let closed = Arc::new(AtomicBool::new(false));
                let _ = self.servers.send(ServerSide {
                    request,
                    events: events_tx,
                    frames: frames_rx,
                    closed: Arc::clone(&closed),
                });
                Ok(Connection {
                    transport: Box::new(ScriptedTransport {
                        frames: frames_tx,
                        closed,
                    }),
                    events: events_rx,
                })
            }
        };
        async move { result }.boxed()
    }
}

pub fn unauthorized() -> ctrlwire_api::Error {
    ctrlwire_api::Error::WebSocketConnect {
        message: "HTTP error: 401 Unauthorized".into(),
        status: Some(401),
    }
}

// ── Fake credentials ────────────────────────────────────────────────

/// Always-ready credentials that record invalidations and refreshes.
pub struct FakeCredentials {
    pub log: CallLog,
    pub authority: Arc<Authority>,
}

impl FakeCredentials {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            authority: Arc::new(Authority {
                version: "2.0.0".into(),
                ..Authority::default()
            }),
        })
    }

    pub fn count(&self, entry: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

impl CredentialSource for FakeCredentials {
    fn token(&self) -> String {
        "tok".into()
    }

    fn authority(&self) -> Option<Arc<Authority>> {
        Some(Arc::clone(&self.authority))
    }

    fn host(&self) -> Option<Url> {
        Some(Url::parse("https://bms.test").unwrap())
    }

    fn is_mock(&self) -> bool {
        false
    }

    fn authorise(&self) -> BoxFuture<'static, Result<String, AuthError>> {
        async { Ok("tok".to_owned()) }.boxed()
    }

    fn invalidate_token(&self) {
        record(&self.log, "invalidate");
    }

    fn refresh_authority(&self) -> BoxFuture<'static, Result<Arc<Authority>, AuthError>> {
        record(&self.log, "refresh");
        let authority = Arc::clone(&self.authority);
        async move { Ok(authority) }.boxed()
    }
}

/// Credentials that never become usable: no token, no authority.
pub struct PendingCredentials {
    pub log: CallLog,
}

impl PendingCredentials {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self { log })
    }

    pub fn count(&self, entry: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

impl CredentialSource for PendingCredentials {
    fn token(&self) -> String {
        String::new()
    }

    fn authority(&self) -> Option<Arc<Authority>> {
        None
    }

    fn host(&self) -> Option<Url> {
        Some(Url::parse("https://bms.test").unwrap())
    }

    fn is_mock(&self) -> bool {
        false
    }

    fn authorise(&self) -> BoxFuture<'static, Result<String, AuthError>> {
        record(&self.log, "authorise");
        async {
            Err(AuthError::LoginRequired {
                login_url: "https://bms.test/login".into(),
            })
        }
        .boxed()
    }

    fn invalidate_token(&self) {
        record(&self.log, "invalidate");
    }

    fn refresh_authority(&self) -> BoxFuture<'static, Result<Arc<Authority>, AuthError>> {
        record(&self.log, "refresh");
        async { Err(AuthError::AuthorityNotLoaded) }.boxed()
    }
}

// ── Dispatch and navigation ─────────────────────────────────────────

#[derive(Default)]
pub struct RecordingDispatch {
    pub frames: Mutex<Vec<String>>,
}

impl RecordingDispatch {
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }
}

impl Dispatch for RecordingDispatch {
    fn dispatch(&self, frame: &str) {
        self.frames.lock().unwrap().push(frame.to_owned());
    }
}

/// Records navigations and reloads; silent authorization is unsupported.
#[derive(Default)]
pub struct RecordingNavigator {
    pub visited: Mutex<Vec<Url>>,
    pub reloads: AtomicU32,
}

impl RecordingNavigator {
    pub fn last_visit(&self) -> Option<Url> {
        self.visited.lock().unwrap().last().cloned()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, url: &Url) {
        self.visited.lock().unwrap().push(url.clone());
    }

    fn authorize_silently(&self, authorize_url: Url) -> BoxFuture<'static, Result<Url, AuthError>> {
        let login_url = authorize_url.to_string();
        async move { Err(AuthError::LoginRequired { login_url }) }.boxed()
    }

    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}
