// ── Binding registry ──
//
// Latest value plus a multicast stream per (system, module instance,
// variable) key. Entries are created lazily by listen/bind/notify and live
// for the life of the registry, so subscriptions stay valid across
// reconnects and rebinds. Debug log lines from modules travel on a separate
// broadcast channel.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use ctrlwire_api::protocol::NotifyMeta;

const BINDING_CHANNEL_CAPACITY: usize = 256;
const DEBUG_CHANNEL_CAPACITY: usize = 1024;

// ── Keys ────────────────────────────────────────────────────────────

/// Addresses one variable of one module instance on one system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingKey {
    pub system: String,
    pub module: String,
    /// 1-based instance index.
    pub index: u32,
    pub name: String,
}

impl BindingKey {
    pub fn new(
        system: impl Into<String>,
        module: impl Into<String>,
        index: u32,
        name: impl Into<String>,
    ) -> Self {
        Self {
            system: system.into(),
            module: module.into(),
            index,
            name: name.into(),
        }
    }
}

/// `system|module_index|name`
impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}_{}|{}", self.system, self.module, self.index, self.name)
    }
}

impl From<&NotifyMeta> for BindingKey {
    fn from(meta: &NotifyMeta) -> Self {
        Self::new(&meta.sys, &meta.module, meta.index, &meta.name)
    }
}

// ── Debug events ────────────────────────────────────────────────────

/// A log line from a module under `debug`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEvent {
    /// Module id on the platform.
    pub mod_id: String,
    /// Module name and index, e.g. `Display_1`.
    pub module: String,
    pub class_name: String,
    pub message: String,
    pub level: String,
    pub time: DateTime<Utc>,
}

// ── Registry ────────────────────────────────────────────────────────

struct Entry {
    value: RwLock<Value>,
    tx: broadcast::Sender<Value>,
}

impl Entry {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BINDING_CHANNEL_CAPACITY);
        Self {
            value: RwLock::new(Value::Null),
            tx,
        }
    }

    fn current(&self) -> Value {
        self.value.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Owned map of binding entries.
pub struct BindingRegistry {
    entries: DashMap<String, Arc<Entry>>,
    debug_tx: broadcast::Sender<DebugEvent>,
}

impl Default for BindingRegistry {
    fn default() -> Self {
        let (debug_tx, _) = broadcast::channel(DEBUG_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            debug_tx,
        }
    }
}

impl fmt::Debug for BindingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingRegistry")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &BindingKey) -> Arc<Entry> {
        Arc::clone(
            self.entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Entry::new()))
                .value(),
        )
    }

    /// Subscribe to `key`, creating its entry (value `null`) if needed.
    pub fn listen(&self, key: &BindingKey) -> BindingStream {
        let entry = self.entry(key);
        // Subscribe before reading so no update falls between the two.
        let receiver = entry.tx.subscribe();
        BindingStream {
            current: entry.current(),
            receiver,
        }
    }

    /// Last known value, or `None` when the key was never seen.
    pub fn value(&self, key: &BindingKey) -> Option<Value> {
        self.entries.get(&key.to_string()).map(|entry| entry.current())
    }

    /// Record a new value for `key` and publish it.
    ///
    /// String payloads holding JSON are decoded; anything else is kept as is.
    pub fn notify(&self, key: &BindingKey, raw: Value) {
        let value = decode_value(raw);
        let entry = self.entry(key);
        let mut current = entry.value.write().unwrap_or_else(PoisonError::into_inner);
        current.clone_from(&value);
        // No receivers is fine; the value is still recorded.
        let _ = entry.tx.send(value);
    }

    pub fn contains(&self, key: &BindingKey) -> bool {
        self.entries.contains_key(&key.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ── Debug channel ───────────────────────────────────────────────

    pub fn emit_debug(&self, event: DebugEvent) {
        let _ = self.debug_tx.send(event);
    }

    pub fn debug_events(&self) -> broadcast::Receiver<DebugEvent> {
        self.debug_tx.subscribe()
    }
}

fn decode_value(raw: Value) -> Value {
    match raw {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

// ── Streams ─────────────────────────────────────────────────────────

/// A subscription to one binding.
///
/// `current()` is the value when the subscription was taken; `changed()`
/// yields every later value in arrival order.
#[derive(Debug)]
pub struct BindingStream {
    current: Value,
    receiver: broadcast::Receiver<Value>,
}

impl BindingStream {
    pub fn current(&self) -> &Value {
        &self.current
    }

    /// Wait for the next value. Returns `None` once the registry is gone.
    ///
    /// A slow subscriber that lags behind skips to the oldest retained value.
    pub async fn changed(&mut self) -> Option<Value> {
        loop {
            match self.receiver.recv().await {
                Ok(value) => {
                    self.current.clone_from(&value);
                    return Some(value);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Binding subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a `Stream` of values.
    pub fn into_stream(self) -> BindingValueStream {
        BindingValueStream {
            inner: BroadcastStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter over a binding subscription. Lag gaps are skipped.
pub struct BindingValueStream {
    inner: BroadcastStream<Value>,
}

impl Stream for BindingValueStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(value))) => return Poll::Ready(Some(value)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => {}
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn key() -> BindingKey {
        BindingKey::new("sys-1", "Display", 1, "power")
    }

    #[test]
    fn key_format() {
        assert_eq!(key().to_string(), "sys-1|Display_1|power");
    }

    #[test]
    fn value_is_none_until_seen() {
        let registry = BindingRegistry::new();
        assert_eq!(registry.value(&key()), None);

        let stream = registry.listen(&key());
        assert_eq!(stream.current(), &Value::Null);
        assert_eq!(registry.value(&key()), Some(Value::Null));
    }

    #[test]
    fn string_values_are_json_decoded() {
        let registry = BindingRegistry::new();
        registry.notify(&key(), json!("{\"level\":40}"));
        assert_eq!(registry.value(&key()), Some(json!({ "level": 40 })));

        registry.notify(&key(), json!("not json"));
        assert_eq!(registry.value(&key()), Some(json!("not json")));

        registry.notify(&key(), json!(true));
        assert_eq!(registry.value(&key()), Some(json!(true)));
    }

    #[tokio::test]
    async fn subscribers_see_values_in_order() {
        let registry = BindingRegistry::new();
        let mut stream = registry.listen(&key());
        let late = registry.listen(&key()).into_stream();

        for n in 1..=5 {
            registry.notify(&key(), json!(n));
        }

        for n in 1..=5 {
            assert_eq!(stream.changed().await, Some(json!(n)));
        }
        assert_eq!(stream.current(), &json!(5));
        assert_eq!(registry.value(&key()), Some(json!(5)));

        let seen: Vec<_> = late.take(5).collect().await;
        assert_eq!(seen, (1..=5).map(|n| json!(n)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn debug_events_are_broadcast() {
        let registry = BindingRegistry::new();
        let mut rx = registry.debug_events();
        registry.emit_debug(DebugEvent {
            mod_id: "mod-1".into(),
            module: "Display_1".into(),
            class_name: "Display::Projector".into(),
            message: "power on".into(),
            level: "info".into(),
            time: Utc::now(),
        });
        assert_eq!(rx.recv().await.unwrap().message, "power on");
    }
}
