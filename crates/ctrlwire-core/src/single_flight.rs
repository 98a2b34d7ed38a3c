// ── Single-flight coalescing ──
//
// Concurrent callers asking for the same keyed operation share one in-flight
// future and all observe its result. Each flight is driven by its own task,
// so it runs to completion even when every caller stops waiting. The entry
// is removed when the future completes, so the next call after completion
// starts a fresh flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

/// A shareable handle to an in-flight operation.
pub type Flight<T> = Shared<BoxFuture<'static, T>>;

struct Slot<T: Clone> {
    id: u64,
    flight: Flight<T>,
}

/// Keyed map of in-flight operations.
pub struct SingleFlight<T: Clone> {
    flights: Arc<Mutex<HashMap<&'static str, Slot<T>>>>,
    next_id: AtomicU64,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Clone> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<_> = lock(&self.flights).keys().copied().collect();
        f.debug_struct("SingleFlight").field("in_flight", &keys).finish()
    }
}

fn lock<K>(mutex: &Mutex<K>) -> MutexGuard<'_, K> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, or start one from `make` if none is running.
    ///
    /// `make` is only invoked when a new flight starts. Must be called from
    /// within a Tokio runtime.
    pub fn run<F, Fut>(&self, key: &'static str, make: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut flights = lock(&self.flights);
        if let Some(slot) = flights.get(key) {
            tracing::trace!(key, "Joining in-flight operation");
            return slot.flight.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.flights);
        let work = make();
        let flight = async move {
            let out = work.await;
            let mut flights = lock(&registry);
            if flights.get(key).is_some_and(|slot| slot.id == id) {
                flights.remove(key);
            }
            out
        }
        .boxed()
        .shared();

        flights.insert(
            key,
            Slot {
                id,
                flight: flight.clone(),
            },
        );
        drop(flights);
        tokio::spawn(flight.clone());
        flight
    }

    /// Whether an operation for `key` is currently running.
    pub fn in_flight(&self, key: &str) -> bool {
        lock(&self.flights).contains_key(key)
    }
}
