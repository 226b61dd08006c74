//! Keyed deduplication of identical concurrent requests.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, Shared, WeakShared};
use futures_util::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::screening::ScreeningRequest;

/// Logical identity of a proxied request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKey {
    /// Single-symbol research, keyed by the uppercased symbol.
    Research(String),
    /// Screening submission, keyed by everything forwarded upstream.
    Screening {
        user_email: String,
        batch_size: u32,
        screening_type: String,
        sector: String,
        market_cap: String,
        start_index: Option<u32>,
        /// Extra forwarded fields as canonical (key-sorted) JSON.
        extra: String,
    },
}

impl RequestKey {
    pub fn research(symbol: &str) -> Self {
        RequestKey::Research(symbol.trim().to_uppercase())
    }

    pub fn screening(request: &ScreeningRequest) -> Self {
        RequestKey::Screening {
            user_email: request.user_email.trim().to_lowercase(),
            batch_size: request.batch_size,
            screening_type: request.screening_type.clone(),
            sector: request.sector.clone(),
            market_cap: request.market_cap.clone(),
            start_index: request.start_index,
            extra: Value::Object(request.extra.clone()).to_string(),
        }
    }
}

/// Entries hold weak handles: once every caller has gone away the future is
/// dropped, and its guard clears the entry.
struct Entry<V> {
    id: u64,
    future: WeakShared<BoxFuture<'static, V>>,
}

type Pending<K, V> = Arc<Mutex<HashMap<K, Entry<V>>>>;

fn lock<K, V>(pending: &Pending<K, V>) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its entry when the request finishes, is abandoned, or panics.
struct EntryGuard<K: Eq + Hash, V> {
    pending: Pending<K, V>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, V> Drop for EntryGuard<K, V> {
    fn drop(&mut self) {
        let mut pending = lock(&self.pending);
        if pending.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            pending.remove(&self.key);
        }
    }
}

/// Map of in-flight futures; a caller arriving while a request with the same
/// key is running awaits that request instead of starting another.
pub struct InFlight<K, V> {
    pending: Pending<K, V>,
    next_id: AtomicU64,
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Await the request for `key`, starting `fut` only if none is running.
    ///
    /// The entry is removed once the shared future resolves, whatever the
    /// value, so the next call after completion always starts fresh. It is
    /// also removed when every caller drops out before completion.
    pub async fn run<F>(&self, key: K, fut: F) -> V
    where
        F: Future<Output = V> + Send + 'static,
    {
        let shared = {
            let mut pending = lock(&self.pending);
            match pending.get(&key).and_then(|entry| entry.future.upgrade()) {
                Some(existing) => {
                    debug!("Joining in-flight request {:?}", key);
                    existing
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let guard = EntryGuard {
                        pending: Arc::clone(&self.pending),
                        key: key.clone(),
                        id,
                    };
                    let shared = async move {
                        let _guard = guard;
                        fut.await
                    }
                    .boxed()
                    .shared();
                    if let Some(future) = shared.downgrade() {
                        pending.insert(key, Entry { id, future });
                    }
                    shared
                }
            }
        };

        shared.await
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for InFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
