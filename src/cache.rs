//! Resolved-address cache with TTL-based expiration.

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

struct CacheEntry {
    addresses: Vec<String>,
    created: Instant,
}

struct Store {
    entries: RwLock<FxHashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl Store {
    fn clean_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.created) <= self.ttl);
        before - entries.len()
    }
}

/// Cache of resolved address lists keyed by domain.
///
/// Entries expire a fixed `ttl` after insertion. A background task sweeps
/// expired entries every `cleanup_interval` until [`ResolveCache::stop`] is
/// called or the cache is dropped; lookups never return expired entries
/// even before the sweep gets to them.
pub struct ResolveCache {
    store: Arc<Store>,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl ResolveCache {
    /// Create the cache and start its sweep task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(ttl: Duration, cleanup_interval: Duration) -> Self {
        let store = Arc::new(Store {
            entries: RwLock::new(FxHashMap::default()),
            ttl,
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(sweep_loop(store.clone(), cleanup_interval, stop_rx));

        Self {
            store,
            stop_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Look up a live entry. Expired entries read as absent.
    pub fn get(&self, domain: &str) -> Option<Vec<String>> {
        let Ok(entries) = self.store.entries.read() else {
            return None;
        };
        let entry = entries.get(domain)?;
        if entry.created.elapsed() > self.store.ttl {
            return None;
        }
        Some(entry.addresses.clone())
    }

    /// Insert or overwrite an entry with a fresh timestamp.
    ///
    /// An empty address list is a valid cacheable result, distinct from no
    /// entry at all.
    pub fn set(&self, domain: &str, addresses: Vec<String>) {
        let Ok(mut entries) = self.store.entries.write() else {
            return;
        };
        entries.insert(
            domain.to_owned(),
            CacheEntry {
                addresses,
                created: Instant::now(),
            },
        );
    }

    /// Drop every entry older than the TTL, returning how many were removed.
    pub fn clean_expired(&self) -> usize {
        self.store.clean_expired()
    }

    pub fn len(&self) -> usize {
        self.store.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.store.entries.write() {
            entries.clear();
        }
    }

    pub fn ttl(&self) -> Duration {
        self.store.ttl
    }

    /// Stop the background sweep without blocking.
    ///
    /// `get` and `set` keep working afterwards; only the periodic sweep
    /// ends. An in-progress sweep pass is allowed to finish.
    ///
    /// # Panics
    ///
    /// Panics when called a second time: stopping a stopped cache is a bug
    /// in the caller.
    pub fn stop(&self) {
        let already = self.stopped.swap(true, Ordering::SeqCst);
        assert!(!already, "resolve cache sweep stopped twice");
        let _ = self.stop_tx.send(true);
    }
}

async fn sweep_loop(store: Arc<Store>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = store.clean_expired();
                if removed > 0 {
                    debug!(removed, "swept expired cache entries");
                }
            }
            // Fires on stop() and on cache drop alike.
            _ = stop.changed() => return,
        }
    }
}
