//! Keyed, expiring value store shared by every accessor
//!
//! Keys follow a colon-delimited namespace (`market:summary:nordpool`,
//! `user:profile`) so whole domains can be dropped with [`CacheStore::clear`].
//! Expired entries are evicted lazily when read; [`CacheStore::spawn_sweeper`]
//! adds an opt-in periodic sweep for long-running sessions.

use dashmap::DashMap;
use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::clock::{bounded, deadline_after, Clock, TokioClock};

/// Shortest lifetime an entry can have, keeps `expires_at > written_at`
const MIN_TTL: Duration = Duration::from_millis(1);

/// Cached value with its write and expiry instants
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub written_at: Instant,
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.written_at)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

struct StoredEntry {
    value: Arc<dyn Any + Send + Sync>,
    written_at: Instant,
    expires_at: Instant,
}

struct StoreInner {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
}

/// Cloneable handle; clones share the same table
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TokioClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                clock,
            }),
        }
    }

    pub fn now(&self) -> Instant {
        self.inner.clock.now()
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry
    pub fn set<T>(&self, key: impl Into<String>, value: T, ttl: Duration)
    where
        T: Send + Sync + 'static,
    {
        let now = self.now();
        let key = key.into();
        debug!("cache set {} (ttl {:?})", key, ttl);
        self.inner.entries.insert(
            key,
            StoredEntry {
                value: Arc::new(value),
                written_at: now,
                expires_at: deadline_after(now, ttl.max(MIN_TTL)),
            },
        );
    }

    /// Live value for `key`, evicting it first if it has expired
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entry::<T>(key).map(|entry| entry.value)
    }

    /// Like [`CacheStore::get`] but keeps the timestamps
    pub fn entry<T>(&self, key: &str) -> Option<CacheEntry<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let now = self.now();
        match self.inner.entries.get(key) {
            Some(stored) if now <= stored.expires_at => {
                // A value of another type under this key reads as a miss
                return stored.value.downcast_ref::<T>().map(|value| CacheEntry {
                    value: value.clone(),
                    written_at: stored.written_at,
                    expires_at: stored.expires_at,
                });
            }
            Some(_) => {}
            None => return None,
        }

        self.evict_if_expired(key, now);
        None
    }

    pub fn has(&self, key: &str) -> bool {
        let now = self.now();
        let live = match self.inner.entries.get(key) {
            Some(stored) => now <= stored.expires_at,
            None => return false,
        };
        if !live {
            self.evict_if_expired(key, now);
        }
        live
    }

    pub fn remove(&self, key: &str) {
        self.inner.entries.remove(key);
    }

    /// Drop every entry, or only those whose key starts with `prefix`.
    /// Returns how many entries were dropped.
    pub fn clear(&self, prefix: Option<&str>) -> usize {
        let before = self.inner.entries.len();
        match prefix {
            Some(prefix) => self.inner.entries.retain(|key, _| !key.starts_with(prefix)),
            None => self.inner.entries.clear(),
        }
        let dropped = before.saturating_sub(self.inner.entries.len());
        debug!("cache clear {:?}: dropped {} entries", prefix, dropped);
        dropped
    }

    /// Evict every expired entry now. Returns how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = self.now();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, stored| now <= stored.expires_at);
        before.saturating_sub(self.inner.entries.len())
    }

    /// Periodically purge expired entries until the store is dropped
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let every = bounded(every.max(MIN_TTL));
            let mut ticker = tokio::time::interval_at(deadline_after(Instant::now(), every), every);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let store = CacheStore { inner };
                let evicted = store.purge_expired();
                if evicted > 0 {
                    debug!("cache sweep evicted {} entries", evicted);
                }
            }
        })
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.iter().map(|e| e.key().clone()).collect()
    }

    fn evict_if_expired(&self, key: &str, now: Instant) {
        // Re-check under the shard lock so a concurrent `set` is not lost
        if self
            .inner
            .entries
            .remove_if(key, |_, stored| now > stored.expires_at)
            .is_some()
        {
            debug!("cache evicted expired {}", key);
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}
