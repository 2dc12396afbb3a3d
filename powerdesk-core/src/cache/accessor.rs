//! Per-key read/refresh controller with stale-while-revalidate semantics

use parking_lot::Mutex;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use super::fetcher::Fetcher;
use super::focus::FocusSignal;
use super::store::CacheStore;
use crate::clock::{bounded, deadline_after};
use crate::error::SyncError;

pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// Accessor configuration
pub struct AccessorOptions<T> {
    /// Absolute lifetime of a cached value
    pub ttl: Duration,
    /// Age after which a cached value is served but refreshed in the background.
    /// `None` means half of `ttl`.
    pub stale_time: Option<Duration>,
    pub enabled: bool,
    pub on_success: Option<SuccessCallback<T>>,
    pub on_error: Option<ErrorCallback>,
    pub refetch_on_window_focus: bool,
    pub focus: Option<FocusSignal>,
    pub refetch_interval: Option<Duration>,
}

impl<T> AccessorOptions<T> {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn refetch_on_focus(mut self, focus: &FocusSignal) -> Self {
        self.refetch_on_window_focus = true;
        self.focus = Some(focus.clone());
        self
    }

    pub fn refetch_interval(mut self, every: Duration) -> Self {
        self.refetch_interval = Some(every);
        self
    }

    pub fn effective_stale_time(&self) -> Duration {
        self.stale_time.unwrap_or(self.ttl / 2)
    }
}

impl<T> Default for AccessorOptions<T> {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            stale_time: None,
            enabled: true,
            on_success: None,
            on_error: None,
            refetch_on_window_focus: false,
            focus: None,
            refetch_interval: None,
        }
    }
}

impl<T> Clone for AccessorOptions<T> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            stale_time: self.stale_time,
            enabled: self.enabled,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            refetch_on_window_focus: self.refetch_on_window_focus,
            focus: self.focus.clone(),
            refetch_interval: self.refetch_interval,
        }
    }
}

impl<T> fmt::Debug for AccessorOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessorOptions")
            .field("ttl", &self.ttl)
            .field("stale_time", &self.effective_stale_time())
            .field("enabled", &self.enabled)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("refetch_interval", &self.refetch_interval)
            .finish()
    }
}

/// What a consumer renders from
#[derive(Debug, Clone, PartialEq)]
pub struct AccessorState<T> {
    pub data: Option<T>,
    /// A blocking fetch (initial load or `refetch`) is running
    pub is_loading: bool,
    /// Any fetch is running, blocking or background
    pub is_fetching: bool,
    pub is_error: bool,
    pub error: Option<SyncError>,
    pub is_stale: bool,
}

impl<T> Default for AccessorState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: false,
            is_fetching: false,
            is_error: false,
            error: None,
            is_stale: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    Blocking,
    Background,
}

/// Holds the single-flight flag for the duration of one fetch
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct AccessorInner<T> {
    key: String,
    store: CacheStore,
    fetcher: Arc<dyn Fetcher<T>>,
    options: AccessorOptions<T>,
    state: watch::Sender<AccessorState<T>>,
    fetching: AtomicBool,
    alive: AtomicBool,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> Drop for AccessorInner<T> {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().drain(..) {
            timer.abort();
        }
    }
}

/// Cache-aware access to one key for one consumer.
///
/// Clones share state, fetch guard and timers.
pub struct CacheAccessor<T> {
    inner: Arc<AccessorInner<T>>,
}

impl<T> Clone for CacheAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> CacheAccessor<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        key: impl Into<String>,
        store: CacheStore,
        fetcher: impl Fetcher<T> + 'static,
        options: AccessorOptions<T>,
    ) -> Self {
        let (state, _) = watch::channel(AccessorState::default());
        Self {
            inner: Arc::new(AccessorInner {
                key: key.into(),
                store,
                fetcher: Arc::new(fetcher),
                options,
                state,
                fetching: AtomicBool::new(false),
                alive: AtomicBool::new(true),
                timers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn state(&self) -> AccessorState<T> {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<AccessorState<T>> {
        self.inner.state.subscribe()
    }

    pub fn data(&self) -> Option<T> {
        self.inner.state.borrow().data.clone()
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.fetching.load(Ordering::Acquire)
    }

    /// Mount-equivalent: serve from cache, revalidate in the background when
    /// stale, or block on a fresh fetch when nothing is cached.
    pub async fn activate(&self) {
        let inner = &self.inner;
        if !inner.options.enabled {
            debug!("accessor {} disabled", inner.key);
            return;
        }
        inner.alive.store(true, Ordering::Release);
        self.start_timers();

        match inner.store.entry::<T>(&inner.key) {
            Some(entry) => {
                let is_stale = entry.age(inner.store.now()) > inner.options.effective_stale_time();
                debug!("cache hit {} (stale: {})", inner.key, is_stale);
                inner.state.send_modify(|state| {
                    state.data = Some(entry.value);
                    state.is_stale = is_stale;
                });
                if is_stale {
                    self.spawn_background_fetch();
                }
            }
            None => {
                debug!("cache miss {}", inner.key);
                self.run_fetch(FetchMode::Blocking).await;
            }
        }
    }

    /// Blocking fetch regardless of staleness. Returns `false` when another
    /// fetch was already in flight and this call did nothing.
    pub async fn refetch(&self) -> bool {
        self.run_fetch(FetchMode::Blocking).await
    }

    /// Drop the cached value and mark the state stale; does not fetch
    pub fn invalidate(&self) {
        self.inner.store.remove(&self.inner.key);
        self.inner.state.send_modify(|state| state.is_stale = true);
    }

    /// Stop timers and stop applying results of fetches still in flight
    pub fn deactivate(&self) {
        self.inner.alive.store(false, Ordering::Release);
        for timer in self.inner.timers.lock().drain(..) {
            timer.abort();
        }
        debug!("accessor {} deactivated", self.inner.key);
    }

    /// Whether the stored value (if any) is past its stale time
    pub fn is_entry_stale(&self) -> bool {
        let inner = &self.inner;
        match inner.store.entry::<T>(&inner.key) {
            Some(entry) => entry.age(inner.store.now()) > inner.options.effective_stale_time(),
            None => true,
        }
    }

    fn spawn_background_fetch(&self) {
        let accessor = self.clone();
        tokio::spawn(async move {
            accessor.run_fetch(FetchMode::Background).await;
        });
    }

    async fn run_fetch(&self, mode: FetchMode) -> bool {
        let inner = &self.inner;
        if !inner.alive.load(Ordering::Acquire) {
            return false;
        }
        let Some(_guard) = InFlight::acquire(&inner.fetching) else {
            debug!("fetch for {} already in flight", inner.key);
            return false;
        };

        inner.state.send_modify(|state| {
            state.is_fetching = true;
            if mode == FetchMode::Blocking {
                state.is_loading = true;
            }
        });

        let result = inner.fetcher.fetch().await;

        if !inner.alive.load(Ordering::Acquire) {
            debug!("discarding fetch result for deactivated accessor {}", inner.key);
            return true;
        }

        match result {
            Ok(value) => {
                inner
                    .store
                    .set(inner.key.clone(), value.clone(), inner.options.ttl);
                if let Some(callback) = &inner.options.on_success {
                    invoke_isolated(&inner.key, || callback(&value));
                }
                inner.state.send_modify(|state| {
                    state.data = Some(value);
                    state.is_loading = false;
                    state.is_fetching = false;
                    state.is_stale = false;
                    state.is_error = false;
                    state.error = None;
                });
            }
            Err(err) => {
                let error = SyncError::fetch(&inner.key, &err);
                warn!("{:?} fetch failed: {}", mode, error);
                if let Some(callback) = &inner.options.on_error {
                    invoke_isolated(&inner.key, || callback(&error));
                }
                // Previously cached data stays in place
                inner.state.send_modify(|state| {
                    state.is_loading = false;
                    state.is_fetching = false;
                    state.is_error = true;
                    state.error = Some(error);
                });
            }
        }
        true
    }

    fn start_timers(&self) {
        let mut timers = self.inner.timers.lock();
        if !timers.is_empty() {
            return;
        }
        let options = &self.inner.options;

        if let (true, Some(focus)) = (options.refetch_on_window_focus, &options.focus) {
            timers.push(spawn_focus_listener(
                Arc::downgrade(&self.inner),
                focus.subscribe(),
            ));
        }
        if let Some(every) = options.refetch_interval {
            timers.push(spawn_interval_refetch(Arc::downgrade(&self.inner), every));
        }
    }
}

fn spawn_focus_listener<T>(
    weak: Weak<AccessorInner<T>>,
    mut focus: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            match focus.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
            let Some(inner) = weak.upgrade() else { break };
            let accessor = CacheAccessor { inner };
            if accessor.is_entry_stale() {
                debug!("focus refetch {}", accessor.key());
                accessor.run_fetch(FetchMode::Background).await;
            }
        }
    })
}

fn spawn_interval_refetch<T>(weak: Weak<AccessorInner<T>>, every: Duration) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let every = bounded(every.max(Duration::from_millis(1)));
        let mut ticker = interval_at(deadline_after(Instant::now(), every), every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            CacheAccessor { inner }.run_fetch(FetchMode::Background).await;
        }
    })
}

fn invoke_isolated(key: &str, callback: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("callback for {} panicked", key);
    }
}
