//! Consumer-facing sync sessions.
//!
//! One `SyncSession` per (kind, scope) consumer: an explicit object owning
//! its snapshot, watch lifecycle and background tasks, handed around by
//! reference instead of living in module-global state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use skopos_client::RemoteClient;
use skopos_core::{
    FetchOutcome, KindSpec, ResourceItem, ScopeFailure, ScopeKey, ScopeSelector, Snapshot,
    SyncError, WatchState,
};
use skopos_store::{SnapshotBuilder, SnapshotCache};

use crate::fetch::{fetch_scope, DEFAULT_FETCH_CONCURRENCY};
use crate::watch::WatchCtl;
use crate::{coordinator, poll};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Recognized per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Drive periodic re-fetch while no watch is active.
    pub auto_refresh: bool,
    /// Poll period; `None` falls back to the kind's override or the 30s
    /// default.
    pub refresh_interval: Option<Duration>,
    /// Force the session onto a single namespace regardless of the selector
    /// passed to `open`.
    pub namespace_override: Option<String>,
    /// Start the watch automatically for watchable kinds.
    pub auto_watch: bool,
    /// Fan-out worker pool bound for multi-namespace fetches.
    pub fetch_concurrency: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            refresh_interval: None,
            namespace_override: None,
            auto_watch: true,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }
}

/// The session's current scope, kept alongside its canonical key so every
/// component agrees on fetch identity.
#[derive(Debug, Clone)]
pub(crate) struct SessionScope {
    pub(crate) selector: ScopeSelector,
    pub(crate) key: ScopeKey,
}

pub(crate) struct SessionShared {
    pub(crate) client: Arc<dyn RemoteClient>,
    pub(crate) cache: Arc<SnapshotCache>,
    pub(crate) kind: KindSpec,
    pub(crate) opts: SessionOptions,
    pub(crate) scope_tx: watch::Sender<SessionScope>,
    /// Monotonic fetch generation: results stamped with a superseded
    /// generation are discarded, never applied.
    pub(crate) generation: AtomicU64,
    pub(crate) snapshot: ArcSwap<Snapshot>,
    pub(crate) epoch_tx: watch::Sender<u64>,
    pub(crate) loading: AtomicBool,
    pub(crate) error: Mutex<Option<SyncError>>,
    pub(crate) partial_failures: Mutex<Vec<ScopeFailure>>,
    pub(crate) watch: WatchCtl,
}

impl SessionShared {
    pub(crate) fn current_scope(&self) -> SessionScope {
        self.scope_tx.borrow().clone()
    }

    pub(crate) fn set_error(&self, err: SyncError) {
        *self.error.lock().unwrap() = Some(err);
    }

    pub(crate) fn poll_period(&self) -> Duration {
        self.opts
            .refresh_interval
            .or(self.kind.poll_interval)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL)
    }

    /// Atomically publish `snap` as the current snapshot and mirror it into
    /// the scope cache.
    pub(crate) fn store_snapshot(&self, key: &ScopeKey, snap: Arc<Snapshot>) {
        let epoch = snap.epoch;
        self.cache.set(key.clone(), Arc::clone(&snap));
        self.snapshot.store(snap);
        let _ = self.epoch_tx.send(epoch);
    }

    /// One generation-guarded fetch of the current scope.
    pub(crate) async fn refresh_once(&self) {
        let gen = self.generation.load(Ordering::SeqCst);
        let scope = self.current_scope();
        self.loading.store(true, Ordering::SeqCst);
        let t0 = Instant::now();
        let outcome =
            fetch_scope(&self.client, &self.kind, &scope.selector, self.opts.fetch_concurrency)
                .await;
        if self.generation.load(Ordering::SeqCst) != gen {
            metrics::counter!("fetch_discarded_stale_total", 1u64);
            debug!(scope = %scope.key, "fetch superseded; discarding result");
            return;
        }
        match outcome {
            FetchOutcome::Success(items) => {
                let n = items.len();
                self.apply_listing(&scope.key, items);
                self.partial_failures.lock().unwrap().clear();
                *self.error.lock().unwrap() = None;
                info!(scope = %scope.key, items = n, took_ms = %t0.elapsed().as_millis(), "fetch ok");
            }
            FetchOutcome::Partial(items, failures) => {
                let n = items.len();
                self.apply_listing(&scope.key, items);
                warn!(scope = %scope.key, items = n, failed = failures.len(), took_ms = %t0.elapsed().as_millis(), "fetch partially failed");
                *self.partial_failures.lock().unwrap() = failures;
                *self.error.lock().unwrap() = None;
            }
            FetchOutcome::Failure(err) => {
                warn!(scope = %scope.key, error = %err, took_ms = %t0.elapsed().as_millis(), "fetch failed");
                self.set_error(err);
            }
        }
        self.loading.store(false, Ordering::SeqCst);
    }

    fn apply_listing(&self, key: &ScopeKey, items: Vec<ResourceItem>) {
        let cur = self.snapshot.load_full();
        let mut b = SnapshotBuilder::from_snapshot(&cur);
        b.replace(items);
        self.store_snapshot(key, b.freeze());
    }
}

/// A live sync session for one resource kind and scope.
pub struct SyncSession {
    shared: Arc<SessionShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncSession {
    /// Open a session: prime `data` synchronously from the cache, kick a
    /// fetch, start the watch for watchable kinds, spawn the poller.
    pub fn open(
        client: Arc<dyn RemoteClient>,
        cache: Arc<SnapshotCache>,
        kind: KindSpec,
        selector: ScopeSelector,
        opts: SessionOptions,
    ) -> Self {
        let selector = match &opts.namespace_override {
            Some(ns) => ScopeSelector::SingleNamespace(ns.clone()),
            None => selector,
        };
        let key = ScopeKey::new(&kind, &selector);
        let primed = cache.get(&key).map(|s| (*s).clone()).unwrap_or_default();
        info!(scope = %key, primed = primed.items.len(), "opening sync session");

        let want_watch = kind.watchable && opts.auto_watch;
        let (scope_tx, scope_rx) = watch::channel(SessionScope { selector, key });
        let (epoch_tx, _) = watch::channel(primed.epoch);
        let shared = Arc::new(SessionShared {
            client,
            cache,
            kind,
            opts,
            scope_tx,
            generation: AtomicU64::new(0),
            snapshot: ArcSwap::from_pointee(primed),
            epoch_tx,
            loading: AtomicBool::new(true),
            error: Mutex::new(None),
            partial_failures: Mutex::new(Vec::new()),
            watch: WatchCtl::new(want_watch),
        });

        let mut tasks = Vec::new();
        {
            // Initial fetch; generation-guarded, so no need to track it.
            let s = Arc::clone(&shared);
            tokio::spawn(async move { s.refresh_once().await });
        }
        if want_watch {
            let s = Arc::clone(&shared);
            tasks.push(tokio::spawn(async move {
                let _ = s.watch.start(&s).await;
            }));
        }
        {
            let s = Arc::clone(&shared);
            let state_rx = shared.watch.subscribe_state();
            tasks.push(tokio::spawn(coordinator::run(s, scope_rx, state_rx)));
        }
        {
            let s = Arc::clone(&shared);
            tasks.push(tokio::spawn(poll::run(s)));
        }
        Self { shared, tasks: Mutex::new(tasks) }
    }

    /// Current snapshot contents.
    pub fn data(&self) -> Vec<ResourceItem> {
        self.shared.snapshot.load().items.clone()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.shared.snapshot.load_full()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.loading.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<SyncError> {
        self.shared.error.lock().unwrap().clone()
    }

    /// Failures from the latest partial fan-out, kept for diagnostics.
    pub fn partial_failures(&self) -> Vec<ScopeFailure> {
        self.shared.partial_failures.lock().unwrap().clone()
    }

    pub fn is_watching(&self) -> bool {
        self.shared.watch.state() == WatchState::Active
    }

    pub fn watch_state(&self) -> WatchState {
        self.shared.watch.state()
    }

    pub fn scope_key(&self) -> ScopeKey {
        self.shared.current_scope().key
    }

    /// Snapshot-epoch notifications, one send per published snapshot.
    pub fn epoch_stream(&self) -> watch::Receiver<u64> {
        self.shared.epoch_tx.subscribe()
    }

    /// Force a fetch now.
    pub async fn refresh(&self) {
        self.shared.refresh_once().await;
    }

    /// Clear any surfaced error, then refresh.
    pub async fn retry(&self) {
        *self.shared.error.lock().unwrap() = None;
        self.shared.refresh_once().await;
    }

    /// Manually start the watch (also re-enables automatic restarts).
    pub async fn start_watch(&self) -> Result<(), SyncError> {
        self.shared.watch.set_enabled(true);
        self.shared.watch.start(&self.shared).await
    }

    /// Manually stop the watch and keep it stopped.
    pub fn stop_watch(&self) {
        self.shared.watch.set_enabled(false);
        self.shared.watch.stop(&self.shared);
    }

    /// Move the session to a new scope. The snapshot is primed from the
    /// cache immediately and a fresh fetch kicked; the watch restart is
    /// debounced by the coordinator. A selector resolving to the current
    /// ScopeKey is a no-op.
    pub fn set_scope(&self, selector: ScopeSelector) {
        let shared = &self.shared;
        let key = ScopeKey::new(&shared.kind, &selector);
        let current = shared.current_scope();
        if current.key == key {
            debug!(scope = %key, "selector resolves to current scope; ignoring");
            return;
        }
        info!(from = %current.key, to = %key, "scope change");
        shared.generation.fetch_add(1, Ordering::SeqCst);
        // Publish the scope first: events and fetches for the old scope are
        // dropped from this point on, so the primed snapshot can't be
        // overwritten by a straggler.
        let _ = shared.scope_tx.send(SessionScope { selector, key: key.clone() });
        let primed = shared.cache.get(&key).map(|s| (*s).clone()).unwrap_or_default();
        let epoch = primed.epoch;
        shared.snapshot.store(Arc::new(primed));
        let _ = shared.epoch_tx.send(epoch);
        shared.loading.store(true, Ordering::SeqCst);
        let s = Arc::clone(shared);
        tokio::spawn(async move { s.refresh_once().await });
    }

    /// Tear the session down: cancel timers and background tasks, stop the
    /// watch, and mark any in-flight fetch as to-be-discarded. Idempotent.
    pub fn close(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.watch.set_enabled(false);
        self.shared.watch.stop(&self.shared);
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            info!(scope = %self.shared.current_scope().key, "closing sync session");
        }
        for t in tasks.drain(..) {
            t.abort();
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.close();
    }
}
