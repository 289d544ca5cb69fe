//! Watch subscription lifecycle and event reconciliation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use skopos_client::{RemoteClient, SubscriptionId};
use skopos_core::{ScopeKey, SyncError, WatchEvent, WatchState};
use skopos_store::SnapshotBuilder;

use crate::session::SessionShared;

/// Minimum wait before re-attempting a failed subscription start.
pub const WATCH_RETRY_BACKOFF: Duration = Duration::from_secs(5);

fn event_queue_cap() -> usize {
    std::env::var("SKOPOS_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048)
}

/// One consumer session's watch: at most one live subscription, with the
/// state machine Idle -> Starting -> Active, Starting/Active -> Error ->
/// (backoff) -> Starting. `Active` is only ever entered from `Starting`.
pub(crate) struct WatchCtl {
    inner: Mutex<WatchInner>,
    state_tx: watch::Sender<WatchState>,
}

struct WatchInner {
    id: Option<SubscriptionId>,
    scope: Option<ScopeKey>,
    retry_not_before: Option<Instant>,
    pump: Option<JoinHandle<()>>,
    /// Whether this session wants a watch at all; cleared by `stop_watch`
    /// and on close so the coordinator stops restarting.
    enabled: bool,
}

impl WatchCtl {
    pub(crate) fn new(enabled: bool) -> Self {
        let (state_tx, _) = watch::channel(WatchState::Idle);
        Self {
            inner: Mutex::new(WatchInner {
                id: None,
                scope: None,
                retry_not_before: None,
                pump: None,
                enabled,
            }),
            state_tx,
        }
    }

    pub(crate) fn state(&self) -> WatchState {
        *self.state_tx.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<WatchState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    pub(crate) fn set_enabled(&self, on: bool) {
        self.inner.lock().unwrap().enabled = on;
    }

    pub(crate) fn current_scope(&self) -> Option<ScopeKey> {
        self.inner.lock().unwrap().scope.clone()
    }

    pub(crate) fn retry_not_before(&self) -> Option<Instant> {
        self.inner.lock().unwrap().retry_not_before
    }

    /// Open a subscription for the session's current scope. Refuses while
    /// one is already `Starting` or `Active`.
    pub(crate) async fn start(&self, shared: &Arc<SessionShared>) -> Result<(), SyncError> {
        let scope = shared.current_scope();
        let id = SubscriptionId::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.enabled {
                return Ok(());
            }
            if matches!(self.state(), WatchState::Starting | WatchState::Active) {
                debug!(scope = %scope.key, "watch already running; ignoring start");
                return Ok(());
            }
            inner.id = Some(id);
            inner.scope = Some(scope.key.clone());
            // Transition under the same lock as the refusal check so two
            // racing starts cannot both get past it.
            self.set_state(WatchState::Starting);
        }

        let (tx, rx) = mpsc::channel(event_queue_cap());
        info!(scope = %scope.key, sub = %id, "starting watch");
        let res = shared.client.subscribe(&shared.kind, id, scope.selector.filter(), tx).await;

        let mut inner = self.inner.lock().unwrap();
        if inner.id != Some(id) {
            // Stopped while starting; close the remote side we just opened.
            drop(inner);
            spawn_unsubscribe(&shared.client, id);
            return Ok(());
        }
        match res {
            Ok(()) => {
                inner.retry_not_before = None;
                inner.pump = Some(tokio::spawn(pump(Arc::clone(shared), id, scope.key.clone(), rx)));
                self.set_state(WatchState::Active);
                drop(inner);
                metrics::counter!("watch_started_total", 1u64);
                Ok(())
            }
            Err(e) => {
                let err = SyncError::subscription(format!("{e:#}"));
                inner.id = None;
                inner.scope = None;
                inner.retry_not_before = Some(Instant::now() + WATCH_RETRY_BACKOFF);
                self.set_state(WatchState::Error);
                drop(inner);
                metrics::counter!("watch_errors_total", 1u64);
                warn!(scope = %scope.key, error = %err, "watch start failed; backoff scheduled");
                shared.set_error(err.clone());
                Err(err)
            }
        }
    }

    /// Close the active subscription, if any. Idempotent.
    pub(crate) fn stop(&self, shared: &SessionShared) {
        let (id, pump) = {
            let mut inner = self.inner.lock().unwrap();
            inner.scope = None;
            if self.state() != WatchState::Idle {
                self.set_state(WatchState::Idle);
            }
            (inner.id.take(), inner.pump.take())
        };
        if let Some(p) = pump {
            p.abort();
        }
        if let Some(id) = id {
            info!(sub = %id, "stopping watch");
            spawn_unsubscribe(&shared.client, id);
        }
    }

    /// Stream-level failure reported by the pump: surface it and arm the
    /// retry backoff. The pump exits on its own after calling this.
    fn fail(&self, shared: &SessionShared, err: SyncError) {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            if inner.id.is_none() {
                // Already stopped; nothing to report.
                return;
            }
            inner.scope = None;
            inner.retry_not_before = Some(Instant::now() + WATCH_RETRY_BACKOFF);
            // Detach rather than abort: the pump is the caller.
            inner.pump.take();
            self.set_state(WatchState::Error);
            inner.id.take()
        };
        if let Some(id) = id {
            spawn_unsubscribe(&shared.client, id);
        }
        metrics::counter!("watch_errors_total", 1u64);
        shared.set_error(err);
    }

    fn set_state(&self, st: WatchState) {
        let _ = self.state_tx.send(st);
    }
}

/// Consume one subscription's events strictly in arrival order, applying a
/// single reconciliation step per event to the shared snapshot.
async fn pump(
    shared: Arc<SessionShared>,
    id: SubscriptionId,
    scope: ScopeKey,
    mut rx: mpsc::Receiver<WatchEvent>,
) {
    debug!(sub = %id, scope = %scope, "event pump running");
    while let Some(ev) = rx.recv().await {
        match ev {
            WatchEvent::Error(msg) => {
                warn!(sub = %id, error = %msg, "subscription reported error");
                shared.watch.fail(&shared, SyncError::subscription(msg));
                break;
            }
            ev => {
                if shared.current_scope().key != scope {
                    // Superseded scope; its events must not touch the snapshot.
                    debug!(sub = %id, "dropping event for superseded scope");
                    continue;
                }
                let cur = shared.snapshot.load_full();
                let mut b = SnapshotBuilder::from_snapshot(&cur);
                b.apply(ev);
                shared.store_snapshot(&scope, b.freeze());
            }
        }
    }
    debug!(sub = %id, "event pump ended");
}

/// Best-effort remote close; no cancellation token propagates into the
/// client, so this is fire-and-forget.
fn spawn_unsubscribe(client: &Arc<dyn RemoteClient>, id: SubscriptionId) {
    let client = Arc::clone(client);
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let _ = client.unsubscribe(id).await;
        });
    }
}
