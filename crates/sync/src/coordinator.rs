//! Restart coordination: debounced scope changes and backoff-gated
//! watch restarts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info};

use skopos_core::WatchState;

use crate::session::{SessionScope, SessionShared};

/// Quiet period a burst of scope changes must settle for before the watch
/// is restarted.
pub const SCOPE_DEBOUNCE: Duration = Duration::from_millis(300);

/// Extra delay between stopping the stale subscription and starting the
/// new one, so rapid interaction doesn't turn into a restart storm.
pub const RESTART_SETTLE: Duration = Duration::from_millis(500);

pub(crate) async fn run(
    shared: Arc<SessionShared>,
    mut scope_rx: watch::Receiver<SessionScope>,
    mut state_rx: watch::Receiver<WatchState>,
) {
    loop {
        tokio::select! {
            changed = scope_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                // Absorb the burst: keep extending until SCOPE_DEBOUNCE of quiet.
                loop {
                    match timeout(SCOPE_DEBOUNCE, scope_rx.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return,
                        Err(_) => break,
                    }
                }
                let desired = scope_rx.borrow().clone();
                if !shared.watch.enabled() {
                    continue;
                }
                if shared.watch.current_scope().as_ref() == Some(&desired.key) {
                    debug!(scope = %desired.key, "scope unchanged; skipping restart");
                    continue;
                }
                info!(scope = %desired.key, "scope settled; restarting watch");
                shared.watch.stop(&shared);
                sleep(RESTART_SETTLE).await;
                wait_backoff(&shared).await;
                metrics::counter!("watch_restarts_total", 1u64);
                let _ = shared.watch.start(&shared).await;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if *state_rx.borrow() != WatchState::Error {
                    continue;
                }
                // Auto-heal: wait out the backoff, then try again if the
                // session still wants a watch and nothing else fixed it.
                wait_backoff(&shared).await;
                if shared.watch.enabled() && shared.watch.state() == WatchState::Error {
                    let _ = shared.watch.start(&shared).await;
                }
            }
        }
    }
}

async fn wait_backoff(shared: &SessionShared) {
    if let Some(not_before) = shared.watch.retry_not_before() {
        let now = Instant::now();
        if not_before > now {
            debug!(wait_ms = %(not_before - now).as_millis(), "respecting watch backoff");
            sleep_until(not_before).await;
        }
    }
}
