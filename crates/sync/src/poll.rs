//! Periodic re-fetch for sessions without a live watch.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use skopos_core::WatchState;

use crate::session::SessionShared;

/// Tick at the session's poll period, refreshing whenever no watch is
/// `Active`. Suspended (ticks skipped) while one is; resumes as soon as the
/// watch drops to `Error` or `Idle`.
pub(crate) async fn run(shared: Arc<SessionShared>) {
    if !shared.opts.auto_refresh {
        return;
    }
    let period = shared.poll_period();
    let state_rx = shared.watch.subscribe_state();
    debug!(period_ms = %period.as_millis(), "polling scheduler running");
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick is immediate; the session already fetched on open.
    tick.tick().await;
    loop {
        tick.tick().await;
        if *state_rx.borrow() == WatchState::Active {
            continue;
        }
        shared.refresh_once().await;
    }
}
