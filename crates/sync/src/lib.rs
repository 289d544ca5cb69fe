//! Skopos sync engine.
//!
//! Keeps a client-held snapshot of a remote collection correct and fresh:
//! scope fan-out fetches with bounded parallelism, an optional incremental
//! watch reconciled into the snapshot, debounced watch restarts with retry
//! backoff, and periodic polling whenever no watch is active.

#![forbid(unsafe_code)]

mod coordinator;
mod fetch;
mod poll;
mod session;
mod watch;

pub use coordinator::{RESTART_SETTLE, SCOPE_DEBOUNCE};
pub use fetch::{fetch_scope, DEFAULT_FETCH_CONCURRENCY};
pub use session::{SessionOptions, SyncSession, DEFAULT_REFRESH_INTERVAL};
pub use watch::WATCH_RETRY_BACKOFF;
