//! Fetch orchestration: one logical scope, fanned out into bounded
//! per-namespace list calls with partial-failure aggregation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use skopos_client::RemoteClient;
use skopos_core::{
    FetchOutcome, KindSpec, NamespaceFilter, ResourceItem, ScopeFailure, ScopeSelector, SyncError,
};

pub const DEFAULT_FETCH_CONCURRENCY: usize = 5;

/// Execute a list over `selector`. Cluster-wide and single-namespace scopes
/// are one call; namespace sets fan out through a worker pool of
/// `min(concurrency, count)` workers pulling from a shared index cursor, so
/// result slot `i` always holds namespace `i`'s outcome regardless of
/// completion order.
pub async fn fetch_scope(
    client: &Arc<dyn RemoteClient>,
    kind: &KindSpec,
    selector: &ScopeSelector,
    concurrency: usize,
) -> FetchOutcome {
    match selector.filter() {
        NamespaceFilter::All => single(client, kind, None).await,
        NamespaceFilter::Namespaces(ns) if ns.len() == 1 => single(client, kind, Some(&ns[0])).await,
        NamespaceFilter::Namespaces(ns) => fan_out(client, kind, ns, concurrency).await,
    }
}

async fn single(
    client: &Arc<dyn RemoteClient>,
    kind: &KindSpec,
    namespace: Option<&str>,
) -> FetchOutcome {
    match client.list(kind, namespace).await {
        Ok(items) => FetchOutcome::Success(items),
        Err(e) => {
            metrics::counter!("fetch_failure_total", 1u64);
            FetchOutcome::Failure(SyncError::normalize(e))
        }
    }
}

async fn fan_out(
    client: &Arc<dyn RemoteClient>,
    kind: &KindSpec,
    namespaces: Vec<String>,
    concurrency: usize,
) -> FetchOutcome {
    let count = namespaces.len();
    let workers = concurrency.max(1).min(count);
    debug!(namespaces = count, workers, kind = %kind.key(), "fanning out list");

    let namespaces = Arc::new(namespaces);
    let cursor = Arc::new(AtomicUsize::new(0));
    let slots: Arc<Mutex<Vec<Option<Result<Vec<ResourceItem>, SyncError>>>>> =
        Arc::new(Mutex::new((0..count).map(|_| None).collect()));

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let client = Arc::clone(client);
        let kind = kind.clone();
        let namespaces = Arc::clone(&namespaces);
        let cursor = Arc::clone(&cursor);
        let slots = Arc::clone(&slots);
        handles.push(tokio::spawn(async move {
            loop {
                let i = cursor.fetch_add(1, Ordering::SeqCst);
                if i >= namespaces.len() {
                    break;
                }
                let res = client
                    .list(&kind, Some(&namespaces[i]))
                    .await
                    .map_err(SyncError::normalize);
                slots.lock().unwrap()[i] = Some(res);
            }
        }));
    }
    futures::future::join_all(handles).await;

    let results: Vec<Option<Result<Vec<ResourceItem>, SyncError>>> =
        slots.lock().unwrap().drain(..).collect();
    let mut items = Vec::new();
    let mut failures = Vec::new();
    for (i, slot) in results.into_iter().enumerate() {
        let res = slot.unwrap_or_else(|| Err(SyncError::transport("list task aborted")));
        match res {
            Ok(mut batch) => items.append(&mut batch),
            Err(error) => failures.push(ScopeFailure { namespace: namespaces[i].clone(), error }),
        }
    }

    if failures.len() == count {
        let msg = failures
            .iter()
            .map(|f| format!("{}: {}", f.namespace, f.error.message))
            .collect::<Vec<_>>()
            .join("; ");
        metrics::counter!("fetch_failure_total", 1u64);
        return FetchOutcome::Failure(SyncError::total_scope(msg));
    }
    if !failures.is_empty() {
        warn!(failed = failures.len(), ok = count - failures.len(), "scope fetch partially failed");
        metrics::counter!("fetch_partial_total", 1u64);
        return FetchOutcome::Partial(items, failures);
    }
    FetchOutcome::Success(items)
}
