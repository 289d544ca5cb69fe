#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;

use skopos_client::{MockClient, RemoteClient};
use skopos_core::{
    ErrorKind, KindSpec, NamespaceFilter, ResourceItem, ScopeKey, ScopeSelector, Snapshot, Uid,
};
use skopos_store::SnapshotCache;
use skopos_sync::{SessionOptions, SyncSession};

fn uid(n: u8) -> Uid {
    let mut u = [0u8; 16];
    u[0] = n;
    u
}

fn item(n: u8, ns: &str, name: &str) -> ResourceItem {
    ResourceItem {
        uid: uid(n),
        namespace: Some(ns.into()),
        name: name.into(),
        creation_ts: 0,
        labels: SmallVec::new(),
    }
}

fn kind(watchable: bool) -> KindSpec {
    KindSpec {
        group: String::new(),
        version: "v1".into(),
        kind: "Widget".into(),
        namespaced: true,
        watchable,
        poll_interval: None,
    }
}

async fn drain() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn cache_primes_data_synchronously() {
    let mock = Arc::new(MockClient::new());
    mock.insert(Some("a"), item(1, "a", "fresh"));

    let cache = Arc::new(SnapshotCache::new());
    let sel = ScopeSelector::SingleNamespace("a".into());
    let key = ScopeKey::new(&kind(false), &sel);
    cache.set(key, Arc::new(Snapshot { epoch: 7, items: vec![item(9, "a", "cached")] }));

    let client: Arc<dyn RemoteClient> = mock.clone();
    let session = SyncSession::open(
        client,
        Arc::clone(&cache),
        kind(false),
        sel,
        SessionOptions::default(),
    );
    // Before any task ran, the cached snapshot is already visible.
    assert_eq!(session.data().len(), 1);
    assert_eq!(session.data()[0].name, "cached");
    assert!(session.is_loading());

    drain().await;
    assert!(!session.is_loading());
    assert_eq!(session.data()[0].name, "fresh");
    session.close();
}

#[tokio::test(start_paused = true)]
async fn stale_fetch_never_overwrites_newer_scope() {
    let mock = Arc::new(MockClient::new());
    mock.insert(Some("aa"), item(1, "aa", "slow"));
    mock.insert(Some("bb"), item(2, "bb", "fast"));
    mock.delay_namespace("aa", Duration::from_millis(500));

    let cache = Arc::new(SnapshotCache::new());
    let client: Arc<dyn RemoteClient> = mock.clone();
    let opts = SessionOptions { auto_refresh: false, auto_watch: false, ..Default::default() };
    let session = SyncSession::open(
        client,
        Arc::clone(&cache),
        kind(false),
        ScopeSelector::SingleNamespace("aa".into()),
        opts,
    );
    drain().await; // fetch for "aa" is parked on its delay

    session.set_scope(ScopeSelector::SingleNamespace("bb".into()));
    drain().await;
    assert_eq!(session.data()[0].name, "fast");

    // Let the superseded "aa" fetch finish; its result must be discarded.
    tokio::time::advance(Duration::from_millis(600)).await;
    drain().await;
    assert_eq!(session.data().len(), 1);
    assert_eq!(session.data()[0].name, "fast");
    let aa_key = ScopeKey::new(&kind(false), &ScopeSelector::SingleNamespace("aa".into()));
    assert!(cache.get(&aa_key).is_none(), "stale result must not reach the cache");
    session.close();
}

#[tokio::test(start_paused = true)]
async fn rapid_scope_changes_restart_watch_once() {
    let mock = Arc::new(MockClient::new());
    mock.insert(Some("ns1"), item(1, "ns1", "one"));
    mock.insert(Some("ns2"), item(2, "ns2", "two"));
    mock.insert(Some("ns3"), item(3, "ns3", "three"));

    let client: Arc<dyn RemoteClient> = mock.clone();
    let session = SyncSession::open(
        client,
        Arc::new(SnapshotCache::new()),
        kind(true),
        ScopeSelector::SingleNamespace("ns1".into()),
        SessionOptions::default(),
    );
    drain().await;
    assert!(session.is_watching());
    assert_eq!(mock.subscribe_calls(), 1);

    session.set_scope(ScopeSelector::SingleNamespace("ns2".into()));
    tokio::time::advance(Duration::from_millis(100)).await;
    session.set_scope(ScopeSelector::SingleNamespace("ns3".into()));

    // Debounce (300ms from the last change) plus the settle delay.
    tokio::time::advance(Duration::from_millis(1000)).await;
    drain().await;
    assert_eq!(mock.subscribe_calls(), 2, "exactly one restart for the burst");
    let filters = mock.subscribe_filters();
    assert_eq!(
        filters.last(),
        Some(&NamespaceFilter::Namespaces(vec!["ns3".to_string()])),
        "restart targets the scope as of the last change"
    );
    assert!(session.is_watching());
    assert_eq!(session.data()[0].name, "three");
    session.close();
}

#[tokio::test(start_paused = true)]
async fn same_scope_key_change_is_ignored() {
    let mock = Arc::new(MockClient::new());
    mock.insert(Some("a"), item(1, "a", "one"));
    mock.insert(Some("b"), item(2, "b", "two"));

    let client: Arc<dyn RemoteClient> = mock.clone();
    let session = SyncSession::open(
        client,
        Arc::new(SnapshotCache::new()),
        kind(true),
        ScopeSelector::NamespaceSet(vec!["a".into(), "b".into()]),
        SessionOptions::default(),
    );
    drain().await;
    assert_eq!(mock.subscribe_calls(), 1);

    // Same namespaces, different order: same ScopeKey, no restart.
    session.set_scope(ScopeSelector::NamespaceSet(vec!["b".into(), "a".into()]));
    tokio::time::advance(Duration::from_millis(2000)).await;
    drain().await;
    assert_eq!(mock.subscribe_calls(), 1);
    session.close();
}

#[tokio::test(start_paused = true)]
async fn polling_fires_only_without_active_watch() {
    // Unwatchable kind: the poller drives refreshes.
    let mock = Arc::new(MockClient::new());
    mock.insert(Some("a"), item(1, "a", "one"));
    let client: Arc<dyn RemoteClient> = mock.clone();
    let opts = SessionOptions { refresh_interval: Some(Duration::from_secs(1)), ..Default::default() };
    let session = SyncSession::open(
        client,
        Arc::new(SnapshotCache::new()),
        kind(false),
        ScopeSelector::SingleNamespace("a".into()),
        opts.clone(),
    );
    drain().await;
    assert_eq!(mock.list_calls().len(), 1); // initial fetch
    tokio::time::advance(Duration::from_millis(3100)).await;
    drain().await;
    assert!(mock.list_calls().len() >= 4, "poller must re-fetch every second");
    session.close();

    // Watchable kind with an active watch: polling is suspended.
    let mock = Arc::new(MockClient::new());
    mock.insert(Some("a"), item(1, "a", "one"));
    let client: Arc<dyn RemoteClient> = mock.clone();
    let session = SyncSession::open(
        client,
        Arc::new(SnapshotCache::new()),
        kind(true),
        ScopeSelector::SingleNamespace("a".into()),
        opts,
    );
    drain().await;
    assert!(session.is_watching());
    let baseline = mock.list_calls().len();
    tokio::time::advance(Duration::from_millis(4000)).await;
    drain().await;
    assert_eq!(mock.list_calls().len(), baseline, "no polls while the watch is active");
    session.close();
}

#[tokio::test(start_paused = true)]
async fn polling_resumes_while_watch_is_down() {
    let mock = Arc::new(MockClient::new());
    mock.insert(Some("a"), item(1, "a", "one"));
    mock.fail_subscribe(true);
    let client: Arc<dyn RemoteClient> = mock.clone();
    let opts = SessionOptions { refresh_interval: Some(Duration::from_secs(1)), ..Default::default() };
    let session = SyncSession::open(
        client,
        Arc::new(SnapshotCache::new()),
        kind(true),
        ScopeSelector::SingleNamespace("a".into()),
        opts,
    );
    drain().await;
    assert!(!session.is_watching());
    let baseline = mock.list_calls().len();
    tokio::time::advance(Duration::from_millis(3100)).await;
    drain().await;
    assert!(mock.list_calls().len() > baseline, "watch in error: polling must keep going");
    session.close();
}

#[tokio::test(start_paused = true)]
async fn retry_clears_error_and_refetches() {
    let mock = Arc::new(MockClient::new());
    mock.fail_namespace("a");
    let client: Arc<dyn RemoteClient> = mock.clone();
    let opts = SessionOptions { auto_refresh: false, auto_watch: false, ..Default::default() };
    let session = SyncSession::open(
        client,
        Arc::new(SnapshotCache::new()),
        kind(false),
        ScopeSelector::SingleNamespace("a".into()),
        opts,
    );
    drain().await;
    let err = session.error().expect("failed fetch surfaced");
    assert_eq!(err.kind, ErrorKind::Transport);
    assert!(session.data().is_empty());

    mock.clear_failures();
    mock.insert(Some("a"), item(1, "a", "recovered"));
    session.retry().await;
    assert!(session.error().is_none());
    assert_eq!(session.data()[0].name, "recovered");
    session.close();
}

#[tokio::test(start_paused = true)]
async fn namespace_override_pins_the_scope() {
    let mock = Arc::new(MockClient::new());
    mock.insert(Some("pinned"), item(1, "pinned", "one"));
    let client: Arc<dyn RemoteClient> = mock.clone();
    let opts = SessionOptions {
        namespace_override: Some("pinned".into()),
        auto_watch: false,
        ..Default::default()
    };
    let session = SyncSession::open(
        client,
        Arc::new(SnapshotCache::new()),
        kind(false),
        ScopeSelector::ClusterWide,
        opts,
    );
    let expect = ScopeKey::new(&kind(false), &ScopeSelector::SingleNamespace("pinned".into()));
    assert_eq!(session.scope_key(), expect);
    drain().await;
    assert_eq!(mock.list_calls(), vec![Some("pinned".to_string())]);
    assert_eq!(session.data()[0].name, "one");
    session.close();
}

#[tokio::test(start_paused = true)]
async fn partial_fetch_keeps_survivors_and_no_error() {
    let mock = Arc::new(MockClient::new());
    mock.insert(Some("a"), item(1, "a", "one"));
    mock.insert(Some("c"), item(3, "c", "three"));
    mock.fail_namespace("b");
    let client: Arc<dyn RemoteClient> = mock.clone();
    let opts = SessionOptions { auto_refresh: false, auto_watch: false, ..Default::default() };
    let session = SyncSession::open(
        client,
        Arc::new(SnapshotCache::new()),
        kind(false),
        ScopeSelector::NamespaceSet(vec!["a".into(), "b".into(), "c".into()]),
        opts,
    );
    drain().await;
    assert!(session.error().is_none(), "partial failure is recovered locally");
    let names: Vec<_> = session.data().iter().map(|it| it.name.clone()).collect();
    assert_eq!(names, vec!["one".to_string(), "three".into()]);
    let failures = session.partial_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].namespace, "b");
    session.close();
}
