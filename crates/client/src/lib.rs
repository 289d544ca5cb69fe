//! Remote resource client boundary.
//!
//! The sync layer never speaks the backend's wire protocol itself; it goes
//! through the `RemoteClient` trait. Production binaries plug in a real
//! transport; tests and the CLI demo run against `MockClient`.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tracing::debug;

use skopos_core::{KindSpec, NamespaceFilter, ResourceItem, WatchEvent};

/// Strongly-typed handle identifying one live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(uuid::Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-kind access to the backend.
#[async_trait::async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch the current items for one namespace (`None` = whole cluster).
    async fn list(&self, kind: &KindSpec, namespace: Option<&str>) -> Result<Vec<ResourceItem>>;

    /// Open an incremental subscription. Resolution confirms the
    /// subscription started, not that anything was delivered; events arrive
    /// on `tx` in order until `unsubscribe` or a stream `Error` event.
    async fn subscribe(
        &self,
        kind: &KindSpec,
        id: SubscriptionId,
        filter: NamespaceFilter,
        tx: mpsc::Sender<WatchEvent>,
    ) -> Result<()>;

    /// Close a subscription. Idempotent; unknown ids are a no-op.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

// ----------------- Mock implementation -----------------

/// Simple in-memory mock implementation for tests and the CLI demo backend.
///
/// Items live under their namespace (`None` for cluster-scoped); failures
/// and latencies can be injected per namespace, subscriptions recorded and
/// fed manually through [`MockClient::emit`].
#[derive(Default)]
pub struct MockClient {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    items: HashMap<Option<String>, Vec<ResourceItem>>,
    fail_namespaces: HashSet<String>,
    delays: HashMap<String, Duration>,
    fail_subscribe: bool,
    subs: HashMap<SubscriptionId, mpsc::Sender<WatchEvent>>,
    list_calls: Vec<Option<String>>,
    subscribe_calls: usize,
    subscribe_filters: Vec<NamespaceFilter>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: Option<&str>, item: ResourceItem) {
        let mut st = self.state.lock().unwrap();
        st.items.entry(namespace.map(|s| s.to_string())).or_default().push(item);
    }

    /// Make every `list` for `namespace` fail.
    pub fn fail_namespace(&self, namespace: &str) {
        self.state.lock().unwrap().fail_namespaces.insert(namespace.to_string());
    }

    /// Delay every `list` for `namespace` by `delay`.
    pub fn delay_namespace(&self, namespace: &str, delay: Duration) {
        self.state.lock().unwrap().delays.insert(namespace.to_string(), delay);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_namespaces.clear();
    }

    pub fn fail_subscribe(&self, on: bool) {
        self.state.lock().unwrap().fail_subscribe = on;
    }

    /// Namespace arguments of every `list` call seen so far.
    pub fn list_calls(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().list_calls.clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().unwrap().subscribe_calls
    }

    /// Filters of every `subscribe` call, in call order.
    pub fn subscribe_filters(&self) -> Vec<NamespaceFilter> {
        self.state.lock().unwrap().subscribe_filters.clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().unwrap().subs.len()
    }

    /// Push an event to every live subscription, pruning closed ones.
    pub async fn emit(&self, event: WatchEvent) {
        let senders: Vec<(SubscriptionId, mpsc::Sender<WatchEvent>)> = {
            let st = self.state.lock().unwrap();
            st.subs.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };
        let mut dead = Vec::new();
        for (id, tx) in senders {
            if tx.send(event.clone()).await.is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut st = self.state.lock().unwrap();
            for id in dead {
                st.subs.remove(&id);
            }
        }
    }
}

#[async_trait::async_trait]
impl RemoteClient for MockClient {
    async fn list(&self, _kind: &KindSpec, namespace: Option<&str>) -> Result<Vec<ResourceItem>> {
        let (delay, outcome) = {
            let mut st = self.state.lock().unwrap();
            st.list_calls.push(namespace.map(|s| s.to_string()));
            let delay = namespace.and_then(|ns| st.delays.get(ns).copied());
            let outcome = match namespace {
                Some(ns) if st.fail_namespaces.contains(ns) => {
                    Err(anyhow!("list {ns}: injected failure"))
                }
                Some(ns) => Ok(st.items.get(&Some(ns.to_string())).cloned().unwrap_or_default()),
                // Cluster-wide list returns everything.
                None => Ok(st.items.values().flatten().cloned().collect()),
            };
            (delay, outcome)
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        outcome
    }

    async fn subscribe(
        &self,
        kind: &KindSpec,
        id: SubscriptionId,
        filter: NamespaceFilter,
        tx: mpsc::Sender<WatchEvent>,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.subscribe_calls += 1;
        st.subscribe_filters.push(filter);
        if st.fail_subscribe {
            return Err(anyhow!("subscribe {}: injected failure", kind.key()));
        }
        debug!(kind = %kind.key(), sub = %id, "mock subscription opened");
        st.subs.insert(id, tx);
        Ok(())
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.subs.remove(&id).is_some() {
            debug!(sub = %id, "mock subscription closed");
        }
        Ok(())
    }
}
