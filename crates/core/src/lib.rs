//! Skopos core types: scope model, items, events, errors

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub type Uid = [u8; 16];

/// Parse a backend UID string (UUID form) into the 16-byte identity.
pub fn parse_uid(uid_str: &str) -> anyhow::Result<Uid> {
    let u = uuid::Uuid::parse_str(uid_str).context("parsing uid as uuid")?;
    Ok(*u.as_bytes())
}

/// A resource kind descriptor as the sync layer sees it.
///
/// `watchable` gates the incremental subscription path; `poll_interval`
/// overrides the session default for kinds that churn faster (event-log
/// style kinds) or slower than the norm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindSpec {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
    pub watchable: bool,
    #[serde(default)]
    pub poll_interval: Option<Duration>,
}

impl KindSpec {
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Which namespaces a session targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScopeSelector {
    ClusterWide,
    SingleNamespace(String),
    NamespaceSet(Vec<String>),
    /// "All namespaces" restricted to a statically configured set.
    ConfiguredAllNamespaces(Vec<String>),
}

impl ScopeSelector {
    /// Sorted, deduped namespace list; `None` means the whole cluster.
    ///
    /// Total and idempotent: any two selectors over the same namespace
    /// multiset resolve identically. An empty set collapses to `None`.
    pub fn canonical_namespaces(&self) -> Option<Vec<String>> {
        match self {
            ScopeSelector::ClusterWide => None,
            ScopeSelector::SingleNamespace(ns) => Some(vec![ns.clone()]),
            ScopeSelector::NamespaceSet(list) | ScopeSelector::ConfiguredAllNamespaces(list) => {
                let mut v = list.clone();
                v.sort();
                v.dedup();
                if v.is_empty() {
                    None
                } else {
                    Some(v)
                }
            }
        }
    }

    pub fn filter(&self) -> NamespaceFilter {
        match self.canonical_namespaces() {
            None => NamespaceFilter::All,
            Some(v) => NamespaceFilter::Namespaces(v),
        }
    }
}

/// Resolved namespace filter handed to the remote client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NamespaceFilter {
    All,
    Namespaces(Vec<String>),
}

/// Canonical cache/fetch identity for one (kind, scope) pair.
///
/// Order-independent over the selector's namespaces: `{b,a}` and `{a,b}`
/// render the same key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(kind: &KindSpec, selector: &ScopeSelector) -> Self {
        let scope = match selector.canonical_namespaces() {
            None => "*".to_string(),
            Some(v) => v.join(","),
        };
        ScopeKey(format!("{}|{}", kind.key(), scope))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One synchronized resource instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceItem {
    pub uid: Uid,
    pub namespace: Option<String>,
    pub name: String,
    pub creation_ts: i64,
    pub labels: SmallVec<[(String, String); 8]>,
}

/// The materialized collection for one ScopeKey.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub epoch: u64,
    pub items: Vec<ResourceItem>,
}

/// Incremental change pushed by an active subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WatchEvent {
    Added(ResourceItem),
    Modified(ResourceItem),
    Deleted(Uid),
    /// The backend stream resynchronized; replaces the snapshot wholesale.
    Restarted(Vec<ResourceItem>),
    Error(String),
}

/// Subscription lifecycle. Never re-enters `Active` without passing
/// through `Starting`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Starting,
    Active,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    PartialScope,
    TotalScope,
    Subscription,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::PartialScope => "partial_scope",
            ErrorKind::TotalScope => "total_scope",
            ErrorKind::Subscription => "subscription",
        };
        f.write_str(s)
    }
}

/// Normalized error shape every remote failure is reduced to before
/// aggregation or surfacing.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct SyncError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl SyncError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Transport, message: message.into(), retryable: true }
    }

    pub fn total_scope(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::TotalScope, message: message.into(), retryable: true }
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Subscription, message: message.into(), retryable: true }
    }

    pub fn partial_scope(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::PartialScope, message: message.into(), retryable: true }
    }

    /// Normalize an arbitrary remote-client error, keeping an already
    /// normalized error intact.
    pub fn normalize(err: anyhow::Error) -> Self {
        match err.downcast::<SyncError>() {
            Ok(e) => e,
            Err(other) => SyncError::transport(format!("{other:#}")),
        }
    }
}

/// A single namespace's failure inside a fan-out fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeFailure {
    pub namespace: String,
    pub error: SyncError,
}

/// Result of one orchestrated fetch over a scope.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(Vec<ResourceItem>),
    /// Some namespaces failed; successful subsets are returned, failures
    /// retained for diagnostics.
    Partial(Vec<ResourceItem>, Vec<ScopeFailure>),
    Failure(SyncError),
}

impl FetchOutcome {
    pub fn items(&self) -> Option<&[ResourceItem]> {
        match self {
            FetchOutcome::Success(items) | FetchOutcome::Partial(items, _) => Some(items),
            FetchOutcome::Failure(_) => None,
        }
    }

    /// Summarize a partial outcome as a diagnostic error. Partial failures
    /// are recovered locally and never surfaced as the session error.
    pub fn partial_error(&self) -> Option<SyncError> {
        match self {
            FetchOutcome::Partial(_, failures) => {
                let msg = failures
                    .iter()
                    .map(|f| format!("{}: {}", f.namespace, f.error.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                Some(SyncError::partial_scope(msg))
            }
            _ => None,
        }
    }
}

pub mod prelude {
    pub use super::{
        FetchOutcome, KindSpec, NamespaceFilter, ResourceItem, ScopeFailure, ScopeKey,
        ScopeSelector, Snapshot, SyncError, Uid, WatchEvent, WatchState,
    };
}
