//! Scope-keyed snapshot cache and event reconciliation.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::debug;

use skopos_core::{ResourceItem, ScopeKey, Snapshot, Uid, WatchEvent};

/// Last known-good snapshot per scope, read synchronously on scope entry.
///
/// Session-lifetime cache: no eviction beyond `clear` (called when the
/// backend connection goes away). Values are whole immutable `Arc`s, so a
/// reader never observes a partially written snapshot.
#[derive(Default)]
pub struct SnapshotCache {
    map: Mutex<FxHashMap<ScopeKey, Arc<Snapshot>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ScopeKey) -> Option<Arc<Snapshot>> {
        self.map.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: ScopeKey, snap: Arc<Snapshot>) {
        self.map.lock().unwrap().insert(key, snap);
    }

    pub fn clear(&self) {
        let mut map = self.map.lock().unwrap();
        debug!(scopes = map.len(), "clearing snapshot cache");
        map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds the next snapshot from the previous one plus events or a full
/// listing, keeping items unique by uid via an index.
pub struct SnapshotBuilder {
    epoch: u64,
    items: Vec<ResourceItem>,
    index: FxHashMap<Uid, usize>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self { epoch: 0, items: Vec::new(), index: FxHashMap::default() }
    }

    /// Resume from an existing snapshot (cache-primed or current).
    pub fn from_snapshot(snap: &Snapshot) -> Self {
        let mut index = FxHashMap::default();
        for (i, it) in snap.items.iter().enumerate() {
            index.insert(it.uid, i);
        }
        Self { epoch: snap.epoch, items: snap.items.clone(), index }
    }

    /// One reconciliation step. `Added` and `Modified` are both upserts:
    /// a duplicate `Added` replaces in place, an unseen `Modified` appends.
    /// Stream `Error` events are lifecycle, not data; they are ignored here.
    pub fn apply(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Added(item) | WatchEvent::Modified(item) => self.upsert(item),
            WatchEvent::Deleted(uid) => self.remove(&uid),
            WatchEvent::Restarted(items) => {
                debug!(count = items.len(), "stream resynchronized");
                self.replace_items(items);
            }
            WatchEvent::Error(_) => return,
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Wholesale replacement from a full fetch.
    pub fn replace(&mut self, items: Vec<ResourceItem>) {
        self.replace_items(items);
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<Snapshot> {
        Arc::new(Snapshot { epoch: self.epoch, items: self.items.clone() })
    }

    fn upsert(&mut self, item: ResourceItem) {
        match self.index.get(&item.uid) {
            Some(&i) => self.items[i] = item,
            None => {
                self.index.insert(item.uid, self.items.len());
                self.items.push(item);
            }
        }
    }

    fn remove(&mut self, uid: &Uid) {
        if let Some(i) = self.index.remove(uid) {
            self.items.remove(i);
            for (j, it) in self.items.iter().enumerate().skip(i) {
                self.index.insert(it.uid, j);
            }
        }
    }

    // Dedupe by uid, last occurrence wins.
    fn replace_items(&mut self, items: Vec<ResourceItem>) {
        self.items.clear();
        self.index.clear();
        for item in items {
            self.upsert(item);
        }
    }
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}
