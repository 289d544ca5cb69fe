#![forbid(unsafe_code)]

use smallvec::SmallVec;

use skopos_core::{ResourceItem, Uid, WatchEvent};
use skopos_store::SnapshotBuilder;

fn uid(n: u8) -> Uid {
    let mut u = [0u8; 16];
    u[0] = n;
    u
}

fn item(n: u8, name: &str) -> ResourceItem {
    ResourceItem {
        uid: uid(n),
        namespace: Some("ns".into()),
        name: name.into(),
        creation_ts: 0,
        labels: SmallVec::new(),
    }
}

#[test]
fn modified_replaces_in_place() {
    let mut b = SnapshotBuilder::new();
    b.apply(WatchEvent::Added(item(1, "a-v1")));
    b.apply(WatchEvent::Added(item(2, "b")));
    b.apply(WatchEvent::Modified(item(1, "a-v2")));
    let snap = b.freeze();
    assert_eq!(snap.items.len(), 2);
    assert_eq!(snap.items[0].name, "a-v2");
    assert_eq!(snap.items[1].name, "b");
}

#[test]
fn duplicate_added_upserts() {
    let mut b = SnapshotBuilder::new();
    b.apply(WatchEvent::Added(item(1, "a-v1")));
    b.apply(WatchEvent::Added(item(1, "a-v2")));
    let snap = b.freeze();
    assert_eq!(snap.items.len(), 1);
    assert_eq!(snap.items[0].name, "a-v2");
}

#[test]
fn modified_unseen_appends() {
    let mut b = SnapshotBuilder::new();
    b.apply(WatchEvent::Added(item(1, "a")));
    b.apply(WatchEvent::Modified(item(2, "b")));
    let snap = b.freeze();
    assert_eq!(snap.items.len(), 2);
    assert_eq!(snap.items[1].name, "b");
}

#[test]
fn deleted_removes_and_is_noop_when_absent() {
    let mut b = SnapshotBuilder::new();
    b.apply(WatchEvent::Added(item(1, "a")));
    b.apply(WatchEvent::Added(item(2, "b")));
    b.apply(WatchEvent::Added(item(3, "c")));
    b.apply(WatchEvent::Deleted(uid(2)));
    let snap = b.freeze();
    assert_eq!(snap.items.len(), 2);
    assert_eq!(snap.items[0].name, "a");
    assert_eq!(snap.items[1].name, "c");

    // absent uid: no-op
    b.apply(WatchEvent::Deleted(uid(9)));
    assert_eq!(b.freeze().items.len(), 2);

    // index stays valid after the removal shifted positions
    b.apply(WatchEvent::Modified(item(3, "c-v2")));
    let snap = b.freeze();
    assert_eq!(snap.items[1].name, "c-v2");
}

#[test]
fn restarted_replaces_wholesale() {
    let mut b = SnapshotBuilder::new();
    b.apply(WatchEvent::Added(item(1, "a")));
    b.apply(WatchEvent::Added(item(2, "b")));
    b.apply(WatchEvent::Restarted(vec![item(3, "c")]));
    let snap = b.freeze();
    assert_eq!(snap.items.len(), 1);
    assert_eq!(snap.items[0].name, "c");
}

#[test]
fn replace_dedupes_by_uid_last_wins() {
    let mut b = SnapshotBuilder::new();
    b.replace(vec![item(1, "a-v1"), item(2, "b"), item(1, "a-v2")]);
    let snap = b.freeze();
    assert_eq!(snap.items.len(), 2);
    assert_eq!(snap.items[0].name, "a-v2");
    // identity uniqueness holds
    let mut uids: Vec<Uid> = snap.items.iter().map(|it| it.uid).collect();
    uids.sort();
    uids.dedup();
    assert_eq!(uids.len(), snap.items.len());
}

#[test]
fn epoch_advances_per_step() {
    let mut b = SnapshotBuilder::new();
    assert_eq!(b.freeze().epoch, 0);
    b.apply(WatchEvent::Added(item(1, "a")));
    assert_eq!(b.freeze().epoch, 1);
    b.replace(vec![item(2, "b")]);
    assert_eq!(b.freeze().epoch, 2);
    // stream Error events are lifecycle, not data
    b.apply(WatchEvent::Error("boom".into()));
    assert_eq!(b.freeze().epoch, 2);
}

#[test]
fn from_snapshot_resumes() {
    let mut b = SnapshotBuilder::new();
    b.apply(WatchEvent::Added(item(1, "a")));
    b.apply(WatchEvent::Added(item(2, "b")));
    let snap = b.freeze();

    let mut resumed = SnapshotBuilder::from_snapshot(&snap);
    resumed.apply(WatchEvent::Deleted(uid(1)));
    let next = resumed.freeze();
    assert_eq!(next.epoch, snap.epoch + 1);
    assert_eq!(next.items.len(), 1);
    assert_eq!(next.items[0].name, "b");
}
