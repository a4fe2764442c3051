#![forbid(unsafe_code)]

use converge_core::{Delta, Labels, NamespacePhase, ResourceIdentity, ResourceSnapshot, ResourceStatus, WatchEvent};
use converge_store::SessionCache;

fn ns(name: &str, uid: &str, rv: &str, phase: NamespacePhase) -> ResourceSnapshot {
    ResourceSnapshot {
        identity: ResourceIdentity::namespace(name),
        uid: uid.to_string(),
        resource_version: Some(rv.to_string()),
        creation_ts: 1_577_836_800,
        labels: Labels::new(),
        deleting: phase == NamespacePhase::Terminating,
        status: ResourceStatus::Namespace { phase },
    }
}

fn verbs(events: &[WatchEvent]) -> Vec<(String, &'static str)> {
    events.iter().map(|e| (e.identity().name.clone(), e.verb())).collect()
}

#[test]
fn replay_basic_sequence() {
    let mut cache = SessionCache::new();

    let ev = cache.apply(Delta::Restarted(vec![ns("a", "u1", "1", NamespacePhase::Active)]));
    assert_eq!(verbs(&ev), vec![("a".to_string(), "added")]);
    assert_eq!(cache.epoch(), 1);

    // same revision replayed -> nothing
    let ev = cache.apply(Delta::Applied(ns("a", "u1", "1", NamespacePhase::Active)));
    assert!(ev.is_empty());

    let ev = cache.apply(Delta::Applied(ns("a", "u1", "2", NamespacePhase::Terminating)));
    match ev.as_slice() {
        [WatchEvent::Updated(old, new)] => {
            assert_eq!(old.namespace_phase(), Some(NamespacePhase::Active));
            assert_eq!(new.namespace_phase(), Some(NamespacePhase::Terminating));
        }
        other => panic!("expected one update, got {:?}", other),
    }

    let ev = cache.apply(Delta::Deleted(ns("a", "u1", "3", NamespacePhase::Terminating)));
    assert_eq!(verbs(&ev), vec![("a".to_string(), "deleted")]);
    assert!(cache.is_empty());

    let snap = cache.freeze();
    assert_eq!(snap.epoch, 4);
    assert!(snap.items.is_empty());
}

#[test]
fn relist_emits_deletes_for_vanished_objects() {
    let mut cache = SessionCache::new();
    cache.apply(Delta::Restarted(vec![
        ns("a", "u1", "1", NamespacePhase::Active),
        ns("b", "u2", "1", NamespacePhase::Active),
    ]));
    let ev = cache.apply(Delta::Restarted(vec![
        ns("b", "u2", "1", NamespacePhase::Active),
        ns("c", "u3", "1", NamespacePhase::Active),
    ]));
    assert_eq!(verbs(&ev), vec![("a".to_string(), "deleted"), ("c".to_string(), "added")]);
    let snap = cache.freeze();
    let names: Vec<&str> = snap.items.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["b", "c"]);
    assert!(snap.get(&ResourceIdentity::namespace("c")).is_some());
}

#[test]
fn new_generation_without_observed_delete_is_split() {
    let mut cache = SessionCache::new();
    cache.apply(Delta::Applied(ns("demo", "old", "1", NamespacePhase::Active)));
    let ev = cache.apply(Delta::Applied(ns("demo", "new", "9", NamespacePhase::Active)));
    match ev.as_slice() {
        [WatchEvent::Deleted(old), WatchEvent::Added(new)] => {
            assert_eq!(old.uid, "old");
            assert_eq!(new.uid, "new");
        }
        other => panic!("expected delete+add, got {:?}", other),
    }
}

#[test]
fn delete_of_unknown_object_is_still_dispatched() {
    let mut cache = SessionCache::new();
    let ev = cache.apply(Delta::Deleted(ns("ghost", "u9", "5", NamespacePhase::Terminating)));
    assert_eq!(verbs(&ev), vec![("ghost".to_string(), "deleted")]);
    assert_eq!(cache.len(), 0);
}
