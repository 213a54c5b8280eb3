use super::*;
use dsrepl_types::ReplicaGeneration;
use std::sync::atomic::{AtomicUsize, Ordering};

struct CountingStore(AtomicUsize);

impl TombstoneStore for CountingStore {
    fn purge_tombstones_before(&self, _purge_csn: Csn) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst);
        3
    }
}

fn replica() -> Replica {
    Replica::new(
        "dc=example,dc=com",
        Rid::new(1),
        ReplicaType::ReadWrite,
        ReplicaGeneration::new("deadbeef000100000000"),
        7 * 86400,
        86400,
    )
}

#[test]
fn exclusive_acquire_then_busy_then_relinquish() {
    let r = replica();
    assert_eq!(
        r.exclusive_acquire(true, Some(Purl::new("ldap://a:389"))),
        AcquireOutcome::Granted
    );
    assert_eq!(
        r.exclusive_acquire(true, Some(Purl::new("ldap://b:389"))),
        AcquireOutcome::Busy(Some(Purl::new("ldap://a:389")))
    );
    r.relinquish();
    assert_eq!(
        r.exclusive_acquire(true, Some(Purl::new("ldap://b:389"))),
        AcquireOutcome::Granted
    );
}

#[test]
fn assign_then_commit_drops_min_csn_pl_once_ruv_carries_it() {
    let r = replica();
    let csn = Csn::new(100, 0, Rid::new(1), 0);
    r.assign_csn_callback(csn, &[]);
    assert!(r.min_csn_pl.lock().unwrap().as_ref().unwrap().len() == 1);
    r.update_ruv(csn, None, true, LastModified::new(100)).unwrap();
    assert!(r.min_csn_pl.lock().unwrap().is_none());
}

#[test]
fn abort_csn_callback_removes_from_both_lists() {
    let r = replica();
    let csn = Csn::new(100, 0, Rid::new(1), 0);
    r.assign_csn_callback(csn, &[]);
    r.abort_csn_callback(csn);
    assert_eq!(r.min_csn_pl.lock().unwrap().as_ref().unwrap().len(), 0);
    assert!(r.update_ruv(csn, None, true, LastModified::new(100)).is_err());
}

#[test]
fn tombstone_reap_respects_stop_flag() {
    let r = replica();
    let csn = Csn::new(1_000_000, 0, Rid::new(1), 0);
    r.assign_csn_callback(csn, &[]);
    r.update_ruv(csn, None, true, LastModified::new(1_000_000)).unwrap();
    r.set_tombstone_reap_stop(true);
    let store = CountingStore(AtomicUsize::new(0));
    let outcome = r.tombstone_reap(&store);
    assert!(outcome.stopped_early);
    assert_eq!(store.0.load(Ordering::SeqCst), 0);
}

#[test]
fn tombstone_reap_computes_purge_csn_from_max_minus_delay() {
    let r = replica();
    let csn = Csn::new(1_000_000, 0, Rid::new(1), 0);
    r.assign_csn_callback(csn, &[]);
    r.update_ruv(csn, None, true, LastModified::new(1_000_000)).unwrap();
    let store = CountingStore(AtomicUsize::new(0));
    let outcome = r.tombstone_reap(&store);
    assert!(!outcome.stopped_early);
    assert_eq!(outcome.purge_csn.unwrap().timestamp(), 1_000_000 - 7 * 86400);
    assert_eq!(outcome.purged, 3);
}

#[test]
fn reload_ruv_detects_generation_change() {
    let r = replica();
    let other_gen = Ruv::new(ReplicaGeneration::new("00000000000000000000"), Rid::new(1), None);
    let changelog_bound = Ruv::new(ReplicaGeneration::new("00000000000000000000"), Rid::new(1), None);
    assert_eq!(
        r.reload_ruv(&other_gen, &changelog_bound),
        ReloadOutcome::GenerationChanged
    );
}
