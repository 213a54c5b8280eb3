//! End-to-end scenarios from `spec.md` §8, wiring the state machine,
//! changelog contract, and RUV together the way a supplier session would.

use std::time::Duration;

use dsrepl_core::changelog::{Changelog, ChangelogError, ChangelogReplayIterator, Operation, OperationKind};
use dsrepl_core::pending_list::PendingList;
use dsrepl_core::protocol::{
    examine_update_vector, AcquireOutcome, ExamineRuvOutcome, ReplicationConnection, Session,
};
use dsrepl_core::replica::Replica;
use dsrepl_core::ruv::Ruv;
use dsrepl_types::{Csn, LastModified, Purl, ReplicaGeneration, ReplicaType, Rid};

/// In-memory changelog: filters its fixed operation set to whatever the
/// peer RUV hasn't seen, mirroring `create_replay_iterator`'s contract.
struct FakeChangelog {
    ops: Vec<Operation>,
}

struct FakeIter {
    remaining: std::vec::IntoIter<Operation>,
}

impl ChangelogReplayIterator for FakeIter {
    fn get_next(&mut self) -> Result<Option<Operation>, ChangelogError> {
        Ok(self.remaining.next())
    }
}

impl Changelog for FakeChangelog {
    type Iter = FakeIter;

    fn create_replay_iterator(&self, local_ruv: &Ruv, peer_ruv: &Ruv) -> Result<Self::Iter, ChangelogError> {
        let filtered: Vec<Operation> = self
            .ops
            .iter()
            .filter(|op| local_ruv.with_elements(|elems| elems.iter().any(|e| e.rid() == op.csn.rid())))
            .filter(|op| !peer_ruv.covers(op.csn))
            .cloned()
            .collect();
        Ok(FakeIter { remaining: filtered.into_iter() })
    }

    fn write_operation(&self, _repl_gen: &str, _op: &Operation) {}
}

fn add_op(ops: &mut Vec<Operation>, csn: Csn, uniqueid: &str) {
    ops.push(Operation {
        csn,
        target_uniqueid: uniqueid.to_string(),
        kind: OperationKind::Add,
    });
}

/// Supplier-side connection stub: `acquire_replica` always answers with
/// a fixed outcome, re-deserializing a fresh peer RUV each call (a `Ruv`
/// holds an `RwLock` so it cannot simply be cloned and reused).
struct FakeConn {
    outcome: FakeOutcome,
    peer_ruv_text: Option<String>,
    schema_pushed_to: Option<Csn>,
    push_schema_succeeds: bool,
    disconnected: bool,
}

#[derive(Clone, Copy)]
enum FakeOutcome {
    Success,
    Busy,
    ConsumerUpToDate,
    FatalError,
}

impl ReplicationConnection for FakeConn {
    fn acquire_replica(&mut self, _local_ruv: &Ruv) -> AcquireOutcome {
        match self.outcome {
            FakeOutcome::Success => AcquireOutcome::Success {
                peer_ruv: self.peer_ruv_text.as_deref().map(|t| Ruv::deserialize(t).unwrap()),
            },
            FakeOutcome::Busy => AcquireOutcome::Busy,
            FakeOutcome::ConsumerUpToDate => AcquireOutcome::ConsumerUpToDate,
            FakeOutcome::FatalError => AcquireOutcome::FatalError,
        }
    }

    fn push_schema(&mut self, consumer_schema_csn: Option<Csn>, local_schema_csn: Csn) -> bool {
        let _ = consumer_schema_csn;
        self.schema_pushed_to = Some(local_schema_csn);
        self.push_schema_succeeds
    }

    fn disconnect(&mut self) {
        self.disconnected = true;
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }
}

fn csn(ts: u32, rid: u16) -> Csn {
    Csn::new(ts, 0, Rid::new(rid), 0)
}

#[test]
fn s1_empty_consumer_ships_every_op_and_advances_its_ruv() {
    let gen_ = ReplicaGeneration::new("G");
    let purl_a = Purl::new("A");
    let supplier_ruv = Ruv::deserialize(&format!(
        "{{replicageneration}} {gen_}\n{{replica 1 A}} {} {} 0\n",
        csn(1, 1),
        csn(5, 1)
    ))
    .unwrap();
    let consumer_ruv = Ruv::empty(gen_.clone());

    assert_eq!(
        examine_update_vector(Some(&consumer_ruv), &supplier_ruv),
        ExamineRuvOutcome::Ok
    );

    let mut ops = Vec::new();
    for ts in 1..=5 {
        add_op(&mut ops, csn(ts, 1), &format!("entry-{ts}"));
    }
    let changelog = FakeChangelog { ops };

    let mut conn = FakeConn {
        outcome: FakeOutcome::Success,
        peer_ruv_text: Some(consumer_ruv.serialize()),
        schema_pushed_to: None,
        push_schema_succeeds: true,
        disconnected: false,
    };
    let mut session = Session::new(Purl::new("consumer"), csn(0, 1), Duration::from_secs(3));

    session.step(&mut conn, &supplier_ruv);
    assert_eq!(session.state, dsrepl_core::protocol::State::ReadyToAcquire);
    session.step(&mut conn, &supplier_ruv);
    assert_eq!(session.state, dsrepl_core::protocol::State::SendingUpdates);

    session.run_sending_updates(&mut conn, &changelog, &supplier_ruv);
    assert_eq!(session.num_changes_sent, 5);
    assert_eq!(session.state, dsrepl_core::protocol::State::WaitChanges);

    // Replay the shipped operations into the consumer's own RUV, as the
    // consumer side would upon applying each one.
    for ts in 1..=5 {
        let c = csn(ts, 1);
        consumer_ruv.add_csn_inprogress(c, &[]).unwrap();
        consumer_ruv.update_ruv(c, Some(purl_a.clone()), false, LastModified::new(0)).unwrap();
    }
    consumer_ruv.with_elements(|elems| {
        let elem = elems.iter().find(|e| e.rid() == Rid::new(1)).unwrap();
        assert_eq!(elem.min_csn(), Some(csn(1, 1)));
        assert_eq!(elem.max_csn(), Some(csn(5, 1)));
        assert_eq!(elem.purl().map(Purl::as_str), Some("A"));
    });
}

#[test]
fn s2_up_to_date_peer_ships_nothing() {
    let gen_ = ReplicaGeneration::new("G");
    let ruv_text = format!(
        "{{replicageneration}} {gen_}\n{{replica 1 A}} {} {} 0\n",
        csn(1, 1),
        csn(5, 1)
    );
    let supplier_ruv = Ruv::deserialize(&ruv_text).unwrap();

    let mut conn = FakeConn {
        outcome: FakeOutcome::ConsumerUpToDate,
        peer_ruv_text: None,
        schema_pushed_to: None,
        push_schema_succeeds: true,
        disconnected: false,
    };
    let mut session = Session::new(Purl::new("consumer"), csn(0, 1), Duration::from_secs(3));

    session.step(&mut conn, &supplier_ruv);
    session.step(&mut conn, &supplier_ruv);

    assert_eq!(session.state, dsrepl_core::protocol::State::WaitChanges);
    assert_eq!(session.num_changes_sent, 0);
}

#[test]
fn s3_generation_mismatch_backs_off_without_shipping() {
    let supplier_ruv = Ruv::deserialize(&format!(
        "{{replicageneration}} A\n{{replica 1 A}} {} {} 0\n",
        csn(1, 1),
        csn(5, 1)
    ))
    .unwrap();
    let consumer_ruv = Ruv::deserialize(&format!(
        "{{replicageneration}} B\n{{replica 1 A}} {} {} 0\n",
        csn(1, 1),
        csn(5, 1)
    ))
    .unwrap();

    assert_eq!(
        examine_update_vector(Some(&consumer_ruv), &supplier_ruv),
        ExamineRuvOutcome::GenerationMismatch
    );

    let mut ops = Vec::new();
    add_op(&mut ops, csn(6, 1), "entry-6");
    let changelog = FakeChangelog { ops };

    let mut conn = FakeConn {
        outcome: FakeOutcome::Success,
        peer_ruv_text: Some(consumer_ruv.serialize()),
        schema_pushed_to: None,
        push_schema_succeeds: true,
        disconnected: false,
    };
    let mut session = Session::new(Purl::new("consumer"), csn(0, 1), Duration::from_secs(3));

    session.step(&mut conn, &supplier_ruv);
    session.step(&mut conn, &supplier_ruv);
    assert_eq!(session.state, dsrepl_core::protocol::State::SendingUpdates);

    session.run_sending_updates(&mut conn, &changelog, &supplier_ruv);
    assert_eq!(session.state, dsrepl_core::protocol::State::BackoffStart);
    assert_eq!(session.num_changes_sent, 0);
}

#[test]
fn s4_concurrent_submit_and_commit_orders_by_csn_not_arrival() {
    let rid = Rid::new(1);
    let c_a = Csn::new(10, 0, rid, 0);
    let c_b = Csn::new(10, 1, rid, 0);
    assert!(c_a < c_b);

    let pl = std::sync::Mutex::new(PendingList::new());
    pl.lock().unwrap().insert(c_a);
    pl.lock().unwrap().insert(c_b);

    pl.lock().unwrap().commit(c_b).unwrap();
    // T-b's commit alone cannot roll up past the still-uncommitted c_a.
    assert!(pl.lock().unwrap().roll_up().is_none());
    let (head, committed) = pl.lock().unwrap().get_min().unwrap();
    assert_eq!(head, c_a);
    assert!(!committed);

    pl.lock().unwrap().commit(c_a).unwrap();
    let rollup = pl.lock().unwrap().roll_up().unwrap();
    assert_eq!(rollup.first_committed, c_a);
    assert_eq!(rollup.largest_committed, c_b);
    assert!(pl.lock().unwrap().is_empty());
}

#[test]
fn s5_busy_backoff_never_spins_faster_than_configured_wait() {
    let supplier_ruv = Ruv::new(ReplicaGeneration::new("G"), Rid::new(1), None);
    let busy_wait = Duration::from_secs(3);
    let mut conn = FakeConn {
        outcome: FakeOutcome::Busy,
        peer_ruv_text: None,
        schema_pushed_to: None,
        push_schema_succeeds: true,
        disconnected: false,
    };
    let mut session = Session::new(Purl::new("peer"), csn(0, 1), busy_wait);

    session.step(&mut conn, &supplier_ruv);
    session.step(&mut conn, &supplier_ruv);
    assert_eq!(session.state, dsrepl_core::protocol::State::Backoff);
    let backoff = session.backoff.as_ref().expect("busy acquire sets a backoff");
    assert_eq!(backoff.kind(), dsrepl_core::protocol::BackoffKind::Fixed);
    assert_eq!(backoff.current(), busy_wait);
    assert!(!backoff.expired());

    // Without BackoffExpired/ReplicateNow, repeated steps keep spinning in
    // `Backoff` rather than racing straight back into `SendingUpdates`.
    for _ in 0..5 {
        session.step(&mut conn, &supplier_ruv);
        assert_eq!(session.state, dsrepl_core::protocol::State::Backoff);
    }
}

#[test]
fn s6_schema_push_lag_on_success_advances_consumer_schema_csn() {
    let supplier_ruv = Ruv::new(ReplicaGeneration::new("G"), Rid::new(1), None);
    let local_schema_csn = csn(7, 1);
    let changelog = FakeChangelog { ops: Vec::new() };

    let mut conn = FakeConn {
        outcome: FakeOutcome::Success,
        peer_ruv_text: Some(Ruv::empty(ReplicaGeneration::new("G")).serialize()),
        schema_pushed_to: None,
        push_schema_succeeds: true,
        disconnected: false,
    };
    let mut session = Session::new(Purl::new("consumer"), local_schema_csn, Duration::from_secs(3));
    session.consumer_schema_csn = Some(csn(3, 1));

    session.step(&mut conn, &supplier_ruv);
    session.step(&mut conn, &supplier_ruv);
    assert_eq!(session.state, dsrepl_core::protocol::State::SendingUpdates);

    // Entering SendingUpdates pushes schema before examining the RUV or
    // draining the changelog.
    session.run_sending_updates(&mut conn, &changelog, &supplier_ruv);
    assert_eq!(conn.schema_pushed_to, Some(local_schema_csn));
    assert_eq!(session.consumer_schema_csn, Some(local_schema_csn));
    assert_eq!(session.state, dsrepl_core::protocol::State::WaitChanges);
}

#[test]
fn s6_schema_push_lag_failure_is_warn_only_and_session_continues() {
    let supplier_ruv = Ruv::new(ReplicaGeneration::new("G"), Rid::new(1), None);
    let local_schema_csn = csn(7, 1);
    let changelog = FakeChangelog { ops: Vec::new() };

    let mut conn = FakeConn {
        outcome: FakeOutcome::Success,
        peer_ruv_text: Some(Ruv::empty(ReplicaGeneration::new("G")).serialize()),
        schema_pushed_to: None,
        push_schema_succeeds: false,
        disconnected: false,
    };
    let mut session = Session::new(Purl::new("consumer"), local_schema_csn, Duration::from_secs(3));
    session.consumer_schema_csn = Some(csn(3, 1));

    session.step(&mut conn, &supplier_ruv);
    session.step(&mut conn, &supplier_ruv);
    assert_eq!(session.state, dsrepl_core::protocol::State::SendingUpdates);

    // A non-success push leaves consumer_schema_csn untouched but the
    // session proceeds into the same SendingUpdates work regardless.
    session.run_sending_updates(&mut conn, &changelog, &supplier_ruv);
    assert_eq!(conn.schema_pushed_to, Some(local_schema_csn));
    assert_eq!(session.consumer_schema_csn, Some(csn(3, 1)));
    assert_eq!(session.state, dsrepl_core::protocol::State::WaitChanges);
}

#[test]
fn fatal_acquire_error_stops_the_session() {
    let supplier_ruv = Ruv::new(ReplicaGeneration::new("G"), Rid::new(1), None);
    let mut conn = FakeConn {
        outcome: FakeOutcome::FatalError,
        peer_ruv_text: None,
        schema_pushed_to: None,
        push_schema_succeeds: true,
        disconnected: false,
    };
    let mut session = Session::new(Purl::new("peer"), csn(0, 1), Duration::from_secs(3));

    session.step(&mut conn, &supplier_ruv);
    session.step(&mut conn, &supplier_ruv);
    assert_eq!(session.state, dsrepl_core::protocol::State::StopFatalError);
}

#[test]
fn replica_reports_a_covered_csn_once_replayed() {
    let replica = Replica::new(
        "dc=example,dc=com",
        Rid::new(1),
        ReplicaType::ReadWrite,
        ReplicaGeneration::new("G"),
        7 * 86_400,
        86_400,
    );
    let c = csn(1, 1);
    replica.assign_csn_callback(c, &[]);
    replica.update_ruv(c, None, true, LastModified::new(1)).unwrap();
    assert!(replica.ruv().read().unwrap().covers(c));
}
