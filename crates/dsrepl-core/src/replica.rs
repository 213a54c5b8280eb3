//! Replica: owns the local RUV, CSN generator, and min-CSN pending list,
//! and brokers all concurrent access to them.
//!
//! Grounded on
//! `original_source/ldap/servers/plugins/replication/repl5_replica.c`
//! (`replica_get_exclusive_access`/`replica_relinquish_exclusive_access`,
//! `replica_reload_ruv`, `_replica_get_purge_csn_nolock`/
//! `_replica_reap_tombstones`) and the teacher's flags-plus-mutex shape in
//! `kimberlite-vsr::replica::state::ReplicaState`.
//!
//! # Lock ordering
//!
//! `spec.md` §5 fixes the lock order `Replica.agmt_lock > Replica.lock >
//! RUV.lock > PL.lock`. [`Replica::assign_csn_callback`]/
//! [`Replica::abort_csn_callback`] take the replica lock and then the RUV
//! lock; they must never be invoked while the caller already holds
//! either (the CSN generator honors this by calling callbacks after
//! releasing its own lock — see `csn_generator.rs`).

use std::sync::{Arc, Mutex};

use dsrepl_types::{Csn, LastModified, Purl, ReplicaGeneration, ReplicaType, Rid};

use crate::pending_list::PendingList;
use crate::ruv::Ruv;

/// Bit-disjoint state flags tracked while the replica is acquired for an
/// outbound (or inbound total-update) session (`REPLICA_IN_USE` etc.,
/// repl5_replica.c).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct StateFlags {
    in_use: bool,
    incremental_in_progress: bool,
    total_in_progress: bool,
    agreements_disabled: bool,
}

struct ReplicaLock {
    flags: StateFlags,
    exclusive_lock_purl: Option<Purl>,
    tombstone_reap_stop: bool,
}

/// Outcome of [`Replica::exclusive_acquire`]
/// (`replica_get_exclusive_access`, repl5_replica.c).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Exclusive access was granted.
    Granted,
    /// Another session already holds the replica; carries its purl (if
    /// the holder supplied one).
    Busy(Option<Purl>),
}

/// Outcome of [`Replica::reload_ruv`] (`replica_reload_ruv`,
/// repl5_replica.c), observed by the protocol state machine to decide
/// whether outbound agreements must reinitialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The reloaded RUV is covered by the changelog and has the same
    /// generation: no action needed.
    Compatible,
    /// The reloaded RUV is not covered by the changelog's upper bound;
    /// the changelog must be destroyed and a fresh starting marker
    /// logged.
    ChangelogStale,
    /// The reloaded RUV carries a different replica generation; every
    /// outbound agreement must reinitialize.
    GenerationChanged,
}

/// Result of a [`Replica::tombstone_reap`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapOutcome {
    pub purge_csn: Option<Csn>,
    pub purged: usize,
    pub stopped_early: bool,
}

/// External collaborator contract for tombstone storage. Entry
/// add/modify/delete semantics are a non-goal (`spec.md` §1); this trait
/// is the typed seam the reaper calls through, mirroring how `spec.md`
/// §4.6 treats the changelog as an opaque interface.
pub trait TombstoneStore: Send + Sync {
    /// Deletes every tombstone whose deletion CSN precedes `purge_csn`,
    /// returning the number removed.
    fn purge_tombstones_before(&self, purge_csn: Csn) -> usize;
}

/// `{root_dn, repl_id, repl_type, ruv, csngen, min_csn_pl?, ...}` —
/// `spec.md` §3, §4.4.
pub struct Replica {
    root_dn: String,
    repl_id: Rid,
    repl_type: ReplicaType,
    ruv: Arc<std::sync::RwLock<Ruv>>,
    /// Exists iff the local rid has not yet produced any committed CSN;
    /// dropped once the RUV alone suffices (`spec.md` §3 invariant).
    min_csn_pl: Mutex<Option<PendingList>>,
    purge_delay_secs: u32,
    reap_interval_secs: u32,
    referrals: Mutex<Vec<String>>,
    lock: Mutex<ReplicaLock>,
}

impl Replica {
    pub fn new(
        root_dn: impl Into<String>,
        repl_id: Rid,
        repl_type: ReplicaType,
        repl_gen: ReplicaGeneration,
        purge_delay_secs: u32,
        reap_interval_secs: u32,
    ) -> Self {
        let ruv = Ruv::new(repl_gen, repl_id, None);
        let min_csn_pl = if repl_type.accepts_writes() {
            Some(PendingList::new())
        } else {
            None
        };
        Self {
            root_dn: root_dn.into(),
            repl_id,
            repl_type,
            ruv: Arc::new(std::sync::RwLock::new(ruv)),
            min_csn_pl: Mutex::new(min_csn_pl),
            purge_delay_secs,
            reap_interval_secs,
            referrals: Mutex::new(Vec::new()),
            lock: Mutex::new(ReplicaLock {
                flags: StateFlags::default(),
                exclusive_lock_purl: None,
                tombstone_reap_stop: false,
            }),
        }
    }

    pub fn root_dn(&self) -> &str {
        &self.root_dn
    }

    pub fn repl_id(&self) -> Rid {
        self.repl_id
    }

    pub fn repl_type(&self) -> ReplicaType {
        self.repl_type
    }

    pub fn reap_interval_secs(&self) -> u32 {
        self.reap_interval_secs
    }

    /// Shared ownership of the RUV (`Arc<RwLock<Ruv>>` per `spec.md` §9's
    /// design note on the event-queue/shutdown race).
    pub fn ruv(&self) -> Arc<std::sync::RwLock<Ruv>> {
        Arc::clone(&self.ruv)
    }

    pub fn referrals(&self) -> Vec<String> {
        self.referrals.lock().expect("replica lock poisoned").clone()
    }

    pub fn set_referrals(&self, referrals: Vec<String>) {
        *self.referrals.lock().expect("replica lock poisoned") = referrals;
    }

    /// Advisory mutex over an outbound replication window
    /// (`replica_get_exclusive_access`, repl5_replica.c). Never blocks:
    /// returns [`AcquireOutcome::Busy`] immediately if already held, so
    /// the caller can schedule a retry through backoff.
    pub fn exclusive_acquire(&self, is_incremental: bool, purl: Option<Purl>) -> AcquireOutcome {
        let mut lock = self.lock.lock().expect("replica lock poisoned");
        if lock.flags.in_use {
            return AcquireOutcome::Busy(lock.exclusive_lock_purl.clone());
        }
        lock.flags.in_use = true;
        if is_incremental {
            lock.flags.incremental_in_progress = true;
        } else {
            lock.flags.total_in_progress = true;
        }
        lock.exclusive_lock_purl = purl;
        AcquireOutcome::Granted
    }

    /// Clears the flag bits set at acquisition. Must be called by the
    /// same logical session that acquired it
    /// (`replica_relinquish_exclusive_access`, repl5_replica.c).
    pub fn relinquish(&self) {
        let mut lock = self.lock.lock().expect("replica lock poisoned");
        if !lock.flags.in_use {
            tracing::warn!(root_dn = %self.root_dn, "relinquish called without a held lock");
            return;
        }
        lock.flags.in_use = false;
        lock.flags.incremental_in_progress = false;
        lock.flags.total_in_progress = false;
        lock.exclusive_lock_purl = None;
    }

    /// True iff an incremental session currently holds the replica.
    pub fn is_incremental_in_progress(&self) -> bool {
        self.lock.lock().expect("replica lock poisoned").flags.incremental_in_progress
    }

    /// Invoked by the CSN generator when a CSN is assigned: inserts it
    /// into `min_csn_pl` (if present) and the local RUV element's
    /// pending list (`spec.md` §4.4).
    pub fn assign_csn_callback(&self, csn: Csn, cleaned_rids: &[Rid]) {
        if let Some(pl) = self.min_csn_pl.lock().expect("replica lock poisoned").as_mut() {
            pl.insert(csn);
        }
        if let Err(err) = self.ruv.read().expect("ruv arc poisoned").add_csn_inprogress(csn, cleaned_rids) {
            tracing::warn!(%csn, error = %err, "assign_csn_callback: ruv rejected in-progress csn");
        }
    }

    /// Invoked by the CSN generator when a CSN is aborted: removes it
    /// from both pending lists.
    pub fn abort_csn_callback(&self, csn: Csn) {
        if let Some(pl) = self.min_csn_pl.lock().expect("replica lock poisoned").as_mut() {
            let _ = pl.remove(csn);
        }
        if let Err(err) = self.ruv.read().expect("ruv arc poisoned").cancel_csn_inprogress(csn) {
            tracing::warn!(%csn, error = %err, "abort_csn_callback: ruv cancel failed");
        }
    }

    /// Wraps [`Ruv::update_ruv`] with the side effect that `min_csn_pl`
    /// is dropped once it has produced a committed roll-up: `Ruv::update_ruv`
    /// has already set the local element's `min_csn` from that roll-up, so
    /// `min_csn_pl`'s job is done (`ruv_set_min_csn` in `replica_update_ruv`,
    /// repl5_replica.c) (`spec.md` §4.4).
    pub fn update_ruv(
        &self,
        csn: Csn,
        purl: Option<Purl>,
        is_local: bool,
        now: LastModified,
    ) -> Result<Option<Csn>, crate::ruv::RuvError> {
        let result = self.ruv.read().expect("ruv arc poisoned").update_ruv(csn, purl, is_local, now)?;
        if is_local {
            let mut guard = self.min_csn_pl.lock().expect("replica lock poisoned");
            if let Some(pl) = guard.as_mut() {
                let _ = pl.commit(csn);
                pl.roll_up();
                if pl.is_empty() {
                    *guard = None;
                }
            }
        }
        Ok(result)
    }

    /// Re-reads the persisted RUV after an offline data reload, comparing
    /// it against the changelog's upper-bound RUV
    /// (`replica_reload_ruv`, repl5_replica.c).
    pub fn reload_ruv(&self, reloaded: &Ruv, changelog_upper_bound: &Ruv) -> ReloadOutcome {
        let current_gen = self.ruv.read().expect("ruv arc poisoned").replica_generation().clone();
        if reloaded.replica_generation() != &current_gen {
            return ReloadOutcome::GenerationChanged;
        }
        if !changelog_upper_bound.dominates(reloaded) {
            return ReloadOutcome::ChangelogStale;
        }
        ReloadOutcome::Compatible
    }

    /// Raises (or lowers) the concurrent `tombstone_reap_stop` flag; the
    /// total-update receive path raises it to prevent a reaper from
    /// destroying entries it is rebuilding (`spec.md` §4.4).
    pub fn set_tombstone_reap_stop(&self, stop: bool) {
        self.lock.lock().expect("replica lock poisoned").tombstone_reap_stop = stop;
    }

    /// Computes `purge_csn = max_csn_across_elements − purge_delay` and
    /// asks `store` to delete tombstones deleted before it, aborting
    /// immediately if `tombstone_reap_stop` is raised
    /// (`_replica_get_purge_csn_nolock`/`_replica_reap_tombstones`,
    /// repl5_replica.c).
    pub fn tombstone_reap(&self, store: &dyn TombstoneStore) -> ReapOutcome {
        if self.lock.lock().expect("replica lock poisoned").tombstone_reap_stop {
            return ReapOutcome {
                purge_csn: None,
                purged: 0,
                stopped_early: true,
            };
        }
        if self.purge_delay_secs == 0 {
            return ReapOutcome {
                purge_csn: None,
                purged: 0,
                stopped_early: false,
            };
        }
        let ruv = self.ruv.read().expect("ruv arc poisoned");
        let max_csn = ruv.with_elements(|elems| {
            elems
                .iter()
                .filter(|e| e.rid() != Rid::READ_ONLY)
                .filter_map(crate::ruv::RuvElement::max_csn)
                .max()
        });
        drop(ruv);
        let Some(max_csn) = max_csn else {
            return ReapOutcome {
                purge_csn: None,
                purged: 0,
                stopped_early: false,
            };
        };
        let purge_ts = max_csn.timestamp().saturating_sub(self.purge_delay_secs);
        let purge_csn = if purge_ts == max_csn.timestamp() {
            max_csn
        } else {
            Csn::new(purge_ts, max_csn.seq(), max_csn.rid(), max_csn.subseq())
        };
        if self.lock.lock().expect("replica lock poisoned").tombstone_reap_stop {
            return ReapOutcome {
                purge_csn: Some(purge_csn),
                purged: 0,
                stopped_early: true,
            };
        }
        let purged = store.purge_tombstones_before(purge_csn);
        tracing::info!(root_dn = %self.root_dn, %purge_csn, purged, "tombstone_reap complete");
        ReapOutcome {
            purge_csn: Some(purge_csn),
            purged,
            stopped_early: false,
        }
    }
}

#[cfg(test)]
mod tests;
