//! Changelog interface: external collaborator contract only.
//!
//! The on-disk changelog file format, entry encoding, and durability are
//! non-goals (`spec.md` §1); this module specifies the trait seam the
//! protocol state machine calls through, mirroring `spec.md` §4.6 and the
//! teacher's enum-as-contract pattern (`kimberlite-vsr::message::Message`).

use dsrepl_types::Csn;

use crate::ruv::Ruv;
use crate::wire::ModOp;

/// One committed directory operation as replayed to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub csn: Csn,
    pub target_uniqueid: String,
    pub kind: OperationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Add,
    Delete,
    Modify(Vec<(ModOp, String)>),
    ModRdn { new_superior_uniqueid: Option<String> },
}

/// Errors [`ChangelogReplayIterator`] creation can fail with
/// (`create_replay_iterator`, `spec.md` §4.6).
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ChangelogError {
    /// The peer's RUV references CSNs this changelog has already purged.
    #[error("changelog entries required by the peer's ruv have been purged")]
    Purged,
    /// No changelog exists for the requested replica.
    #[error("changelog not found")]
    NotFound,
    /// The peer's replica generation does not match the local one.
    #[error("replica generation mismatch")]
    GenerationMismatch,
}

/// An iterator over committed operations not covered by a peer RUV, in
/// commit order per origin (`spec.md` §4.6). Implementations are
/// provided by the surrounding server; this crate only depends on the
/// contract.
pub trait ChangelogReplayIterator {
    /// Returns the next operation, or `None` at end of stream.
    ///
    /// Per `spec.md` §4.6 the iterator may emit a sentinel "dummy"
    /// operation whose target unique id equals
    /// [`crate::wire::START_ITERATION_ENTRY_UNIQUEID`]; callers should
    /// skip these silently rather than treating them as real changes.
    fn get_next(&mut self) -> Result<Option<Operation>, ChangelogError>;
}

/// Opens a replay iterator over operations whose CSNs are not covered by
/// `peer_ruv` and whose origins are present in `local_ruv`
/// (`create_replay_iterator`, `spec.md` §4.6).
pub trait Changelog {
    type Iter: ChangelogReplayIterator;

    fn create_replay_iterator(
        &self,
        local_ruv: &Ruv,
        peer_ruv: &Ruv,
    ) -> Result<Self::Iter, ChangelogError>;

    /// Durable append; must be called *after* the backend has committed
    /// the operation to avoid a changelog entry without a corresponding
    /// data entry (`spec.md` §4.6).
    fn write_operation(&self, repl_gen: &str, op: &Operation);
}

/// True iff `op`'s target unique id is the dummy-iteration sentinel.
pub fn is_dummy_operation(op: &Operation) -> bool {
    op.target_uniqueid == crate::wire::START_ITERATION_ENTRY_UNIQUEID
}
