//! Replica Update Vector: per-origin summary of observed min/max CSNs,
//! used to decide which updates must ship to a peer and whether an
//! incremental session is even possible.
//!
//! Grounded on
//! `original_source/ldap/servers/plugins/replication/repl5_ruv.c`
//! (`ruv_add_csn_inprogress`, `ruv_update_ruv`, `ruv_covers_csn`,
//! `ruv_covers_ruv`, `ruv_compare_ruv`, the `{replicageneration}`/
//! `{replica ...}` text serialization) and the teacher's
//! struct-of-fields-plus-serde pattern in `kimberlite-vsr::message`.

use std::fmt::{self, Display, Write as _};
use std::str::FromStr;
use std::sync::RwLock;

use dsrepl_types::{Csn, LastModified, ParseCsnError, Purl, ReplicaGeneration, Rid};

use crate::pending_list::{InsertOutcome, PendingList};

/// Errors produced by RUV operations. Mirrors the `RUV_*` result codes of
/// `spec.md` §7 that are reachable in safe Rust (allocation-failure codes
/// like `RUV_MEMORY_ERROR` have no counterpart here).
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RuvError {
    /// The RUV already covers this CSN (idempotent replay) or its origin
    /// is in the cleaned-rid set; the caller should treat this as success.
    #[error("csn {0} already covered")]
    CoversCsn(Csn),
    /// No element exists for the given replica id.
    #[error("no ruv element for rid {0}")]
    NotFound(Rid),
    /// `add_replica` was called for a rid that already has an element.
    #[error("ruv element for rid {0} already exists")]
    AlreadyExists(Rid),
    /// The element's pending list rejected the operation.
    #[error("pending list error: {0}")]
    PendingList(#[from] crate::pending_list::PlError),
    /// `deserialize` was given text that doesn't match the expected format.
    #[error("malformed ruv text: {0}")]
    BadFormat(String),
}

/// `{rid, purl?, min_csn?, max_csn?, last_modified, csnpl}` — `spec.md` §3.
#[derive(Debug)]
pub struct RuvElement {
    rid: Rid,
    purl: Option<Purl>,
    min_csn: Option<Csn>,
    max_csn: Option<Csn>,
    last_modified: LastModified,
    csnpl: PendingList,
}

impl RuvElement {
    fn new(rid: Rid, purl: Option<Purl>) -> Self {
        Self {
            rid,
            purl,
            min_csn: None,
            max_csn: None,
            last_modified: LastModified::default(),
            csnpl: PendingList::new(),
        }
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn purl(&self) -> Option<&Purl> {
        self.purl.as_ref()
    }

    pub fn min_csn(&self) -> Option<Csn> {
        self.min_csn
    }

    pub fn max_csn(&self) -> Option<Csn> {
        self.max_csn
    }

    pub fn last_modified(&self) -> LastModified {
        self.last_modified
    }
}

/// Structured outcome of [`Ruv::compare`], used by the protocol state
/// machine to decide between incremental shipping and a full resync
/// (`ruv_compare_ruv`, repl5_ruv.c, condensed from its `RUV_COMP_*` codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuvCompareOutcome {
    /// Every element matches exactly.
    Identical,
    /// The local RUV is ahead of (covers) the remote one.
    LocalAhead,
    /// The remote RUV is ahead of (covers) the local one.
    RemoteAhead,
    /// Neither side covers the other; some elements are ahead on each side.
    Diverged,
    /// The two RUVs carry different replica generations.
    GenerationMismatch,
}

struct RuvInner {
    elements: Vec<RuvElement>,
}

/// `{repl_gen, elements[], rwlock}` — `spec.md` §3, §4.3.
///
/// `repl_gen` never changes after construction; `elements` insertion order
/// is semantically significant (local replica first, others in arrival
/// order). All structural edits take the inner writer lock; `covers`/
/// `compare`/`serialize` take the reader lock.
pub struct Ruv {
    repl_gen: ReplicaGeneration,
    inner: RwLock<RuvInner>,
}

impl Ruv {
    /// Creates a new RUV seeded with a single local element.
    pub fn new(repl_gen: ReplicaGeneration, local_rid: Rid, local_purl: Option<Purl>) -> Self {
        Self {
            repl_gen,
            inner: RwLock::new(RuvInner {
                elements: vec![RuvElement::new(local_rid, local_purl)],
            }),
        }
    }

    /// Creates an empty RUV (no elements) stamped with `repl_gen` — the
    /// shape of a freshly-initialized or pristine peer.
    pub fn empty(repl_gen: ReplicaGeneration) -> Self {
        Self {
            repl_gen,
            inner: RwLock::new(RuvInner { elements: Vec::new() }),
        }
    }

    pub fn replica_generation(&self) -> &ReplicaGeneration {
        &self.repl_gen
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, RuvInner> {
        self.inner.read().expect("ruv lock poisoned")
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, RuvInner> {
        self.inner.write().expect("ruv lock poisoned")
    }

    /// Applies `f` to a read-only snapshot of the elements, in order.
    pub fn with_elements<R>(&self, f: impl FnOnce(&[RuvElement]) -> R) -> R {
        f(&self.lock_read().elements)
    }

    /// Adds a structural element for `rid` with no CSNs yet
    /// (`ruv_add_replica`, repl5_ruv.c).
    pub fn add_replica(&self, rid: Rid, purl: Option<Purl>) -> Result<(), RuvError> {
        let mut inner = self.lock_write();
        if inner.elements.iter().any(|e| e.rid == rid) {
            return Err(RuvError::AlreadyExists(rid));
        }
        inner.elements.push(RuvElement::new(rid, purl));
        Ok(())
    }

    /// Removes the element for `rid` (CLEANALLRUV completion).
    pub fn delete_replica(&self, rid: Rid) -> Result<(), RuvError> {
        let mut inner = self.lock_write();
        let pos = inner
            .elements
            .iter()
            .position(|e| e.rid == rid)
            .ok_or(RuvError::NotFound(rid))?;
        inner.elements.remove(pos);
        Ok(())
    }

    /// Replaces the purl of an existing element.
    pub fn replace_purl(&self, rid: Rid, purl: Purl) -> Result<(), RuvError> {
        let mut inner = self.lock_write();
        let elem = inner
            .elements
            .iter_mut()
            .find(|e| e.rid == rid)
            .ok_or(RuvError::NotFound(rid))?;
        elem.purl = Some(purl);
        Ok(())
    }

    /// Restores the invariant that the local rid is at index 0
    /// (`ruv_move_local_supplier_to_first`, repl5_ruv.c).
    pub fn move_local_first(&self, local_rid: Rid) -> Result<(), RuvError> {
        let mut inner = self.lock_write();
        let pos = inner
            .elements
            .iter()
            .position(|e| e.rid == local_rid)
            .ok_or(RuvError::NotFound(local_rid))?;
        if pos != 0 {
            let elem = inner.elements.remove(pos);
            inner.elements.insert(0, elem);
        }
        Ok(())
    }

    fn covers_internal(inner: &RuvInner, csn: Csn, strict: bool) -> bool {
        match inner.elements.iter().find(|e| e.rid == csn.rid()) {
            None => false,
            Some(elem) => match elem.max_csn {
                None => false,
                Some(max) => {
                    if strict {
                        csn < max
                    } else {
                        csn <= max
                    }
                }
            },
        }
    }

    /// True iff the element for `csn.rid()` exists and its `max_csn >= csn`
    /// (`ruv_covers_csn`, repl5_ruv.c).
    pub fn covers(&self, csn: Csn) -> bool {
        Self::covers_internal(&self.lock_read(), csn, false)
    }

    /// Strict variant: `max_csn > csn` (`ruv_covers_csn_strict`).
    pub fn covers_strict(&self, csn: Csn) -> bool {
        Self::covers_internal(&self.lock_read(), csn, true)
    }

    /// Locates (creating if absent) the element for `csn.rid()` and
    /// inserts `csn` into its pending list
    /// (`ruv_add_csn_inprogress`, repl5_ruv.c). `cleaned_rids` is the
    /// system-wide CLEANALLRUV set; a cleaned rid never gets a fresh
    /// element and always reports [`RuvError::CoversCsn`] (the caller
    /// should consume the update without performing it).
    pub fn add_csn_inprogress(&self, csn: Csn, cleaned_rids: &[Rid]) -> Result<(), RuvError> {
        let mut inner = self.lock_write();
        if cleaned_rids.contains(&csn.rid()) {
            return Err(RuvError::CoversCsn(csn));
        }
        if Self::covers_internal(&inner, csn, false) {
            return Err(RuvError::CoversCsn(csn));
        }
        if !inner.elements.iter().any(|e| e.rid == csn.rid()) {
            inner.elements.push(RuvElement::new(csn.rid(), None));
        }
        let elem = inner
            .elements
            .iter_mut()
            .find(|e| e.rid == csn.rid())
            .expect("element just inserted or already present");
        match elem.csnpl.insert(csn) {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::AlreadySeen => Err(RuvError::CoversCsn(csn)),
        }
    }

    /// Removes an uncommitted CSN from its origin's pending list, aborting
    /// an operation that failed before commit
    /// (`ruv_cancel_csn_inprogress`, repl5_ruv.c).
    pub fn cancel_csn_inprogress(&self, csn: Csn) -> Result<(), RuvError> {
        let mut inner = self.lock_write();
        let elem = inner
            .elements
            .iter_mut()
            .find(|e| e.rid == csn.rid())
            .ok_or(RuvError::NotFound(csn.rid()))?;
        elem.csnpl.remove(csn)?;
        Ok(())
    }

    /// Commits `csn` in its origin's pending list, rolls up the
    /// contiguous committed prefix, and advances `max_csn` (and, on the
    /// first roll-up ever seen for this element, `min_csn` — local and
    /// remote origins alike, mirroring `ruv_set_min_csn`'s call in
    /// `replica_update_ruv`, repl5_replica.c, once its own `min_csn_pl`
    /// drains) (`ruv_update_ruv`, repl5_ruv.c).
    ///
    /// Idempotent: a `csn` already folded into `max_csn` returns
    /// [`RuvError::CoversCsn`] rather than erroring on the since-removed
    /// pending-list entry (`spec.md` §8 invariant 4).
    ///
    /// `is_local` no longer changes this element's own behavior (both
    /// origins set `min_csn` the same way) but is kept on the signature
    /// for symmetry with [`Replica::update_ruv`](crate::replica::Replica::update_ruv),
    /// which still needs it to decide whether to drain `min_csn_pl`.
    ///
    /// Returns the roll-up's largest CSN if one occurred, `None` if the
    /// head of the pending list was not yet committed.
    pub fn update_ruv(
        &self,
        csn: Csn,
        purl: Option<Purl>,
        _is_local: bool,
        now: LastModified,
    ) -> Result<Option<Csn>, RuvError> {
        let mut inner = self.lock_write();
        if Self::covers_internal(&inner, csn, false) {
            return Err(RuvError::CoversCsn(csn));
        }
        let elem = inner
            .elements
            .iter_mut()
            .find(|e| e.rid == csn.rid())
            .ok_or(RuvError::NotFound(csn.rid()))?;
        elem.csnpl.commit(csn)?;
        let Some(rollup) = elem.csnpl.roll_up() else {
            return Ok(None);
        };
        if elem.min_csn.is_none() {
            elem.min_csn = Some(rollup.first_committed);
        }
        elem.max_csn = Some(rollup.largest_committed);
        elem.last_modified = now;
        if let Some(purl) = purl {
            elem.purl = Some(purl);
        }
        Ok(Some(rollup.largest_committed))
    }

    /// Element-wise `covers` over every element of `other`, after
    /// verifying matching replica generations (`ruv_covers_ruv`,
    /// repl5_ruv.c).
    pub fn dominates(&self, other: &Ruv) -> bool {
        if self.repl_gen != other.repl_gen {
            return false;
        }
        let other_inner = other.lock_read();
        let self_inner = self.lock_read();
        other_inner
            .elements
            .iter()
            .filter_map(|e| e.max_csn)
            .all(|csn| Self::covers_internal(&self_inner, csn, false))
    }

    /// Structured comparison used by the protocol state machine to
    /// choose between incremental replication and full resync
    /// (`ruv_compare_ruv`, repl5_ruv.c).
    pub fn compare(&self, other: &Ruv) -> RuvCompareOutcome {
        if self.repl_gen != other.repl_gen {
            return RuvCompareOutcome::GenerationMismatch;
        }
        let local_ahead = self.dominates(other);
        let remote_ahead = other.dominates(self);
        match (local_ahead, remote_ahead) {
            (true, true) => RuvCompareOutcome::Identical,
            (true, false) => RuvCompareOutcome::LocalAhead,
            (false, true) => RuvCompareOutcome::RemoteAhead,
            (false, false) => RuvCompareOutcome::Diverged,
        }
    }

    /// Textual serialization: `{replicageneration} <gen>` followed by one
    /// `{replica <rid> <purl>} <min_csn> <max_csn> [<last_modified>]`
    /// line per element (`ruv_element_to_string`, repl5_ruv.c).
    pub fn serialize(&self) -> String {
        let inner = self.lock_read();
        let mut out = format!("{{replicageneration}} {}\n", self.repl_gen);
        for elem in &inner.elements {
            let purl = elem.purl.as_ref().map_or("", Purl::as_str);
            let _ = write!(out, "{{replica {} {}}}", elem.rid, purl);
            if let Some(min) = elem.min_csn {
                let _ = write!(out, " {min}");
            } else {
                out.push_str(" -");
            }
            if let Some(max) = elem.max_csn {
                let _ = write!(out, " {max}");
            } else {
                out.push_str(" -");
            }
            let _ = writeln!(out, " {}", elem.last_modified);
        }
        out
    }

    /// Inverse of [`Self::serialize`]. Round-trips exactly except that
    /// absent CSNs remain absent and element order follows the text's
    /// line order.
    pub fn deserialize(text: &str) -> Result<Ruv, RuvError> {
        let mut lines = text.lines();
        let gen_line = lines
            .next()
            .ok_or_else(|| RuvError::BadFormat("empty ruv text".into()))?;
        let repl_gen = gen_line
            .strip_prefix("{replicageneration} ")
            .ok_or_else(|| RuvError::BadFormat(format!("missing generation header: {gen_line:?}")))?;
        let ruv = Ruv::empty(ReplicaGeneration::new(repl_gen));
        let mut inner = ruv.lock_write();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let rest = line
                .strip_prefix("{replica ")
                .ok_or_else(|| RuvError::BadFormat(format!("missing replica header: {line:?}")))?;
            let (header, fields) = rest
                .split_once('}')
                .ok_or_else(|| RuvError::BadFormat(format!("unterminated replica header: {line:?}")))?;
            let mut header_parts = header.splitn(2, ' ');
            let rid: u16 = header_parts
                .next()
                .ok_or_else(|| RuvError::BadFormat(format!("missing rid: {line:?}")))?
                .parse()
                .map_err(|_| RuvError::BadFormat(format!("bad rid: {line:?}")))?;
            let purl_str = header_parts.next().unwrap_or("");
            let purl = if purl_str.is_empty() {
                None
            } else {
                Some(Purl::new(purl_str))
            };
            let mut field_iter = fields.split_whitespace();
            let parse_opt_csn = |f: Option<&str>| -> Result<Option<Csn>, RuvError> {
                match f {
                    None | Some("-") => Ok(None),
                    Some(s) => Csn::from_str(s)
                        .map(Some)
                        .map_err(|e: ParseCsnError| RuvError::BadFormat(e.to_string())),
                }
            };
            let min_csn = parse_opt_csn(field_iter.next())?;
            let max_csn = parse_opt_csn(field_iter.next())?;
            let last_modified = match field_iter.next() {
                Some(s) => LastModified::from_str(s)
                    .map_err(|e| RuvError::BadFormat(e.to_string()))?,
                None => LastModified::default(),
            };
            inner.elements.push(RuvElement {
                rid: Rid::new(rid),
                purl,
                min_csn,
                max_csn,
                last_modified,
                csnpl: PendingList::new(),
            });
        }
        drop(inner);
        Ok(ruv)
    }
}

impl Display for Ruv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}
