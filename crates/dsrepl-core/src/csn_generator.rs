//! CSN generator: produces strictly monotonic change sequence numbers for a
//! single replica, with bounded clock skew tolerance.
//!
//! # Monotonicity
//!
//! Every CSN handed out is strictly greater than every CSN this generator
//! has previously handed out or observed (via [`CsnGenerator::adjust_time`]).
//! The algorithm is the same `max(now, last)` clamp the teacher's cluster
//! clock uses for timestamp monotonicity (`clock.rs`'s `last_timestamp`
//! field), specialized to the `(timestamp, seq)` pair a CSN carries instead
//! of a single nanosecond counter:
//!
//! - if the wall clock has moved forward past the last issued timestamp,
//!   the new CSN starts a fresh second at `seq = 0`;
//! - otherwise the generator stays in the same virtual second and
//!   increments `seq`;
//! - if `seq` would overflow, the virtual second advances by one instead of
//!   wrapping, which keeps strict ordering even under a burst of more than
//!   65536 writes within one wall-clock second.
//!
//! # Callbacks
//!
//! [`CsnGenerator::new_csn`] and [`CsnGenerator::abort_csn`] invoke the
//! registered assign/abort callbacks *after* releasing the generator's
//! internal lock. Those callbacks are expected to take the replica lock and
//! then the RUV lock (see the module doc on lock ordering in `replica.rs`);
//! calling them while still holding the generator's own lock would invert
//! that order and deadlock the first time a callback itself needs a fresh
//! CSN.

use std::sync::{Arc, Mutex};

use dsrepl_types::{Csn, Rid};

/// A callback invoked when a CSN is assigned or aborted.
pub type CsnCallback = Arc<dyn Fn(Csn) + Send + Sync>;

/// Errors produced while generating or adjusting CSNs.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum CsnError {
    /// `adjust_time` was asked to jump the clock further than
    /// `max_clock_skew` seconds; the caller should treat this as fatal for
    /// the session (per `spec.md` §4.1).
    #[error("clock skew exceeded: observed CSN requires a {required_jump}s jump, max allowed is {threshold}s")]
    ClockSkewExceeded { required_jump: u32, threshold: u32 },
}

#[derive(Debug, Clone, Copy)]
struct GeneratorState {
    last: Csn,
}

/// Produces CSNs strictly greater than all previously produced or observed
/// CSNs for its replica.
pub struct CsnGenerator {
    rid: Rid,
    max_clock_skew: u32,
    state: Mutex<GeneratorState>,
    assign_cb: Option<CsnCallback>,
    abort_cb: Option<CsnCallback>,
}

impl CsnGenerator {
    /// Creates a generator for `rid` with no prior state and the given
    /// maximum tolerated clock skew (seconds).
    pub fn new(rid: Rid, max_clock_skew: u32) -> Self {
        Self {
            rid,
            max_clock_skew,
            state: Mutex::new(GeneratorState {
                last: Csn::new(0, 0, rid, 0),
            }),
            assign_cb: None,
            abort_cb: None,
        }
    }

    /// Registers the callback invoked whenever a CSN is assigned.
    pub fn set_assign_callback(&mut self, cb: CsnCallback) {
        self.assign_cb = Some(cb);
    }

    /// Registers the callback invoked whenever a CSN is aborted.
    pub fn set_abort_callback(&mut self, cb: CsnCallback) {
        self.abort_cb = Some(cb);
    }

    /// Produces a new CSN strictly greater than any previously issued one,
    /// clamping the caller's wall-clock reading to the generator's internal
    /// virtual clock.
    pub fn new_csn(&self, now_secs: u32) -> Csn {
        let csn = {
            let mut state = self.state.lock().expect("csn generator state poisoned");
            let clamped = now_secs.max(state.last.timestamp());
            let next = if clamped > state.last.timestamp() {
                Csn::new(clamped, 0, self.rid, 0)
            } else {
                match state.last.next_seq() {
                    Some(next) => next,
                    // seq would overflow: advance the virtual second instead
                    // of wrapping, per spec.md §4.1.
                    None => Csn::new(state.last.timestamp() + 1, 0, self.rid, 0),
                }
            };
            state.last = next;
            next
        };
        tracing::trace!(csn = %csn, "new_csn");
        if let Some(cb) = &self.assign_cb {
            cb(csn);
        }
        csn
    }

    /// Aborts a previously issued CSN, invoking the abort callback.
    ///
    /// Used to unwind an operation that acquired a CSN but failed before
    /// commit (see `Replica::abort_csn_callback` in `replica.rs`).
    pub fn abort_csn(&self, csn: Csn) {
        tracing::trace!(csn = %csn, "abort_csn");
        if let Some(cb) = &self.abort_cb {
            cb(csn);
        }
    }

    /// Raises the generator's internal clock so that it will produce CSNs
    /// strictly greater than `observed`, as required when adopting a peer's
    /// update vector.
    ///
    /// Fails with [`CsnError::ClockSkewExceeded`] if the jump required is
    /// larger than `max_clock_skew` seconds — this is fatal for the calling
    /// session (`spec.md` §4.1, §7).
    pub fn adjust_time(&self, observed: Csn, now_secs: u32) -> Result<(), CsnError> {
        let required = observed.timestamp().saturating_add(1);
        let mut state = self.state.lock().expect("csn generator state poisoned");
        if required <= state.last.timestamp() {
            return Ok(());
        }
        let baseline = state.last.timestamp().max(now_secs);
        let jump = required.saturating_sub(baseline);
        if jump > self.max_clock_skew {
            tracing::warn!(
                required_jump = jump,
                threshold = self.max_clock_skew,
                "clock skew exceeded"
            );
            return Err(CsnError::ClockSkewExceeded {
                required_jump: jump,
                threshold: self.max_clock_skew,
            });
        }
        if jump * 2 > self.max_clock_skew {
            tracing::warn!(
                required_jump = jump,
                threshold = self.max_clock_skew,
                "clock skew approaching configured threshold"
            );
        }
        state.last = Csn::new(required, 0, self.rid, 0);
        Ok(())
    }

    /// Returns the generator's committed clock state, for durable restart.
    pub fn get_state(&self) -> Csn {
        self.state.lock().expect("csn generator state poisoned").last
    }

    /// Restores the generator's clock state from a prior [`Self::get_state`].
    pub fn set_state(&self, last: Csn) {
        self.state.lock().expect("csn generator state poisoned").last = last;
    }
}
