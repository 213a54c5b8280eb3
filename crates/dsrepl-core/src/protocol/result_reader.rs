//! Asynchronous result reader: tracks in-flight update messages and
//! whether the consumer has acknowledged everything sent so far.
//!
//! Grounded on `repl5_inc_waitfor_async_results`
//! (repl5_inc_protocol.c), which polls once a second for up to 300
//! iterations before giving up. `spec.md` §4.5 generalizes the poll
//! interval to an exponential 1ms-to-1s backoff bounded by the same
//! 300s ceiling; this module exposes the interval sequence and lets the
//! caller (which owns the actual socket/timer) drive the sleep, since
//! transport I/O is out of scope here (`spec.md` §6).

use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use super::MAX_CHANGES_PER_SESSION;

const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    CaughtUp,
    Pending,
    /// The 300s drain ceiling elapsed with results still outstanding
    /// (`repl5_inc_waitfor_async_results`'s `loops > 300`).
    TimedOut,
}

/// Tracks message ids sent vs. acknowledged. `slots` is a bounded
/// semaphore so a session can never have more than
/// [`MAX_CHANGES_PER_SESSION`] results outstanding at once; one token is
/// taken per send and returned per acknowledgement.
pub struct AsyncResultReader {
    last_sent: u64,
    last_received: u64,
    slots: ArrayQueue<()>,
    poll_interval: Duration,
    elapsed: Duration,
}

impl AsyncResultReader {
    pub fn new() -> Self {
        let slots = ArrayQueue::new(MAX_CHANGES_PER_SESSION as usize);
        for _ in 0..MAX_CHANGES_PER_SESSION {
            let _ = slots.push(());
        }
        Self {
            last_sent: 0,
            last_received: 0,
            slots,
            poll_interval: INITIAL_POLL_INTERVAL,
            elapsed: Duration::ZERO,
        }
    }

    /// Records that an update was sent; returns its message id, or
    /// `None` if the outstanding-results backpressure limit is reached
    /// and the caller must wait for acknowledgements before sending more
    /// (`spec.md` §4.5).
    pub fn record_sent(&mut self) -> Option<u64> {
        self.slots.pop()?;
        self.last_sent += 1;
        Some(self.last_sent)
    }

    /// Records that the consumer acknowledged up through `message_id`.
    pub fn record_received(&mut self, message_id: u64) {
        if message_id <= self.last_received {
            return;
        }
        for _ in self.last_received..message_id {
            let _ = self.slots.push(());
        }
        self.last_received = message_id;
    }

    pub fn all_caught_up(&self) -> bool {
        self.last_received >= self.last_sent
    }

    /// Advances the poll-interval/elapsed-time tracking by one tick and
    /// returns the outcome plus the interval to sleep before the next
    /// tick (`spec.md` §4.5's 1ms→1s exponential schedule, capped by
    /// the 300s ceiling carried from `repl5_inc_waitfor_async_results`).
    pub fn poll_tick(&mut self) -> (ResultOutcome, Duration) {
        if self.all_caught_up() {
            self.poll_interval = INITIAL_POLL_INTERVAL;
            self.elapsed = Duration::ZERO;
            return (ResultOutcome::CaughtUp, Duration::ZERO);
        }
        self.elapsed += self.poll_interval;
        if self.elapsed >= super::ASYNC_RESULT_DRAIN_TIMEOUT {
            return (ResultOutcome::TimedOut, Duration::ZERO);
        }
        let next = self.poll_interval;
        self.poll_interval = (self.poll_interval * 2).min(MAX_POLL_INTERVAL);
        (ResultOutcome::Pending, next)
    }
}

impl Default for AsyncResultReader {
    fn default() -> Self {
        Self::new()
    }
}
