//! Retry backoff: fixed for a busy peer, exponential for transient
//! errors, both bounded (`repl5_inc_protocol.c`'s busy-wait and
//! backoff-timer handling; `spec.md` §4.5, §6).

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// A single backoff window: fixed duration for a busy peer, or
/// exponential-with-jitter for repeated transient failures, capped at
/// `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    kind: BackoffKind,
    current: Duration,
    max: Duration,
    deadline: Instant,
}

impl Backoff {
    pub fn fixed(wait: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            current: wait,
            max: wait,
            deadline: Instant::now() + wait,
        }
    }

    pub fn exponential(min: Duration, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            current: min,
            max,
            deadline: Instant::now() + min,
        }
    }

    pub fn kind(&self) -> BackoffKind {
        self.kind
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Doubles the window (exponential only, jittered by up to 20%) and
    /// resets the deadline; a no-op for [`BackoffKind::Fixed`] since a
    /// busy wait does not escalate on repeat.
    pub fn retry(&mut self) {
        if self.kind == BackoffKind::Exponential {
            let doubled = self.current.saturating_mul(2).min(self.max);
            let jitter_ms = rand::thread_rng().gen_range(0..=doubled.as_millis() as u64 / 5);
            self.current = doubled;
            self.deadline = Instant::now() + doubled + Duration::from_millis(jitter_ms);
        } else {
            self.deadline = Instant::now() + self.current;
        }
    }
}
