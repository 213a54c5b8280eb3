//! Protocol states (`STATE_*`, repl5_inc_protocol.c; `spec.md` §4.5.1).

/// One state of the incremental replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    WaitWindowOpen,
    WaitChanges,
    ReadyToAcquire,
    BackoffStart,
    Backoff,
    SendingUpdates,
    StopFatalError,
    StopFatalErrorPart2,
    StopNormalTermination,
}

impl State {
    /// True for the two states the later historical fix
    /// (`spec.md` §9, DESIGN.md Open Question 4) lets `AgreementChanged`
    /// escape from.
    pub fn is_fatal_stop(self) -> bool {
        matches!(self, State::StopFatalError | State::StopFatalErrorPart2)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::StopNormalTermination)
    }
}
