// Lifecycle of one `run` call.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Beginning,
    Executing,
    Committing,
    BackingOff,
    Succeeded,
    Failed,
}

impl TxnState {
    pub fn can_transition_to(self, next: TxnState) -> bool {
        use TxnState::*;
        matches!(
            (self, next),
            (Beginning, Executing)
                | (Executing, Committing)
                | (Committing, Succeeded)
                | (Beginning | Executing | Committing, BackingOff | Failed)
                | (BackingOff, Beginning | Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Beginning => "beginning",
            Self::Executing => "executing",
            Self::Committing => "committing",
            Self::BackingOff => "backing_off",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Terminal status of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Committed,
    AbortedRetryable,
    /// Aborted, but the deadline leaves no room for another attempt.
    AbortedFatal,
    OtherError,
}

#[derive(Debug)]
pub(crate) struct StateTracker {
    current: TxnState,
}

impl StateTracker {
    pub(crate) fn new() -> Self {
        Self {
            current: TxnState::Beginning,
        }
    }

    pub(crate) fn current(&self) -> TxnState {
        self.current
    }

    pub(crate) fn advance(&mut self, next: TxnState) {
        if !self.current.can_transition_to(next) {
            tracing::warn!(from = %self.current, to = %next, "unexpected transaction state transition");
        }
        tracing::debug!(from = %self.current, to = %next, "transaction state");
        self.current = next;
    }
}
