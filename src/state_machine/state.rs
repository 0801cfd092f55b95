use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::{FailureCause, RunOutcome};

/// The four phases of a single run.
///
/// A run starts in `Checking`, bounces between `Checking` and `Remediating`
/// while remediation actions remain, and ends in `Succeeded` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Checking,
    Remediating,
    Succeeded,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Checking => write!(f, "CHECKING"),
            Phase::Remediating => write!(f, "REMEDIATING"),
            Phase::Succeeded => write!(f, "SUCCEEDED"),
            Phase::Failed => write!(f, "FAILED"),
        }
    }
}

/// Run state carrying the working remediation pool.
///
/// `A` is whatever the executor uses to represent a remediation action; the
/// transitions only ever take from the front and never put anything back.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState<A> {
    Checking { pool: Vec<A> },
    Remediating { pool: Vec<A>, last_failure: FailureCause },
    Succeeded,
    Failed(FailureCause),
}

impl<A> RunState<A> {
    /// Entry state of every run: the full, unmodified remediation list.
    pub fn initial(pool: Vec<A>) -> Self {
        RunState::Checking { pool }
    }

    pub fn phase(&self) -> Phase {
        match self {
            RunState::Checking { .. } => Phase::Checking,
            RunState::Remediating { .. } => Phase::Remediating,
            RunState::Succeeded => Phase::Succeeded,
            RunState::Failed(_) => Phase::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed(_))
    }

    /// The outcome of a terminal state, `None` while the run is in flight.
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self {
            RunState::Succeeded => Some(RunOutcome::Succeeded),
            RunState::Failed(cause) => Some(RunOutcome::Failed {
                cause: cause.clone(),
            }),
            _ => None,
        }
    }
}

/// How one full pass over the check sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckPass {
    AllPassed,
    /// A check reported failure or was abandoned by the watchdog.
    Failed(FailureCause),
    /// The check mechanism itself broke; remediation is skipped.
    Errored(String),
}

/// What to do next while in `Remediating`.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<A> {
    /// Apply `action`, then re-check with `remaining` as the pool.
    Attempt {
        action: A,
        remaining: Vec<A>,
        last_failure: FailureCause,
    },
    /// Nothing left to try.
    Exhausted(RunState<A>),
}

/// Pure transition rules for a run.
pub struct StateMachine;

impl StateMachine {
    /// Transition out of `Checking` once a pass over the checks has ended.
    pub fn after_checks<A>(pool: Vec<A>, pass: CheckPass) -> RunState<A> {
        match pass {
            CheckPass::AllPassed => RunState::Succeeded,
            CheckPass::Failed(last_failure) => RunState::Remediating { pool, last_failure },
            CheckPass::Errored(message) => RunState::Failed(FailureCause::Internal { message }),
        }
    }

    /// Take the next remediation from the front of the pool.
    pub fn next_remediation<A>(mut pool: Vec<A>, last_failure: FailureCause) -> Step<A> {
        if pool.is_empty() {
            return Step::Exhausted(RunState::Failed(last_failure));
        }
        let action = pool.remove(0);
        Step::Attempt {
            action,
            remaining: pool,
            last_failure,
        }
    }

    /// Transition after a remediation attempt. Success and failure both go
    /// back to `Checking` with the shrunken pool.
    pub fn after_remediation<A>(remaining: Vec<A>) -> RunState<A> {
        RunState::Checking { pool: remaining }
    }
}
