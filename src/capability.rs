//! The seams the engine consumes: checks, remediation actions and observers.
//!
//! A [`Check`] is synchronous and may block for as long as it likes; the
//! executor runs it on the blocking pool under a watchdog. A [`Remediation`]
//! is asynchronous. A [`JobObserver`] receives every lifecycle [`JobEvent`]
//! as a fire-and-forget notification.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::state_machine::FailureCause;

/// Result of a check that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass,
    Fail {
        message: String,
        cause: Option<String>,
    },
}

impl CheckOutcome {
    pub fn fail(message: impl Into<String>) -> Self {
        CheckOutcome::Fail {
            message: message.into(),
            cause: None,
        }
    }
}

/// The check mechanism itself broke, as opposed to the check reporting a failure.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CheckError(pub String);

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RemediationError(pub String);

/// Per-invocation context handed to a [`Check`].
#[derive(Debug, Clone)]
pub struct CheckContext {
    job: String,
    cancel: CancellationToken,
}

impl CheckContext {
    pub fn new(job: &str, cancel: CancellationToken) -> Self {
        Self {
            job: job.to_string(),
            cancel,
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Set once the watchdog has given up on this invocation. Checks that
    /// poll it can stop early; the engine ignores their result either way.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A single pass/fail verification step.
///
/// Must be safe to invoke repeatedly: the executor re-runs every check after
/// each remediation attempt.
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError>;
}

/// Context handed to a [`Remediation`] attempt.
#[derive(Debug, Clone)]
pub struct RemediationContext {
    pub job: String,
    /// 1-based position of this attempt within the run.
    pub attempt: usize,
    pub last_failure: FailureCause,
}

/// An automated corrective step. Each call is a fresh attempt.
#[async_trait]
pub trait Remediation: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, ctx: &RemediationContext) -> Result<(), RemediationError>;
}

/// Lifecycle notifications emitted by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    JobStarted {
        job: String,
    },
    CheckStarted {
        job: String,
        check: String,
    },
    CheckFailed {
        job: String,
        check: String,
        message: String,
        cause: Option<String>,
    },
    RemediationFailed {
        job: String,
        remediation: String,
        error: String,
    },
    JobFailed {
        job: String,
        cause: FailureCause,
    },
    JobSucceeded {
        job: String,
    },
}

impl JobEvent {
    pub fn job(&self) -> &str {
        match self {
            JobEvent::JobStarted { job }
            | JobEvent::CheckStarted { job, .. }
            | JobEvent::CheckFailed { job, .. }
            | JobEvent::RemediationFailed { job, .. }
            | JobEvent::JobFailed { job, .. }
            | JobEvent::JobSucceeded { job } => job,
        }
    }
}

/// Receives lifecycle events. Must not block; slowness here stalls the run
/// that emitted the event.
pub trait JobObserver: Send + Sync {
    fn notify(&self, event: &JobEvent);
}
