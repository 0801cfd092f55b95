use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::Phase;
use crate::capability::Remediation;

/// Why a run left the `Checking` phase, or why it ended as `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// A check completed and reported failure.
    CheckFailed {
        check: String,
        message: String,
        cause: Option<String>,
    },
    /// The watchdog fired before the check returned.
    CheckTimedOut { check: String, after_ms: u64 },
    /// The check or remediation mechanism itself broke.
    Internal { message: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::CheckFailed {
                check,
                message,
                cause: Some(cause),
            } => write!(f, "check '{check}' failed: {message} ({cause})"),
            FailureCause::CheckFailed { check, message, .. } => {
                write!(f, "check '{check}' failed: {message}")
            }
            FailureCause::CheckTimedOut { check, after_ms } => {
                write!(f, "check '{check}' timed out after {after_ms}ms")
            }
            FailureCause::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed { cause: FailureCause },
}

/// A named, periodic verification unit with an ordered remediation ladder.
///
/// Checks are referenced by name and resolved when an executor is built.
/// Nothing here changes after construction.
#[derive(Clone)]
pub struct Job {
    name: String,
    period: Duration,
    checks: Vec<String>,
    remediations: Vec<Arc<dyn Remediation>>,
}

impl Job {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            checks: Vec::new(),
            remediations: Vec::new(),
        }
    }

    pub fn with_check(mut self, check: impl Into<String>) -> Self {
        self.checks.push(check.into());
        self
    }

    pub fn with_remediation(mut self, remediation: Arc<dyn Remediation>) -> Self {
        self.remediations.push(remediation);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn checks(&self) -> &[String] {
        &self.checks
    }

    pub fn remediations(&self) -> &[Arc<dyn Remediation>] {
        &self.remediations
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remediations: Vec<&str> = self.remediations.iter().map(|r| r.name()).collect();
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("checks", &self.checks)
            .field("remediations", &remediations)
            .finish()
    }
}

/// Structured audit record produced when a run completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub job: String,
    pub outcome: RunOutcome,
    pub phases: Vec<Phase>,
    /// Check invocations started during the run, across every pass.
    pub checks_executed: u32,
    pub remediations_attempted: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl RunReport {
    /// Open a report for a run that is starting now.
    pub fn begin(job: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            job: job.to_string(),
            outcome: RunOutcome::Succeeded,
            phases: Vec::new(),
            checks_executed: 0,
            remediations_attempted: Vec::new(),
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }

    pub fn record_phase(&mut self, phase: Phase) {
        self.phases.push(phase);
    }

    pub fn finish(mut self, outcome: RunOutcome) -> Self {
        let now = Utc::now();
        self.outcome = outcome;
        self.completed_at = now;
        self.duration_ms = (now - self.started_at).num_milliseconds();
        self
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }
}
