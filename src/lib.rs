//! `opsheal`: self-healing operational checks.
//!
//! Jobs are periodic verifications with a remediation ladder. The
//! [`JobScheduler`] fires each job on its period and never lets two runs of
//! the same job overlap. Each run is driven by a [`RunExecutor`]: checks run
//! in order under a watchdog, and on failure remediation actions are tried
//! one at a time, re-running every check after each attempt, until the job
//! is healthy or the ladder is exhausted.

pub mod capability;
pub mod cli;
pub mod command;
pub mod config;
pub mod demo;
pub mod error;
pub mod executor;
pub mod observer;
pub mod registry;
pub mod scheduler;
pub mod state_machine;
pub mod ui;

pub use capability::{
    Check, CheckContext, CheckError, CheckOutcome, JobEvent, JobObserver, Remediation,
    RemediationContext, RemediationError,
};
pub use error::{OpsError, Result};
pub use executor::{CheckRemediateExecutor, CheckRemediateFactory, ExecutorFactory, RunExecutor};
pub use registry::CheckRegistry;
pub use scheduler::{JobScheduler, Lifecycle, SchedulerConfig, SchedulingPolicy, ShutdownCallback};
pub use state_machine::{FailureCause, Job, RunOutcome, RunReport};
