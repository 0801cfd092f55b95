use thiserror::Error;

use crate::scheduler::Lifecycle;

#[derive(Debug, Error)]
pub enum OpsError {
    /// A job cannot be prepared for execution (unknown check, bad period, ...).
    #[error("Setup error for job '{job}': {reason}")]
    Setup { job: String, reason: String },

    #[error("Cannot {operation} a scheduler that is {state}")]
    InvalidState {
        operation: &'static str,
        state: Lifecycle,
    },

    #[error("Shutdown interrupted with {active} run(s) still active")]
    ShutdownInterrupted { active: usize },

    #[error("No Tokio runtime available to drive the scheduler")]
    NoRuntime,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, OpsError>;

impl OpsError {
    pub(crate) fn setup(job: &str, reason: impl Into<String>) -> Self {
        OpsError::Setup {
            job: job.to_string(),
            reason: reason.into(),
        }
    }
}
