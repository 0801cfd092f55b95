//! Ready-made [`JobObserver`] implementations.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, info, warn};

use crate::capability::{JobEvent, JobObserver};

/// Turns every lifecycle event into a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl JobObserver for TracingObserver {
    fn notify(&self, event: &JobEvent) {
        match event {
            JobEvent::JobStarted { job } => info!(job = %job, "job started"),
            JobEvent::CheckStarted { job, check } => {
                info!(job = %job, check = %check, "check started")
            }
            JobEvent::CheckFailed {
                job,
                check,
                message,
                cause,
            } => warn!(
                job = %job,
                check = %check,
                cause = cause.as_deref().unwrap_or("-"),
                "check failed: {message}"
            ),
            JobEvent::RemediationFailed {
                job,
                remediation,
                error,
            } => warn!(job = %job, remediation = %remediation, "remediation failed: {error}"),
            JobEvent::JobFailed { job, cause } => error!(job = %job, "job failed: {cause}"),
            JobEvent::JobSucceeded { job } => info!(job = %job, "job succeeded"),
        }
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<JobEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, predicate: impl Fn(&JobEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| predicate(event))
            .count()
    }
}

impl JobObserver for EventLog {
    fn notify(&self, event: &JobEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Broadcasts each event to several observers, in order.
#[derive(Default, Clone)]
pub struct Fanout {
    observers: Vec<Arc<dyn JobObserver>>,
}

impl Fanout {
    pub fn new(observers: Vec<Arc<dyn JobObserver>>) -> Self {
        Self { observers }
    }
}

impl JobObserver for Fanout {
    fn notify(&self, event: &JobEvent) {
        for observer in &self.observers {
            observer.notify(event);
        }
    }
}
