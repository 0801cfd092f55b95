//! Built-in self-healing scenario used by `opsheal demo`.
//!
//! A simulated service starts out down. Its job has two remediations: a
//! cache flush that always fails and a restart that brings the service back.
//! [`Chaos`] knocks the service over again at a fixed interval so the
//! remediation ladder gets exercised more than once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::capability::{
    Check, CheckContext, CheckError, CheckOutcome, Remediation, RemediationContext,
    RemediationError,
};
use crate::registry::CheckRegistry;
use crate::state_machine::Job;

pub const DEMO_JOB: &str = "demo-service";
const DEMO_CHECK: &str = "service-up";

/// Shared state of the simulated service.
#[derive(Debug, Default)]
pub struct Service {
    up: AtomicBool,
    restarts: AtomicU32,
}

impl Service {
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn crash(&self) {
        self.up.store(false, Ordering::SeqCst);
    }
}

struct ServiceCheck(Arc<Service>);

impl Check for ServiceCheck {
    fn name(&self) -> &str {
        DEMO_CHECK
    }

    fn execute(&self, _ctx: &CheckContext) -> Result<CheckOutcome, CheckError> {
        std::thread::sleep(Duration::from_millis(100));
        if self.0.is_up() {
            Ok(CheckOutcome::Pass)
        } else {
            Ok(CheckOutcome::Fail {
                message: "service not responding".into(),
                cause: Some("connection refused".into()),
            })
        }
    }
}

struct FlushCache;

#[async_trait]
impl Remediation for FlushCache {
    fn name(&self) -> &str {
        "flush-cache"
    }

    async fn apply(&self, _ctx: &RemediationContext) -> Result<(), RemediationError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(RemediationError("cache daemon unreachable".into()))
    }
}

struct Restart(Arc<Service>);

#[async_trait]
impl Remediation for Restart {
    fn name(&self) -> &str {
        "restart"
    }

    async fn apply(&self, _ctx: &RemediationContext) -> Result<(), RemediationError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.0.restarts.fetch_add(1, Ordering::SeqCst);
        self.0.up.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry and job for the demo, wired to `service`.
pub fn build(service: &Arc<Service>, period: Duration) -> (CheckRegistry, Job) {
    let mut registry = CheckRegistry::new();
    registry.register(Arc::new(ServiceCheck(Arc::clone(service))));
    let job = Job::new(DEMO_JOB, period)
        .with_check(DEMO_CHECK)
        .with_remediation(Arc::new(FlushCache))
        .with_remediation(Arc::new(Restart(Arc::clone(service))));
    (registry, job)
}

/// Crashes the service every `every`, until dropped.
pub struct Chaos {
    handle: tokio::task::JoinHandle<()>,
}

impl Chaos {
    pub fn spawn(service: Arc<Service>, every: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!("chaos: crashing {DEMO_JOB}");
                service.crash();
            }
        });
        Self { handle }
    }
}

impl Drop for Chaos {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
