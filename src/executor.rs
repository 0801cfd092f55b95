//! Per-run check/remediate state machine.
//!
//! A [`CheckRemediateExecutor`] is prepared once per job (its checks are
//! resolved up front) and then driven once per scheduler tick. Every call to
//! [`RunExecutor::run`] starts from a fresh cursor and a fresh copy of the
//! remediation list, so nothing leaks from one run into the next.
//!
//! Checks run on the blocking pool under a watchdog. When the watchdog wins
//! the engine moves on, but the check thread is not killed: it keeps running
//! until it returns, and its late result is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capability::{
    Check, CheckContext, CheckOutcome, JobEvent, JobObserver, Remediation, RemediationContext,
};
use crate::error::Result;
use crate::registry::CheckRegistry;
use crate::state_machine::{
    CheckPass, FailureCause, Job, RunOutcome, RunReport, RunState, StateMachine, Step,
};

/// Watchdog timeout applied to every check unless configured otherwise.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(600);

/// Drives one job run from `Checking` to a terminal state.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn run(&self) -> RunReport;
}

/// Builds the executor for a job. Fails fast if the job cannot be prepared.
pub trait ExecutorFactory: Send + Sync {
    fn create_executor(
        &self,
        job: &Job,
        observer: Arc<dyn JobObserver>,
    ) -> Result<Arc<dyn RunExecutor>>;
}

/// Factory for [`CheckRemediateExecutor`]s backed by a [`CheckRegistry`].
#[derive(Clone)]
pub struct CheckRemediateFactory {
    registry: Arc<CheckRegistry>,
    check_timeout: Duration,
}

impl CheckRemediateFactory {
    pub fn new(registry: Arc<CheckRegistry>) -> Self {
        Self {
            registry,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_check_timeout(mut self, check_timeout: Duration) -> Self {
        self.check_timeout = check_timeout;
        self
    }
}

impl ExecutorFactory for CheckRemediateFactory {
    fn create_executor(
        &self,
        job: &Job,
        observer: Arc<dyn JobObserver>,
    ) -> Result<Arc<dyn RunExecutor>> {
        let executor =
            CheckRemediateExecutor::new(job, &self.registry, observer, self.check_timeout)?;
        Ok(Arc::new(executor))
    }
}

/// How a single watched check invocation ended.
enum Verdict {
    Passed,
    Failed {
        message: String,
        cause: Option<String>,
    },
    TimedOut,
    Errored(String),
}

pub struct CheckRemediateExecutor {
    job: String,
    checks: Vec<Arc<dyn Check>>,
    remediations: Vec<Arc<dyn Remediation>>,
    observer: Arc<dyn JobObserver>,
    check_timeout: Duration,
}

impl CheckRemediateExecutor {
    pub fn new(
        job: &Job,
        registry: &CheckRegistry,
        observer: Arc<dyn JobObserver>,
        check_timeout: Duration,
    ) -> Result<Self> {
        let checks = registry.resolve(job)?;
        Ok(Self {
            job: job.name().to_string(),
            checks,
            remediations: job.remediations().to_vec(),
            observer,
            check_timeout,
        })
    }

    fn emit(&self, event: JobEvent) {
        self.observer.notify(&event);
    }

    /// One full pass over the checks, stopping at the first that does not pass.
    async fn run_checks(&self, report: &mut RunReport) -> CheckPass {
        for check in &self.checks {
            let name = check.name().to_string();
            self.emit(JobEvent::CheckStarted {
                job: self.job.clone(),
                check: name.clone(),
            });
            report.checks_executed += 1;

            match self.execute_watched(check).await {
                Verdict::Passed => debug!(job = %self.job, check = %name, "check passed"),
                Verdict::Failed { message, cause } => {
                    self.emit(JobEvent::CheckFailed {
                        job: self.job.clone(),
                        check: name.clone(),
                        message: message.clone(),
                        cause: cause.clone(),
                    });
                    return CheckPass::Failed(FailureCause::CheckFailed {
                        check: name,
                        message,
                        cause,
                    });
                }
                Verdict::TimedOut => {
                    let after_ms = self.check_timeout.as_millis() as u64;
                    self.emit(JobEvent::CheckFailed {
                        job: self.job.clone(),
                        check: name.clone(),
                        message: format!("timed out after {after_ms}ms"),
                        cause: None,
                    });
                    return CheckPass::Failed(FailureCause::CheckTimedOut {
                        check: name,
                        after_ms,
                    });
                }
                Verdict::Errored(message) => {
                    return CheckPass::Errored(format!("check '{name}': {message}"));
                }
            }
        }
        CheckPass::AllPassed
    }

    async fn execute_watched(&self, check: &Arc<dyn Check>) -> Verdict {
        let cancel = CancellationToken::new();
        let ctx = CheckContext::new(&self.job, cancel.clone());
        let task_check = Arc::clone(check);
        let handle = tokio::task::spawn_blocking(move || task_check.execute(&ctx));

        match tokio::time::timeout(self.check_timeout, handle).await {
            Ok(Ok(Ok(CheckOutcome::Pass))) => Verdict::Passed,
            Ok(Ok(Ok(CheckOutcome::Fail { message, cause }))) => Verdict::Failed { message, cause },
            Ok(Ok(Err(err))) => Verdict::Errored(err.to_string()),
            Ok(Err(join)) => Verdict::Errored(format!("check task failed: {join}")),
            Err(_) => {
                // The blocking thread is left to finish on its own; dropping
                // the handle discards whatever it eventually returns.
                cancel.cancel();
                warn!(
                    job = %self.job,
                    check = check.name(),
                    timeout_ms = self.check_timeout.as_millis() as u64,
                    "watchdog fired, abandoning check"
                );
                Verdict::TimedOut
            }
        }
    }

    /// Apply one remediation in its own task. A reported failure is
    /// notified and swallowed; only a broken task is returned as an error.
    async fn apply_remediation(
        &self,
        action: Arc<dyn Remediation>,
        ctx: RemediationContext,
    ) -> std::result::Result<(), String> {
        let name = action.name().to_string();
        info!(job = %self.job, remediation = %name, attempt = ctx.attempt, "applying remediation");

        let task = tokio::spawn(async move { action.apply(&ctx).await });
        match task.await {
            Ok(Ok(())) => {
                debug!(job = %self.job, remediation = %name, "remediation applied");
                Ok(())
            }
            Ok(Err(err)) => {
                self.emit(JobEvent::RemediationFailed {
                    job: self.job.clone(),
                    remediation: name,
                    error: err.to_string(),
                });
                Ok(())
            }
            Err(join) => Err(format!("remediation '{name}' task failed: {join}")),
        }
    }
}

#[async_trait]
impl RunExecutor for CheckRemediateExecutor {
    async fn run(&self) -> RunReport {
        let mut report = RunReport::begin(&self.job);
        self.emit(JobEvent::JobStarted {
            job: self.job.clone(),
        });

        let mut state = RunState::initial(self.remediations.clone());
        let mut attempt = 0;

        loop {
            report.record_phase(state.phase());
            state = match state {
                RunState::Checking { pool } => {
                    let pass = self.run_checks(&mut report).await;
                    StateMachine::after_checks(pool, pass)
                }
                RunState::Remediating { pool, last_failure } => {
                    match StateMachine::next_remediation(pool, last_failure) {
                        Step::Exhausted(terminal) => terminal,
                        Step::Attempt {
                            action,
                            remaining,
                            last_failure,
                        } => {
                            attempt += 1;
                            report.remediations_attempted.push(action.name().to_string());
                            let ctx = RemediationContext {
                                job: self.job.clone(),
                                attempt,
                                last_failure,
                            };
                            match self.apply_remediation(action, ctx).await {
                                Ok(()) => StateMachine::after_remediation(remaining),
                                Err(message) => RunState::Failed(FailureCause::Internal { message }),
                            }
                        }
                    }
                }
                RunState::Succeeded => {
                    info!(job = %self.job, attempts = attempt, "run succeeded");
                    self.emit(JobEvent::JobSucceeded {
                        job: self.job.clone(),
                    });
                    return report.finish(RunOutcome::Succeeded);
                }
                RunState::Failed(cause) => {
                    error!(job = %self.job, attempts = attempt, "run failed: {cause}");
                    self.emit(JobEvent::JobFailed {
                        job: self.job.clone(),
                        cause: cause.clone(),
                    });
                    return report.finish(RunOutcome::Failed { cause });
                }
            };
            // Resume from the scheduler rather than nesting the next phase.
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CheckError, RemediationError};
    use crate::error::OpsError;
    use crate::observer::EventLog;
    use crate::state_machine::Phase;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, mpsc};

    /// Passes while `healthy` is set.
    struct FlagCheck {
        name: &'static str,
        healthy: Arc<AtomicBool>,
        calls: AtomicUsize,
    }

    impl FlagCheck {
        fn new(name: &'static str, healthy: Arc<AtomicBool>) -> Arc<Self> {
            Arc::new(Self {
                name,
                healthy,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Check for FlagCheck {
        fn name(&self) -> &str {
            self.name
        }

        fn execute(&self, _ctx: &CheckContext) -> std::result::Result<CheckOutcome, CheckError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(CheckOutcome::Pass)
            } else {
                Ok(CheckOutcome::Fail {
                    message: "unhealthy".into(),
                    cause: Some("flag unset".into()),
                })
            }
        }
    }

    struct BrokenCheck;

    impl Check for BrokenCheck {
        fn name(&self) -> &str {
            "broken"
        }

        fn execute(&self, _ctx: &CheckContext) -> std::result::Result<CheckOutcome, CheckError> {
            Err(CheckError("probe binary missing".into()))
        }
    }

    /// First call blocks until released, later calls pass at once.
    struct HangingCheck {
        release: Mutex<mpsc::Receiver<()>>,
        calls: AtomicUsize,
        saw_cancel: AtomicBool,
    }

    impl Check for HangingCheck {
        fn name(&self) -> &str {
            "hang"
        }

        fn execute(&self, ctx: &CheckContext) -> std::result::Result<CheckOutcome, CheckError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = self.release.lock().unwrap().recv();
                self.saw_cancel.store(ctx.is_cancelled(), Ordering::SeqCst);
            }
            Ok(CheckOutcome::Pass)
        }
    }

    /// Records its name into a shared log, optionally sets a flag, optionally fails.
    struct Scripted {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        heals: Option<Arc<AtomicBool>>,
        fails: bool,
    }

    #[async_trait]
    impl Remediation for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn apply(&self, ctx: &RemediationContext) -> std::result::Result<(), RemediationError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}#{}", self.name, ctx.attempt));
            if let Some(flag) = &self.heals {
                flag.store(true, Ordering::SeqCst);
            }
            if self.fails {
                Err(RemediationError("service refused to restart".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl Remediation for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn apply(&self, _ctx: &RemediationContext) -> std::result::Result<(), RemediationError> {
            panic!("remediation blew up");
        }
    }

    fn step(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        heals: Option<&Arc<AtomicBool>>,
        fails: bool,
    ) -> Arc<dyn Remediation> {
        Arc::new(Scripted {
            name,
            log: Arc::clone(log),
            heals: heals.cloned(),
            fails,
        })
    }

    fn executor(
        job: &Job,
        registry: &CheckRegistry,
        timeout: Duration,
    ) -> (CheckRemediateExecutor, Arc<EventLog>) {
        let log = Arc::new(EventLog::new());
        let exec = CheckRemediateExecutor::new(job, registry, log.clone(), timeout).unwrap();
        (exec, log)
    }

    fn job_started(job: &str) -> JobEvent {
        JobEvent::JobStarted { job: job.into() }
    }

    fn check_started(job: &str, check: &str) -> JobEvent {
        JobEvent::CheckStarted {
            job: job.into(),
            check: check.into(),
        }
    }

    #[tokio::test]
    async fn passing_check_succeeds_without_remediation() {
        let healthy = Arc::new(AtomicBool::new(true));
        let mut registry = CheckRegistry::new();
        registry.register(FlagCheck::new("ok", healthy));
        let job = Job::new("a", Duration::from_secs(1)).with_check("ok");

        let (exec, log) = executor(&job, &registry, DEFAULT_CHECK_TIMEOUT);
        let report = exec.run().await;

        assert!(report.succeeded());
        assert!(report.remediations_attempted.is_empty());
        assert_eq!(
            log.events(),
            vec![
                job_started("a"),
                check_started("a", "ok"),
                JobEvent::JobSucceeded { job: "a".into() },
            ]
        );
    }

    #[tokio::test]
    async fn failing_check_without_remediation_fails_immediately() {
        let healthy = Arc::new(AtomicBool::new(false));
        let mut registry = CheckRegistry::new();
        registry.register(FlagCheck::new("bad", healthy));
        let job = Job::new("b", Duration::from_secs(1)).with_check("bad");

        let (exec, log) = executor(&job, &registry, DEFAULT_CHECK_TIMEOUT);
        let report = exec.run().await;

        let cause = FailureCause::CheckFailed {
            check: "bad".into(),
            message: "unhealthy".into(),
            cause: Some("flag unset".into()),
        };
        assert_eq!(report.outcome, RunOutcome::Failed { cause: cause.clone() });
        assert_eq!(
            log.events(),
            vec![
                job_started("b"),
                check_started("b", "bad"),
                JobEvent::CheckFailed {
                    job: "b".into(),
                    check: "bad".into(),
                    message: "unhealthy".into(),
                    cause: Some("flag unset".into()),
                },
                JobEvent::JobFailed {
                    job: "b".into(),
                    cause,
                },
            ]
        );
        assert_eq!(
            report.phases,
            vec![Phase::Checking, Phase::Remediating, Phase::Failed]
        );
    }

    #[tokio::test]
    async fn successful_remediation_restarts_checks_and_succeeds() {
        let healthy = Arc::new(AtomicBool::new(false));
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CheckRegistry::new();
        let check = FlagCheck::new("svc", Arc::clone(&healthy));
        registry.register(check.clone());
        let job = Job::new("c", Duration::from_secs(1))
            .with_check("svc")
            .with_remediation(step("restart", &applied, Some(&healthy), false));

        let (exec, log) = executor(&job, &registry, DEFAULT_CHECK_TIMEOUT);
        let report = exec.run().await;

        assert!(report.succeeded());
        assert_eq!(*applied.lock().unwrap(), vec!["restart#1".to_string()]);
        assert_eq!(check.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.checks_executed, 2);
        assert_eq!(
            report.phases,
            vec![
                Phase::Checking,
                Phase::Remediating,
                Phase::Checking,
                Phase::Succeeded
            ]
        );
        assert_eq!(log.count(|e| matches!(e, JobEvent::CheckFailed { .. })), 1);
        assert_eq!(log.count(|e| matches!(e, JobEvent::JobSucceeded { .. })), 1);
    }

    #[tokio::test]
    async fn each_remediation_is_tried_once_in_order() {
        let healthy = Arc::new(AtomicBool::new(false));
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CheckRegistry::new();
        registry.register(FlagCheck::new("svc", healthy));
        let job = Job::new("d", Duration::from_secs(1))
            .with_check("svc")
            .with_remediation(step("restart", &applied, None, false))
            .with_remediation(step("flush", &applied, None, false))
            .with_remediation(step("reboot", &applied, None, false));

        let (exec, log) = executor(&job, &registry, DEFAULT_CHECK_TIMEOUT);
        let report = exec.run().await;

        assert!(!report.succeeded());
        assert_eq!(
            *applied.lock().unwrap(),
            vec!["restart#1", "flush#2", "reboot#3"]
        );
        assert_eq!(report.remediations_attempted, vec!["restart", "flush", "reboot"]);
        // One initial pass plus one re-check per remediation.
        assert_eq!(log.count(|e| matches!(e, JobEvent::CheckFailed { .. })), 4);
        assert_eq!(log.count(|e| matches!(e, JobEvent::JobFailed { .. })), 1);
    }

    #[tokio::test]
    async fn failed_remediation_still_rechecks() {
        let healthy = Arc::new(AtomicBool::new(false));
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CheckRegistry::new();
        registry.register(FlagCheck::new("svc", Arc::clone(&healthy)));
        // Reports failure but still fixes things; the re-check must notice.
        let job = Job::new("e", Duration::from_secs(1))
            .with_check("svc")
            .with_remediation(step("partial", &applied, Some(&healthy), true))
            .with_remediation(step("unused", &applied, None, false));

        let (exec, log) = executor(&job, &registry, DEFAULT_CHECK_TIMEOUT);
        let report = exec.run().await;

        assert!(report.succeeded());
        assert_eq!(*applied.lock().unwrap(), vec!["partial#1"]);
        assert!(log.events().contains(&JobEvent::RemediationFailed {
            job: "e".into(),
            remediation: "partial".into(),
            error: "service refused to restart".into(),
        }));
    }

    #[tokio::test]
    async fn checks_stop_at_first_failure_and_restart_from_the_top() {
        let first_ok = Arc::new(AtomicBool::new(true));
        let second_ok = Arc::new(AtomicBool::new(false));
        let applied = Arc::new(Mutex::new(Vec::new()));
        let first = FlagCheck::new("first", first_ok);
        let second = FlagCheck::new("second", Arc::clone(&second_ok));
        let third = FlagCheck::new("third", Arc::new(AtomicBool::new(true)));
        let mut registry = CheckRegistry::new();
        registry
            .register(first.clone())
            .register(second.clone())
            .register(third.clone());
        let job = Job::new("f", Duration::from_secs(1))
            .with_check("first")
            .with_check("second")
            .with_check("third")
            .with_remediation(step("fix", &applied, Some(&second_ok), false));

        let (exec, _log) = executor(&job, &registry, DEFAULT_CHECK_TIMEOUT);
        let report = exec.run().await;

        assert!(report.succeeded());
        assert_eq!(first.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.calls.load(Ordering::SeqCst), 2);
        assert_eq!(third.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn erroring_check_skips_remediation() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CheckRegistry::new();
        registry.register(Arc::new(BrokenCheck));
        let job = Job::new("g", Duration::from_secs(1))
            .with_check("broken")
            .with_remediation(step("restart", &applied, None, false));

        let (exec, log) = executor(&job, &registry, DEFAULT_CHECK_TIMEOUT);
        let report = exec.run().await;

        assert!(applied.lock().unwrap().is_empty());
        match report.outcome {
            RunOutcome::Failed {
                cause: FailureCause::Internal { message },
            } => assert!(message.contains("probe binary missing")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(log.count(|e| matches!(e, JobEvent::CheckFailed { .. })), 0);
        assert_eq!(log.count(|e| matches!(e, JobEvent::JobFailed { .. })), 1);
    }

    #[tokio::test]
    async fn panicking_remediation_fails_the_run() {
        let mut registry = CheckRegistry::new();
        registry.register(FlagCheck::new("svc", Arc::new(AtomicBool::new(false))));
        let applied = Arc::new(Mutex::new(Vec::new()));
        let job = Job::new("h", Duration::from_secs(1))
            .with_check("svc")
            .with_remediation(Arc::new(Panicking))
            .with_remediation(step("never", &applied, None, false));

        let (exec, _log) = executor(&job, &registry, DEFAULT_CHECK_TIMEOUT);
        let report = exec.run().await;

        assert!(matches!(
            report.outcome,
            RunOutcome::Failed {
                cause: FailureCause::Internal { .. }
            }
        ));
        assert!(applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn watchdog_abandons_hung_check_and_discards_late_result() {
        let (release, gate) = mpsc::channel();
        let check = Arc::new(HangingCheck {
            release: Mutex::new(gate),
            calls: AtomicUsize::new(0),
            saw_cancel: AtomicBool::new(false),
        });
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CheckRegistry::new();
        registry.register(check.clone());
        let job = Job::new("i", Duration::from_secs(1))
            .with_check("hang")
            .with_remediation(step("kick", &applied, None, false));

        let (exec, log) = executor(&job, &registry, Duration::from_millis(50));
        let report = exec.run().await;

        // The first invocation is still blocked, yet the run already finished.
        assert!(report.succeeded());
        assert_eq!(*applied.lock().unwrap(), vec!["kick#1"]);
        assert_eq!(
            log.events()[2],
            JobEvent::CheckFailed {
                job: "i".into(),
                check: "hang".into(),
                message: "timed out after 50ms".into(),
                cause: None,
            }
        );

        let before = log.events().len();
        release.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.events().len(), before);
        assert!(check.saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timed_out_check_without_remediation_fails_with_timeout_cause() {
        let (release, gate) = mpsc::channel();
        let check = Arc::new(HangingCheck {
            release: Mutex::new(gate),
            calls: AtomicUsize::new(0),
            saw_cancel: AtomicBool::new(false),
        });
        let mut registry = CheckRegistry::new();
        registry.register(check);
        let job = Job::new("j", Duration::from_secs(1)).with_check("hang");

        let (exec, _log) = executor(&job, &registry, Duration::from_millis(20));
        let report = exec.run().await;
        release.send(()).unwrap();

        assert_eq!(
            report.outcome,
            RunOutcome::Failed {
                cause: FailureCause::CheckTimedOut {
                    check: "hang".into(),
                    after_ms: 20,
                }
            }
        );
    }

    #[tokio::test]
    async fn executor_can_run_repeatedly_with_fresh_pool() {
        let healthy = Arc::new(AtomicBool::new(false));
        let applied = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CheckRegistry::new();
        registry.register(FlagCheck::new("svc", healthy));
        let job = Job::new("k", Duration::from_secs(1))
            .with_check("svc")
            .with_remediation(step("restart", &applied, None, false));

        let (exec, _log) = executor(&job, &registry, DEFAULT_CHECK_TIMEOUT);
        exec.run().await;
        exec.run().await;

        assert_eq!(*applied.lock().unwrap(), vec!["restart#1", "restart#1"]);
    }

    #[test]
    fn factory_rejects_unknown_check() {
        let factory = CheckRemediateFactory::new(Arc::new(CheckRegistry::new()));
        let job = Job::new("l", Duration::from_secs(1)).with_check("missing");
        let result = factory.create_executor(&job, Arc::new(EventLog::new()));
        assert!(matches!(result, Err(OpsError::Setup { .. })));
    }
}
