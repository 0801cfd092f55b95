//! Periodic job scheduler with per-job re-entrancy gating and cooperative
//! shutdown.
//!
//! All mutable scheduler state (lifecycle, active-run registry, pending
//! queue, timer handles) lives in one [`Mutex`]-guarded struct. The lock is
//! only held for membership checks and bookkeeping, never across a run.
//!
//! | Policy        | Concurrency                                       |
//! |---------------|---------------------------------------------------|
//! | `PerJob`      | One run per job, unbounded across distinct jobs   |
//! | `GlobalQueue` | One run system-wide; other due jobs wait in FIFO  |

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capability::{JobEvent, JobObserver};
use crate::error::{OpsError, Result};
use crate::executor::{ExecutorFactory, RunExecutor};
use crate::state_machine::{FailureCause, Job, RunReport};

/// Interval at which `stop` re-checks whether every active run has drained.
pub const DEFAULT_DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Idle,
    Running,
    Stopping,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Idle => write!(f, "IDLE"),
            Lifecycle::Running => write!(f, "RUNNING"),
            Lifecycle::Stopping => write!(f, "STOPPING"),
        }
    }
}

/// How ticks of distinct jobs are allowed to overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Each job runs at most once at a time; distinct jobs run in parallel.
    #[default]
    PerJob,
    /// At most one run system-wide; due jobs queue up in tick order.
    GlobalQueue,
}

/// Outcome notifications for [`JobScheduler::stop`].
pub trait ShutdownCallback: Send {
    fn on_shutdown_complete(&self);

    fn on_failure(&self, cause: OpsError);
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub policy: SchedulingPolicy,
    pub drain_poll: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicy::PerJob,
            drain_poll: DEFAULT_DRAIN_POLL,
        }
    }
}

struct Slot {
    period: Duration,
    executor: Arc<dyn RunExecutor>,
}

struct SchedulerState {
    lifecycle: Lifecycle,
    active: HashSet<String>,
    pending: VecDeque<String>,
    timers: Vec<JoinHandle<()>>,
}

struct Inner {
    slots: HashMap<String, Slot>,
    /// Job names in the order they were handed to the scheduler.
    order: Vec<String>,
    policy: SchedulingPolicy,
    drain_poll: Duration,
    observer: Arc<dyn JobObserver>,
    reports: Option<mpsc::UnboundedSender<RunReport>>,
    state: Mutex<SchedulerState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_tick(self: &Arc<Self>, name: &str) {
        let mut state = self.lock();
        if state.lifecycle != Lifecycle::Running {
            return;
        }

        match self.policy {
            SchedulingPolicy::PerJob => {
                if !state.active.insert(name.to_string()) {
                    debug!(job = %name, "previous run still active, tick dropped");
                    return;
                }
                drop(state);
                self.dispatch(name.to_string());
            }
            SchedulingPolicy::GlobalQueue => {
                if state.active.contains(name) || state.pending.iter().any(|p| p == name) {
                    debug!(job = %name, "job already active or queued, tick dropped");
                    return;
                }
                state.pending.push_back(name.to_string());
                if let Some(next) = Self::next_queued(&mut state) {
                    drop(state);
                    self.dispatch(next);
                }
            }
        }
    }

    /// Pop the next queued job if nothing else is running. Caller holds the lock.
    fn next_queued(state: &mut SchedulerState) -> Option<String> {
        if !state.active.is_empty() {
            return None;
        }
        let next = state.pending.pop_front()?;
        state.active.insert(next.clone());
        Some(next)
    }

    /// Start a run for a job already marked active. The run lives in its own
    /// task; completion is handled there.
    fn dispatch(self: &Arc<Self>, name: String) {
        let Some(slot) = self.slots.get(&name) else {
            error!(job = %name, "tick for unknown job");
            self.lock().active.remove(&name);
            return;
        };
        let executor = Arc::clone(&slot.executor);
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let run = tokio::spawn(async move { executor.run().await });
            let report = match run.await {
                Ok(report) => Some(report),
                Err(err) => {
                    error!(job = %name, "run task failed: {err}");
                    inner.observer.notify(&JobEvent::JobFailed {
                        job: name.clone(),
                        cause: FailureCause::Internal {
                            message: format!("run task failed: {err}"),
                        },
                    });
                    None
                }
            };
            inner.complete(&name, report);
        });
    }

    fn complete(self: &Arc<Self>, name: &str, report: Option<RunReport>) {
        if let Some(report) = report {
            info!(
                job = %name,
                run_id = %report.run_id,
                succeeded = report.succeeded(),
                duration_ms = report.duration_ms,
                "run completed"
            );
            if let Some(tx) = &self.reports {
                if tx.send(report).is_err() {
                    debug!(job = %name, "report receiver dropped");
                }
            }
        }

        let next = {
            let mut state = self.lock();
            state.active.remove(name);
            match (self.policy, state.lifecycle) {
                (SchedulingPolicy::GlobalQueue, Lifecycle::Running) => {
                    Self::next_queued(&mut state)
                }
                _ => None,
            }
        };

        // Already on a fresh task, so chaining here does not nest runs.
        if let Some(next) = next {
            self.dispatch(next);
        }
    }
}

/// Owns every job and fires them on their periods.
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    /// Prepare an executor for every job. Fails fast on the first job that
    /// cannot be prepared, on duplicate names, on zero periods and on a zero
    /// drain poll interval.
    pub fn new(
        jobs: Vec<Job>,
        factory: &dyn ExecutorFactory,
        observer: Arc<dyn JobObserver>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        if config.drain_poll.is_zero() {
            return Err(OpsError::Config(
                "drain poll interval must be greater than zero".into(),
            ));
        }
        let mut slots = HashMap::with_capacity(jobs.len());
        let mut order = Vec::with_capacity(jobs.len());

        for job in &jobs {
            if job.period().is_zero() {
                return Err(OpsError::setup(job.name(), "period must be greater than zero"));
            }
            if slots.contains_key(job.name()) {
                return Err(OpsError::setup(job.name(), "duplicate job name"));
            }
            let executor = factory.create_executor(job, Arc::clone(&observer))?;
            slots.insert(
                job.name().to_string(),
                Slot {
                    period: job.period(),
                    executor,
                },
            );
            order.push(job.name().to_string());
        }

        Ok(Self {
            inner: Arc::new(Inner {
                slots,
                order,
                policy: config.policy,
                drain_poll: config.drain_poll,
                observer,
                reports: None,
                state: Mutex::new(SchedulerState {
                    lifecycle: Lifecycle::Idle,
                    active: HashSet::new(),
                    pending: VecDeque::new(),
                    timers: Vec::new(),
                }),
            }),
        })
    }

    /// Forward every finished [`RunReport`] to `tx`. Must be called before `start`.
    pub fn with_report_channel(mut self, tx: mpsc::UnboundedSender<RunReport>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.reports = Some(tx);
        } else {
            warn!("scheduler already shared, report channel ignored");
        }
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lock().lifecycle
    }

    /// Names of jobs with a run in flight, sorted.
    pub fn active_runs(&self) -> Vec<String> {
        let mut active: Vec<String> = self.inner.lock().active.iter().cloned().collect();
        active.sort();
        active
    }

    pub fn job_names(&self) -> &[String] {
        &self.inner.order
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.inner.policy
    }

    /// Arm one recurring timer per job. The first tick fires immediately.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| OpsError::NoRuntime)?;

        let mut state = self.inner.lock();
        if state.lifecycle != Lifecycle::Idle {
            return Err(OpsError::InvalidState {
                operation: "start",
                state: state.lifecycle,
            });
        }
        state.lifecycle = Lifecycle::Running;

        for name in &self.inner.order {
            let period = self.inner.slots[name].period;
            let inner = Arc::clone(&self.inner);
            let name = name.clone();
            state.timers.push(runtime.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    inner.on_tick(&name);
                }
            }));
        }

        info!(
            jobs = self.inner.order.len(),
            policy = ?self.inner.policy,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop firing ticks and wait for every active run to finish.
    ///
    /// Misuse (not running) is returned as an error. The drain outcome is
    /// reported through `callback`.
    pub async fn stop(&self, callback: impl ShutdownCallback) -> Result<()> {
        self.stop_cancellable(callback, CancellationToken::new())
            .await
    }

    /// Like [`stop`](Self::stop), but the drain wait gives up once `cancel`
    /// fires. In that case `callback.on_failure` is invoked and the
    /// scheduler stays in `Stopping`: runs still in flight finish on their
    /// own, but it can neither be started nor stopped again.
    pub async fn stop_cancellable(
        &self,
        callback: impl ShutdownCallback,
        cancel: CancellationToken,
    ) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.lifecycle != Lifecycle::Running {
                return Err(OpsError::InvalidState {
                    operation: "stop",
                    state: state.lifecycle,
                });
            }
            state.lifecycle = Lifecycle::Stopping;
            for timer in state.timers.drain(..) {
                timer.abort();
            }
            state.pending.clear();
            info!(active = state.active.len(), "scheduler stopping");
        }

        let mut poll = tokio::time::interval(self.inner.drain_poll);
        loop {
            let active = self.inner.lock().active.len();
            if active == 0 {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(active, "shutdown wait interrupted");
                    callback.on_failure(OpsError::ShutdownInterrupted { active });
                    return Ok(());
                }
                _ = poll.tick() => {}
            }
        }

        self.inner.lock().lifecycle = Lifecycle::Idle;
        info!("scheduler stopped");
        callback.on_shutdown_complete();
        Ok(())
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        for timer in self.inner.lock().timers.drain(..) {
            timer.abort();
        }
    }
}
