use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use opsheal::cli::{Cli, Command};
use opsheal::config::EngineConfig;
use opsheal::demo::{self, Chaos, Service};
use opsheal::observer::{Fanout, TracingObserver};
use opsheal::ui::ConsoleObserver;
use opsheal::{
    CheckRemediateFactory, JobObserver, JobScheduler, OpsError, RunReport, ShutdownCallback,
};

/// Prints the shutdown outcome.
struct ConsoleShutdown;

impl ShutdownCallback for ConsoleShutdown {
    fn on_shutdown_complete(&self) {
        println!("{} all runs drained, shut down cleanly", Style::new().green().apply_to("✓"));
    }

    fn on_failure(&self, cause: OpsError) {
        eprintln!("{} shutdown incomplete: {cause}", Style::new().red().apply_to("✗"));
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

/// Config file, then environment, then CLI flags.
fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(policy) = cli.policy {
        config.policy = policy.into();
    }
    if let Some(secs) = cli.check_timeout_secs {
        config.check_timeout_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

fn observer(verbose: bool) -> Arc<dyn JobObserver> {
    let console: Arc<dyn JobObserver> = Arc::new(ConsoleObserver::new());
    if verbose {
        Arc::new(Fanout::new(vec![
            console,
            Arc::new(TracingObserver) as Arc<dyn JobObserver>,
        ]))
    } else {
        console
    }
}

/// Hook up report printing when `--audit` is set.
fn with_audit(scheduler: JobScheduler, audit: bool) -> (JobScheduler, Option<JoinHandle<()>>) {
    if !audit {
        return (scheduler, None);
    }
    let (tx, mut rx) = mpsc::unbounded_channel::<RunReport>();
    let printer = tokio::spawn(async move {
        let ui = ConsoleObserver::new();
        while let Some(report) = rx.recv().await {
            ui.print_report(&report);
        }
    });
    (scheduler.with_report_channel(tx), Some(printer))
}

/// Let the report printer flush what the last runs sent.
async fn finish_audit(scheduler: JobScheduler, printer: Option<JoinHandle<()>>) {
    drop(scheduler);
    if let Some(printer) = printer {
        let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    }
}

/// Stop the scheduler; a second Ctrl-C abandons the drain wait.
async fn shutdown(scheduler: &JobScheduler) -> Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });
    println!("stopping, waiting for active runs (Ctrl-C again to abandon)...");
    let result = scheduler.stop_cancellable(ConsoleShutdown, cancel).await;
    watcher.abort();
    result.map_err(Into::into)
}

async fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    if config.jobs.is_empty() {
        anyhow::bail!("no jobs configured in {}", cli.config.display());
    }
    let registry = Arc::new(config.build_registry()?);
    let factory = CheckRemediateFactory::new(registry).with_check_timeout(config.check_timeout());
    let scheduler = JobScheduler::new(
        config.build_jobs(),
        &factory,
        observer(cli.verbose),
        config.scheduler_config(),
    )?;
    let (scheduler, printer) = with_audit(scheduler, cli.audit);

    scheduler.start()?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    shutdown(&scheduler).await?;

    finish_audit(scheduler, printer).await;
    Ok(())
}

fn validate(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let registry = Arc::new(config.build_registry()?);
    let factory = CheckRemediateFactory::new(registry).with_check_timeout(config.check_timeout());
    let jobs = config.build_jobs();
    let summary: Vec<String> = jobs
        .iter()
        .map(|job| {
            format!(
                "  {} every {}s, {} check(s), {} remediation(s)",
                job.name(),
                job.period().as_secs(),
                job.checks().len(),
                job.remediations().len()
            )
        })
        .collect();

    let scheduler = JobScheduler::new(
        jobs,
        &factory,
        Arc::new(TracingObserver),
        config.scheduler_config(),
    )?;

    println!(
        "{} {} job(s) ready, policy {:?}, check timeout {}s",
        Style::new().green().apply_to("✓"),
        scheduler.job_names().len(),
        scheduler.policy(),
        config.check_timeout_secs
    );
    for line in summary {
        println!("{line}");
    }
    Ok(())
}

async fn run_demo(cli: &Cli, seconds: u64) -> Result<()> {
    let service = Arc::new(Service::default());
    let (registry, job) = demo::build(&service, Duration::from_secs(2));
    let factory = CheckRemediateFactory::new(Arc::new(registry))
        .with_check_timeout(Duration::from_secs(cli.check_timeout_secs.unwrap_or(5)));
    let mut config = opsheal::SchedulerConfig::default();
    if let Some(policy) = cli.policy {
        config.policy = policy.into();
    }
    let scheduler = JobScheduler::new(vec![job], &factory, observer(cli.verbose), config)?;
    let (scheduler, printer) = with_audit(scheduler, cli.audit);

    let chaos = Chaos::spawn(Arc::clone(&service), Duration::from_secs(3));
    scheduler.start()?;
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    drop(chaos);
    shutdown(&scheduler).await?;

    println!("service restarted {} time(s)", service.restarts());
    finish_audit(scheduler, printer).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Command::Run => run(&cli).await,
        Command::Validate => validate(&cli),
        Command::Demo { seconds } => run_demo(&cli, *seconds).await,
    }
}
