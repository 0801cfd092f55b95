//! Command-line interface built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (run, validate, demo) and
//! global flags that override values from the config file.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::DEFAULT_CONFIG_FILE;
use crate::scheduler::SchedulingPolicy;

/// opsheal: periodic health checks with automated remediation.
#[derive(Debug, Parser)]
#[command(name = "opsheal", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Scheduling policy, overriding the config file.
    #[arg(long, global = true)]
    pub policy: Option<PolicyArg>,

    /// Watchdog timeout per check in seconds, overriding config and environment.
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    pub check_timeout_secs: Option<u64>,

    /// Print a JSON report after every run.
    #[arg(long, global = true, default_value_t = false)]
    pub audit: bool,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    /// One run per job at a time; distinct jobs run in parallel.
    PerJob,
    /// One run at a time across all jobs.
    GlobalQueue,
}

impl From<PolicyArg> for SchedulingPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::PerJob => SchedulingPolicy::PerJob,
            PolicyArg::GlobalQueue => SchedulingPolicy::GlobalQueue,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run every configured job until interrupted with Ctrl-C.
    Run,

    /// Load the configuration and prepare every job without running anything.
    Validate,

    /// Run the built-in self-healing demo.
    Demo {
        /// How long to run before shutting down.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}
