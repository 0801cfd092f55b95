//! Terminal output for the `opsheal` binary: coloured event lines and
//! audit report printing.
//!
//! Uses the `console` crate for styling. Green is success, red is failure,
//! yellow marks remediation activity.

use console::Style;

use crate::capability::{JobEvent, JobObserver};
use crate::state_machine::RunReport;

/// Prints one coloured line per lifecycle event to stdout.
pub struct ConsoleObserver {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Default for ConsoleObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Render an event as a single line.
    pub fn render(&self, event: &JobEvent) -> String {
        match event {
            JobEvent::JobStarted { job } => {
                format!("{} [{job}] run started", self.dim.apply_to("▶"))
            }
            JobEvent::CheckStarted { job, check } => {
                format!("  {} [{job}] checking {check}", self.dim.apply_to("·"))
            }
            JobEvent::CheckFailed {
                job,
                check,
                message,
                cause,
            } => {
                let detail = cause.as_deref().map(|c| format!(" ({c})")).unwrap_or_default();
                format!(
                    "  {} [{job}] {check}: {message}{detail}",
                    self.red.apply_to("✗")
                )
            }
            JobEvent::RemediationFailed {
                job,
                remediation,
                error,
            } => format!(
                "  {} [{job}] remediation {remediation} failed: {error}",
                self.yellow.apply_to("↻")
            ),
            JobEvent::JobFailed { job, cause } => {
                format!("{} [{job}] job failed: {cause}", self.red.apply_to("✗"))
            }
            JobEvent::JobSucceeded { job } => {
                format!("{} [{job}] job healthy", self.green.apply_to("✓"))
            }
        }
    }

    /// Print a run report as pretty JSON under a coloured header.
    pub fn print_report(&self, report: &RunReport) {
        let style = if report.succeeded() {
            &self.green
        } else {
            &self.red
        };
        println!();
        println!("{}", style.apply_to(format!("─── Run Report: {} ───", report.job)));
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
    }
}

impl JobObserver for ConsoleObserver {
    fn notify(&self, event: &JobEvent) {
        println!("{}", self.render(event));
    }
}
