//! Checks e remediações baseados em comandos de shell.
//!
//! Ambos executam `sh -c <command>`. Exit status 0 é sucesso; qualquer outro
//! valor é falha, carregando o exit status e o stderr sem espaços nas pontas.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::capability::{
    Check, CheckContext, CheckError, CheckOutcome, Remediation, RemediationContext,
    RemediationError,
};

/// Intervalo de polling do processo filho, para saída ou cancelamento.
const CHILD_POLL: Duration = Duration::from_millis(50);

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Check que executa um comando de shell e mata o processo filho quando o
/// watchdog cancela a invocação.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    name: String,
    command: String,
}

impl CommandCheck {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

impl Check for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: &CheckContext) -> Result<CheckOutcome, CheckError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CheckError(format!("failed to spawn `{}`: {e}", self.command)))?;

        // Lê o stderr em outra thread para o pipe não encher.
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        let status = loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| CheckError(format!("failed to wait on `{}`: {e}", self.command)))?
            {
                break status;
            }
            if ctx.is_cancelled() {
                debug!(check = %self.name, "check cancelled, killing child");
                let _ = child.kill();
                let _ = child.wait();
                return Ok(CheckOutcome::fail("cancelled by watchdog"));
            }
            std::thread::sleep(CHILD_POLL);
        };

        let stderr = stderr
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        if status.success() {
            Ok(CheckOutcome::Pass)
        } else {
            Ok(CheckOutcome::Fail {
                message: describe(status),
                cause: non_empty(&stderr),
            })
        }
    }
}

/// Remediação assíncrona via `tokio::process`. O comando recebe
/// `OPSHEAL_JOB`, `OPSHEAL_ATTEMPT` e `OPSHEAL_LAST_FAILURE` no ambiente.
#[derive(Debug, Clone)]
pub struct CommandRemediation {
    name: String,
    command: String,
}

impl CommandRemediation {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

#[async_trait]
impl Remediation for CommandRemediation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, ctx: &RemediationContext) -> Result<(), RemediationError> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("OPSHEAL_JOB", &ctx.job)
            .env("OPSHEAL_ATTEMPT", ctx.attempt.to_string())
            .env("OPSHEAL_LAST_FAILURE", ctx.last_failure.to_string())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RemediationError(format!("failed to spawn `{}`: {e}", self.command)))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = match non_empty(&stderr) {
            Some(detail) => format!("{}: {detail}", describe(output.status)),
            None => describe(output.status),
        };
        Err(RemediationError(message))
    }
}
