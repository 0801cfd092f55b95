//! Configuração do motor e definições de jobs carregadas de `opsheal.toml`.
//!
//! Todo campo tem um valor padrão, então um arquivo ausente ou parcial funciona.
//! A variável de ambiente `OPSHEAL_CHECK_TIMEOUT_SECS` tem precedência sobre o
//! arquivo para o timeout do watchdog.
//!
//! ```toml
//! check_timeout_secs = 30
//! policy = "per_job"
//!
//! [[checks]]
//! name = "web-up"
//! command = "curl -sf http://localhost:8080/health"
//!
//! [[jobs]]
//! name = "web"
//! period_secs = 60
//! checks = ["web-up"]
//!
//! [[jobs.remediations]]
//! name = "restart"
//! command = "systemctl restart web"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::command::{CommandCheck, CommandRemediation};
use crate::error::{OpsError, Result};
use crate::registry::CheckRegistry;
use crate::scheduler::{SchedulerConfig, SchedulingPolicy};
use crate::state_machine::Job;

pub const DEFAULT_CONFIG_FILE: &str = "opsheal.toml";
pub const CHECK_TIMEOUT_ENV: &str = "OPSHEAL_CHECK_TIMEOUT_SECS";

#[derive(Debug, Clone, Deserialize)]
pub struct CheckDef {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemediationDef {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobDef {
    pub name: String,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default)]
    pub remediations: Vec<RemediationDef>,
}

/// Configuração de nível superior carregada de `opsheal.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Timeout do watchdog para um único check, em segundos.
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,

    /// Intervalo de polling do loop de drenagem no shutdown.
    #[serde(default = "default_drain_poll_ms")]
    pub drain_poll_ms: u64,

    #[serde(default)]
    pub policy: SchedulingPolicy,

    #[serde(default)]
    pub checks: Vec<CheckDef>,

    #[serde(default)]
    pub jobs: Vec<JobDef>,
}

// Valor padrão do timeout de check: dez minutos.
fn default_check_timeout_secs() -> u64 {
    600
}

fn default_drain_poll_ms() -> u64 {
    100
}

fn default_period_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_timeout_secs: default_check_timeout_secs(),
            drain_poll_ms: default_drain_poll_ms(),
            policy: SchedulingPolicy::default(),
            checks: Vec::new(),
            jobs: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Carrega a configuração de `path`. Usa valores padrão se o arquivo não
    /// existir e depois aplica a variável de ambiente.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<EngineConfig>(&contents)?
        } else {
            Self::default()
        };
        let config = config.with_timeout_override(std::env::var(CHECK_TIMEOUT_ENV).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Rejeita valores com os quais o motor não consegue rodar.
    pub fn validate(&self) -> Result<()> {
        if self.check_timeout_secs == 0 {
            return Err(OpsError::Config(
                "check_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Aplica um valor bruto de override para o timeout de check, como lido
    /// do ambiente. Valores vazios são ignorados.
    pub fn with_timeout_override(mut self, raw: Option<String>) -> Result<Self> {
        if let Some(raw) = raw.filter(|v| !v.trim().is_empty()) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                OpsError::Config(format!("{CHECK_TIMEOUT_ENV} must be an integer, got '{raw}'"))
            })?;
            if secs == 0 {
                return Err(OpsError::Config(format!(
                    "{CHECK_TIMEOUT_ENV} must be greater than zero"
                )));
            }
            self.check_timeout_secs = secs;
        }
        Ok(self)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            policy: self.policy,
            drain_poll: Duration::from_millis(self.drain_poll_ms.max(1)),
        }
    }

    /// Registra cada entrada `[[checks]]` como um [`CommandCheck`].
    pub fn build_registry(&self) -> Result<CheckRegistry> {
        let mut registry = CheckRegistry::new();
        let mut seen = HashSet::new();
        for def in &self.checks {
            if !seen.insert(def.name.as_str()) {
                return Err(OpsError::Config(format!("duplicate check '{}'", def.name)));
            }
            registry.register(Arc::new(CommandCheck::new(&def.name, &def.command)));
        }
        Ok(registry)
    }

    /// Converte cada entrada `[[jobs]]` em um [`Job`]. Os nomes de checks são
    /// resolvidos depois, quando o executor é construído.
    pub fn build_jobs(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .map(|def| {
                let job = def
                    .checks
                    .iter()
                    .fold(Job::new(&def.name, Duration::from_secs(def.period_secs)), |job, check| {
                        job.with_check(check)
                    });
                def.remediations.iter().fold(job, |job, r| {
                    job.with_remediation(Arc::new(CommandRemediation::new(&r.name, &r.command)))
                })
            })
            .collect()
    }
}
