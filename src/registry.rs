use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::Check;
use crate::error::{OpsError, Result};
use crate::state_machine::Job;

/// Named checks that jobs refer to.
#[derive(Default, Clone)]
pub struct CheckRegistry {
    checks: HashMap<String, Arc<dyn Check>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check under its own name. A later registration with the
    /// same name replaces the earlier one.
    pub fn register(&mut self, check: Arc<dyn Check>) -> &mut Self {
        self.checks.insert(check.name().to_string(), check);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Check>> {
        self.checks.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Resolve every check a job refers to, in declaration order.
    pub fn resolve(&self, job: &Job) -> Result<Vec<Arc<dyn Check>>> {
        job.checks()
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| OpsError::setup(job.name(), format!("unknown check '{name}'")))
            })
            .collect()
    }
}
