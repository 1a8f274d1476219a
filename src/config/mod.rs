//! Configuration module
//!
//! Run options come from three layers, later ones winning: a YAML or JSON
//! file, `TAPMUX_*` environment variables, then command-line flags.

mod env;
mod file;

pub use env::{EnvBuilder, EnvConfig, EnvGuard, ENV_PREFIX};
pub use file::{expand_path, CONFIG_LOCATIONS};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::executor::DriverConfig;
use crate::utils::LogLevel;

/// Options of one `tapmux run`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Work items run at once; defaults to the available parallelism
    pub concurrency: Option<usize>,

    /// Cancel the whole run on the first failing assertion
    pub stop_on_failure: bool,

    /// Default per-test timeout in milliseconds
    pub timeout_ms: Option<u64>,

    /// Run only tests marked `only`
    pub only: bool,

    pub log_level: LogLevel,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject values the runner cannot use
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            anyhow::bail!("concurrency must be at least 1");
        }
        if self.timeout_ms == Some(0) {
            anyhow::bail!("timeout must be at least 1ms");
        }
        Ok(())
    }

    /// Overlay variables that are set
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(concurrency) = env.concurrency {
            self.concurrency = Some(concurrency);
        }
        if let Some(stop_on_failure) = env.stop_on_failure {
            self.stop_on_failure = stop_on_failure;
        }
        if let Some(timeout_ms) = env.timeout_ms {
            self.timeout_ms = Some(timeout_ms);
        }
        if let Some(only) = env.only {
            self.only = only;
        }
        if let Some(level) = env.log_level.as_deref().and_then(LogLevel::from_str) {
            self.log_level = level;
        }
    }

    /// Effective concurrency limit, never zero
    pub fn concurrency(&self) -> usize {
        self.concurrency
            .filter(|n| *n > 0)
            .unwrap_or_else(default_concurrency)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            stop_on_failure: self.stop_on_failure,
            timeout: self.timeout(),
            only: self.only,
        }
    }

    /// Variables handed to child test programs
    pub fn child_env(&self) -> EnvBuilder {
        let mut vars = EnvBuilder::new()
            .stop_on_failure(self.stop_on_failure)
            .only(self.only);
        if let Some(timeout_ms) = self.timeout_ms {
            vars = vars.timeout_ms(timeout_ms);
        }
        vars
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
