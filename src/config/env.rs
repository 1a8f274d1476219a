//! Environment variable configuration
//!
//! Overrides for the config file, and the channel through which a parent
//! runner passes its settings down to child test programs.

use std::env;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "TAPMUX";

/// Configuration read from `TAPMUX_*` variables
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvConfig {
    /// TAPMUX_CONCURRENCY
    pub concurrency: Option<usize>,
    /// TAPMUX_BAIL
    pub stop_on_failure: Option<bool>,
    /// TAPMUX_TIMEOUT, in milliseconds
    pub timeout_ms: Option<u64>,
    /// TAPMUX_ONLY
    pub only: Option<bool>,
    /// TAPMUX_LOG
    pub log_level: Option<String>,
    /// TAPMUX_CONFIG
    pub config_file: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            concurrency: get_env_parse("CONCURRENCY"),
            stop_on_failure: get_env_bool("BAIL"),
            timeout_ms: get_env_parse("TIMEOUT"),
            only: get_env_bool("ONLY"),
            log_level: get_env("LOG"),
            config_file: get_env("CONFIG"),
        }
    }

    pub fn has_any(&self) -> bool {
        self.concurrency.is_some()
            || self.stop_on_failure.is_some()
            || self.timeout_ms.is_some()
            || self.only.is_some()
            || self.log_level.is_some()
            || self.config_file.is_some()
    }
}

pub fn var_name(name: &str) -> String {
    format!("{ENV_PREFIX}_{name}")
}

fn get_env(name: &str) -> Option<String> {
    env::var(var_name(name)).ok()
}

fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.trim().parse().ok())
}

fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Collects `TAPMUX_*` variables, for child processes or tests
#[derive(Clone, Debug, Default)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.vars.push((var_name("CONCURRENCY"), concurrency.to_string()));
        self
    }

    pub fn stop_on_failure(mut self, stop_on_failure: bool) -> Self {
        self.vars.push((var_name("BAIL"), stop_on_failure.to_string()));
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.vars.push((var_name("TIMEOUT"), timeout_ms.to_string()));
        self
    }

    pub fn only(mut self, only: bool) -> Self {
        self.vars.push((var_name("ONLY"), only.to_string()));
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.vars.push((var_name("LOG"), level.into()));
        self
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn into_vars(self) -> Vec<(String, String)> {
        self.vars
    }

    /// Apply to this process and return a guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        for (key, value) in self.vars {
            env::set_var(key, value);
        }

        EnvGuard { previous }
    }
}

/// Restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}
