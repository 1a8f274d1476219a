//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::RunConfig;
use crate::utils::LogLevel;

/// Run test programs in parallel and merge their event streams
#[derive(Parser, Debug)]
#[command(name = "tapmux")]
#[command(author = "hephaex@gmail.com")]
#[command(version)]
#[command(about = "Run test programs in parallel without interleaving their output")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Log level for diagnostics on stderr (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run test programs as work items
    Run(RunArgs),

    /// Print the effective configuration
    Config(ConfigArgs),

    /// Print the JSON Schema of the event stream
    Schema,
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Test programs, one work item each
    #[arg(required = true)]
    pub programs: Vec<String>,

    /// Work items run at once
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Stop the run on the first failing assertion
    #[arg(short, long)]
    pub bail: bool,

    /// Default per-test timeout in milliseconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Run only tests marked `only`
    #[arg(long)]
    pub only: bool,

    /// Path to a configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl RunArgs {
    /// Flags win over file and environment
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(concurrency) = self.concurrency {
            config.concurrency = Some(concurrency);
        }
        if self.bail {
            config.stop_on_failure = true;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_ms = Some(timeout);
        }
        if self.only {
            config.only = true;
        }
    }
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Path to a configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Args {
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level.as_deref().and_then(LogLevel::from_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parsing() {
        let args = Args::parse_from([
            "tapmux",
            "run",
            "--concurrency",
            "3",
            "--bail",
            "--timeout",
            "500",
            "a.sh",
            "b.sh",
        ]);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.programs, vec!["a.sh", "b.sh"]);
                assert_eq!(run.concurrency, Some(3));
                assert!(run.bail);
                assert_eq!(run.timeout, Some(500));
                assert!(!run.only);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_requires_programs() {
        assert!(Args::try_parse_from(["tapmux", "run"]).is_err());
    }

    #[test]
    fn test_global_log_level() {
        let args = Args::parse_from(["tapmux", "schema", "--log-level", "debug"]);
        assert!(matches!(args.command, Command::Schema));
        assert_eq!(args.log_level(), Some(LogLevel::Debug));
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from(["tapmux", "run", "--only", "-c", "2", "x"]);
        let Command::Run(run) = args.command else {
            panic!("Expected Run command");
        };

        let mut config = RunConfig {
            concurrency: Some(8),
            timeout_ms: Some(100),
            ..Default::default()
        };
        run.apply(&mut config);
        assert_eq!(config.concurrency, Some(2));
        assert_eq!(config.timeout_ms, Some(100));
        assert!(config.only);
        assert!(!config.stop_on_failure);
    }
}
