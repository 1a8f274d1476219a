//! tapmux - parallel test program runner
//!
//! Runs each test program as a work item, at most `N` at a time, and writes
//! the merged NDJSON event stream to stdout. No two programs' events ever
//! interleave in the output.
//!
//! ## Usage
//!
//! ```bash
//! # Run three programs, two at a time
//! tapmux run --concurrency 2 ./target/debug/t1 ./target/debug/t2 ./target/debug/t3
//!
//! # Stop everything on the first failure
//! tapmux run --bail ./tests/*.sh
//!
//! # Show the effective configuration
//! tapmux config
//!
//! # JSON Schema of the event stream
//! tapmux schema
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use tapmux::cli::{self, Args};
use tapmux::config::{EnvConfig, RunConfig};
use tapmux::executor::{Multiplexer, ProcessExecutor};
use tapmux::models::Event;
use tapmux::output::NdjsonSink;
use tapmux::utils::init_logger;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        cli::Command::Run(ref run_args) => {
            let mut config = load_config(run_args.config.as_deref())?;
            run_args.apply(&mut config);
            config.validate()?;
            init_logger(args.log_level().unwrap_or(config.log_level));

            let passed = run_programs(&config, &run_args.programs).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        cli::Command::Config(ref config_args) => {
            let config = load_config(config_args.config.as_deref())?;
            init_logger(args.log_level().unwrap_or(config.log_level));
            print!("{}", config.to_yaml()?);
        }
        cli::Command::Schema => {
            let schema = schemars::schema_for!(Event);
            let schema =
                serde_json::to_string_pretty(&schema).context("Failed to serialize schema")?;
            println!("{schema}");
        }
    }

    Ok(())
}

/// File, then environment
fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    let env = EnvConfig::load();
    let env_path = env.config_file.as_deref().map(Path::new);
    let mut config = RunConfig::load_or_default(path.or(env_path))?;
    config.apply_env(&env);
    Ok(config)
}

async fn run_programs(config: &RunConfig, programs: &[String]) -> Result<bool> {
    let concurrency = config.concurrency();
    debug!("Effective config: {:?}", config);

    let executor = ProcessExecutor::new().with_env(config.child_env());
    let sink = Arc::new(NdjsonSink::stdout());
    let mux = Arc::new(Multiplexer::new(Arc::new(executor), sink).with_concurrency(concurrency));

    let summary = mux.run(programs.iter().cloned()).await;

    info!(
        "{} of {} programs completed - asserts: {}, failed: {}, skipped: {}",
        summary.completed,
        programs.len(),
        summary.asserts,
        summary.failed,
        summary.skipped
    );
    if summary.cancelled {
        info!("Run cancelled, {} programs not started", summary.not_started);
    }

    Ok(summary.passed())
}
