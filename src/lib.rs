//! tapmux - bounded-parallel test runner core
//!
//! Runs many independent test work items at once and merges their event
//! streams into one ordered stream in which no two items ever interleave.
//!
//! ## Pieces
//!
//! - [`scope`]: per-scope counters, sequence ids, cancellation, hooks
//! - [`executor::Driver`]: runs one item's tests in order and turns their
//!   outcomes into events
//! - [`executor::Multiplexer`]: runs up to `N` items and releases their
//!   events as contiguous blocks
//! - [`output`]: NDJSON and in-memory sinks
//!
//! ## Writing a test program
//!
//! A child program run by `tapmux run` builds a driver from the environment
//! and writes its events to stdout:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapmux::executor::{Driver, DriverConfig};
//! use tapmux::output::NdjsonSink;
//!
//! #[tokio::main]
//! async fn main() {
//!     let sink = Arc::new(NdjsonSink::stdout());
//!     let mut driver = Driver::new("math", DriverConfig::from_env(), sink);
//!     driver.test("addition", |t| async move {
//!         t.equal(2 + 2, 4, "adds")?;
//!         t.test("nested", |t| async move {
//!             t.ok(true, "runs inside addition")?;
//!             Ok(())
//!         })
//!         .await?;
//!         Ok(())
//!     });
//!     let summary = driver.run().await;
//!     std::process::exit(if summary.is_passing() { 0 } else { 1 });
//! }
//! ```

pub mod cli;
pub mod config;
pub mod executor;
pub mod models;
pub mod output;
pub mod scope;
pub mod utils;

pub use executor::{Driver, DriverConfig, Multiplexer, RunSummary, Test, TestError, TestResult};
pub use models::{Assertion, Event, EventKind, Operator, Value};
pub use output::{EventSink, MemorySink, NdjsonSink};
pub use scope::{ScopeSummary, StopRun};
