//! Test execution engine
//!
//! The [`Driver`] runs the tests of one work item in order; [`Executor`]s
//! produce one item's event stream; the [`Multiplexer`] runs many items at
//! once without interleaving their streams.

mod context;
mod driver;
mod error;
mod multiplexer;
mod process;
mod suite;
mod worker;

pub use context::{SubTest, Test};
pub use driver::{Driver, DriverConfig, TestBody, TestDescriptor, TestOptions};
pub use error::{AssertionFailure, BodyOutcome, ExecutorError, TestError, TestResult};
pub use multiplexer::{Multiplexer, RunSummary};
pub use process::ProcessExecutor;
pub use suite::SuiteExecutor;
pub use worker::{synthesize_load_failure, Executor, StreamTally};
