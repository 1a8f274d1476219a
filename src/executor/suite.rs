//! In-process executor
//!
//! Work item references name suites registered up front. Each suite gets a
//! fresh [`Driver`] of its own, so concurrent items never share scope state.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use super::driver::{Driver, DriverConfig};
use super::error::{BodyOutcome, ExecutorError};
use super::worker::{synthesize_load_failure, Executor};
use crate::models::{Value, WorkItem};
use crate::output::EventSink;

type Registration = Arc<dyn Fn(&mut Driver) + Send + Sync>;

/// Registry of named suites run in this process
#[derive(Clone, Default)]
pub struct SuiteExecutor {
    config: DriverConfig,
    suites: HashMap<String, Registration>,
}

impl SuiteExecutor {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            suites: HashMap::new(),
        }
    }

    /// Add a suite; `register` queues its tests and hooks on the driver
    pub fn register<F>(mut self, name: impl Into<String>, register: F) -> Self
    where
        F: Fn(&mut Driver) + Send + Sync + 'static,
    {
        self.suites.insert(name.into(), Arc::new(register));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.suites.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.suites.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Executor for SuiteExecutor {
    fn execute(&self, item: WorkItem, sink: Arc<dyn EventSink>) -> BoxFuture<'static, ()> {
        let registration = self.suites.get(&item.reference).cloned();
        let config = self.config.clone();

        async move {
            let Some(registration) = registration else {
                warn!("{}: no suite named {}", item.id, item.reference);
                let error = ExecutorError::UnknownSuite(item.reference.clone());
                for event in synthesize_load_failure(&item.reference, &error) {
                    sink.report(event);
                }
                return;
            };

            let mut driver = Driver::new(item.reference.clone(), config, Arc::clone(&sink));
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| registration(&mut driver))) {
                let message = match BodyOutcome::from_panic(payload) {
                    BodyOutcome::Unexpected(Value::Error(error)) => error.message,
                    _ => String::from("unknown panic"),
                };
                warn!("{}: registration of {} panicked", item.id, item.reference);
                let error = ExecutorError::RegistrationPanicked(message);
                for event in synthesize_load_failure(&item.reference, &error) {
                    sink.report(event);
                }
                return;
            }

            debug!("{}: running suite {}", item.id, item.reference);
            driver.run().await;
        }
        .boxed()
    }
}
