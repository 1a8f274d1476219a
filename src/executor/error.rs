//! Errors raised by test bodies and executors
//!
//! Everything a test body can end with is classified at the driver boundary
//! into a [`BodyOutcome`]; only [`StopRun`] ever travels further up.

use std::any::Any;
use std::time::Duration;
use thiserror::Error;

use crate::models::{ErrorValue, Operator, SourceMarker, Value};
use crate::scope::StopRun;

/// Result of a test body or hook
pub type TestResult = Result<(), TestError>;

/// Ways a test body can end other than success
#[derive(Debug, Error)]
pub enum TestError {
    /// Voluntary stop after cancellation
    #[error(transparent)]
    Stop(#[from] StopRun),

    /// Structured assertion failure
    #[error(transparent)]
    Assertion(#[from] AssertionFailure),

    /// Arbitrary thrown value
    #[error("thrown value: {0:?}")]
    Thrown(Value),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TestError {
    pub fn thrown(value: impl Into<Value>) -> Self {
        TestError::Thrown(value.into())
    }

    pub fn classify(self) -> BodyOutcome {
        match self {
            TestError::Stop(_) => BodyOutcome::Stopped,
            TestError::Assertion(failure) => BodyOutcome::Failed(failure),
            TestError::Thrown(value) if StopRun::matches(&value) => BodyOutcome::Stopped,
            TestError::Thrown(value) => BodyOutcome::Unexpected(value),
            TestError::Other(error) => {
                if error.downcast_ref::<StopRun>().is_some() {
                    return BodyOutcome::Stopped;
                }
                match error.downcast::<AssertionFailure>() {
                    Ok(failure) => BodyOutcome::Failed(failure),
                    Err(error) => BodyOutcome::Unexpected(Value::Error(
                        ErrorValue::new("Error", error.to_string()).with_stack(format!("{error:?}")),
                    )),
                }
            }
        }
    }
}

/// A failed check raised as an error instead of recorded in place
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct AssertionFailure {
    pub message: String,
    pub operator: Operator,
    pub actual: Option<Value>,
    pub expected: Option<Value>,
    pub at: SourceMarker,
}

impl AssertionFailure {
    #[track_caller]
    pub fn new(message: impl Into<String>, operator: Operator) -> Self {
        Self {
            message: message.into(),
            operator,
            actual: None,
            expected: None,
            at: SourceMarker::caller(),
        }
    }

    pub fn with_actual(mut self, actual: impl Into<Value>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    pub fn with_expected(mut self, expected: impl Into<Value>) -> Self {
        self.expected = Some(expected.into());
        self
    }
}

/// How a test body or hook ended
#[derive(Debug)]
pub enum BodyOutcome {
    Completed,
    Stopped,
    Failed(AssertionFailure),
    Unexpected(Value),
    TimedOut(Duration),
}

impl BodyOutcome {
    pub fn from_result(result: TestResult) -> Self {
        match result {
            Ok(()) => BodyOutcome::Completed,
            Err(error) => error.classify(),
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with a non-string payload".to_string());
        BodyOutcome::Unexpected(Value::Error(ErrorValue::new("Panic", message)))
    }
}

/// Failures of an executor to produce a work item's stream
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown suite: {0}")]
    UnknownSuite(String),

    #[error("suite registration panicked: {0}")]
    RegistrationPanicked(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status} before closing its root scope")]
    Incomplete { program: String, status: String },

    #[error("executor panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_classification() {
        assert!(matches!(
            TestError::Stop(StopRun).classify(),
            BodyOutcome::Stopped
        ));
        assert!(matches!(
            TestError::thrown(StopRun).classify(),
            BodyOutcome::Stopped
        ));
        assert!(matches!(
            TestError::Other(anyhow::Error::new(StopRun)).classify(),
            BodyOutcome::Stopped
        ));
    }

    #[test]
    fn test_assertion_failure_through_anyhow() {
        let failure = AssertionFailure::new("values differ", Operator::Equal)
            .with_actual(1)
            .with_expected(2);
        match TestError::Other(anyhow::Error::new(failure)).classify() {
            BodyOutcome::Failed(failure) => {
                assert_eq!(failure.operator, Operator::Equal);
                assert_eq!(failure.actual, Some(Value::Int(1)));
                assert!(failure.at.file.ends_with("error.rs"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_other_errors_are_unexpected() {
        let outcome = TestError::Other(anyhow::anyhow!("disk full")).classify();
        match outcome {
            BodyOutcome::Unexpected(Value::Error(error)) => assert_eq!(error.message, "disk full"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_panic_payloads() {
        let outcome = BodyOutcome::from_panic(Box::new("boom"));
        assert!(matches!(outcome, BodyOutcome::Unexpected(Value::Error(e)) if e.message == "boom"));

        let outcome = BodyOutcome::from_panic(Box::new(String::from("bang")));
        assert!(matches!(outcome, BodyOutcome::Unexpected(Value::Error(e)) if e.message == "bang"));
    }
}
