//! Voluntary stop signal
//!
//! Raised to unwind a test body once the run has been cancelled. It is not a
//! failure. Because it may cross a process or thread boundary as a plain
//! error value, it is recognized by structure (name, message and a private
//! tag) and not only by type.

use thiserror::Error;

use crate::models::{revive, ErrorValue, Value};

pub const STOP_NAME: &str = "StopRunError";
pub const STOP_MESSAGE: &str = "run stopped";
const TAG_FIELD: &str = "tag";
const STOP_TAG: &str = "tapmux:stop-run";

/// Unwind the running test body; the run was cancelled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Error)]
#[error("run stopped")]
pub struct StopRun;

impl StopRun {
    /// The transmissible form of the signal
    pub fn to_value(self) -> Value {
        Value::Error(
            ErrorValue::new(STOP_NAME, STOP_MESSAGE).with_field(TAG_FIELD, Value::symbol(STOP_TAG)),
        )
    }

    /// Whether a value is a (possibly deserialized) stop signal
    pub fn matches(value: &Value) -> bool {
        match value {
            Value::Error(error) => {
                error.name == STOP_NAME
                    && error.message == STOP_MESSAGE
                    && matches!(error.fields.get(TAG_FIELD), Some(Value::Symbol(tag)) if tag == STOP_TAG)
            }
            Value::Shared(node) => Self::matches(&node.get()),
            _ => false,
        }
    }

    pub fn matches_json(json: &serde_json::Value) -> bool {
        Self::matches(&revive(json))
    }
}

impl From<StopRun> for Value {
    fn from(stop: StopRun) -> Self {
        stop.to_value()
    }
}
