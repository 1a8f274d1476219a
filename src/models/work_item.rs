//! Work items submitted to the multiplexer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonically increasing task id, assigned at submission
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One independently runnable unit of test code
///
/// `reference` is opaque to the core: a program path for the process
/// executor, a suite name for the in-process executor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: TaskId,
    pub reference: String,
}

impl WorkItem {
    pub fn new(id: TaskId, reference: impl Into<String>) -> Self {
        Self {
            id,
            reference: reference.into(),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.reference)
    }
}
