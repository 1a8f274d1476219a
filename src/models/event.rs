//! Event models
//!
//! One [`Event`] describes one occurrence in a work item's run. Events are
//! serialized as flat JSON objects tagged by `type`, one per line on the wire.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::fmt;
use std::panic::Location;

use super::value::{sanitize, Value};

/// Scope id of the top-level item scope
pub const ROOT_SCOPE: u64 = 0;

/// Kind of assertion that produced an assertion event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Ok,
    NotOk,
    Equal,
    NotEqual,
    Is,
    IsNot,
    Fail,
    Throws,
    DoesNotThrow,
    Timeout,
    UnexpectedException,
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Ok => "ok",
            Operator::NotOk => "notOk",
            Operator::Equal => "equal",
            Operator::NotEqual => "notEqual",
            Operator::Is => "is",
            Operator::IsNot => "isNot",
            Operator::Fail => "fail",
            Operator::Throws => "throws",
            Operator::DoesNotThrow => "doesNotThrow",
            Operator::Timeout => "timeout",
            Operator::UnexpectedException => "unexpectedException",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source location an assertion originated from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SourceMarker {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourceMarker {
    /// Location of the caller, through any `#[track_caller]` frames
    #[track_caller]
    pub fn caller() -> Self {
        Self::from_location(Location::caller())
    }

    pub fn from_location(location: &Location<'_>) -> Self {
        Self {
            file: location.file().to_string(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl fmt::Display for SourceMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Output channel of a console passthrough event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StreamChannel {
    Stdout,
    Stderr,
}

/// A single assertion
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    pub name: String,
    pub pass: bool,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub todo: bool,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<SourceMarker>,
    /// Ordinal within the whole item run, assigned by the scope
    #[serde(default)]
    pub sequence_id: u64,
}

impl Assertion {
    pub fn new(name: impl Into<String>, pass: bool, operator: Operator) -> Self {
        Self {
            name: name.into(),
            pass,
            skip: false,
            todo: false,
            operator,
            expected: None,
            actual: None,
            error: None,
            at: None,
            sequence_id: 0,
        }
    }

    pub fn with_expected(mut self, expected: &Value) -> Self {
        self.expected = Some(sanitize(expected));
        self
    }

    pub fn with_actual(mut self, actual: &Value) -> Self {
        self.actual = Some(sanitize(actual));
        self
    }

    pub fn with_error(mut self, error: &Value) -> Self {
        self.error = Some(sanitize(error));
        self
    }

    pub fn at(mut self, marker: SourceMarker) -> Self {
        self.at = Some(marker);
        self
    }

    pub fn skip(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn todo(mut self) -> Self {
        self.todo = true;
        self
    }

    pub fn fail(&self) -> bool {
        !self.pass
    }

    /// A failure that counts against the run
    pub fn is_failing(&self) -> bool {
        !self.pass && !self.todo && !self.skip
    }
}

/// What happened
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    ScopeEnter {
        name: String,
        #[serde(default)]
        skip: bool,
        #[serde(default)]
        todo: bool,
    },
    /// Carries the counters of the scope being closed
    ScopeExit {
        name: String,
        asserts: u64,
        failed: u64,
        skipped: u64,
    },
    Assertion(Assertion),
    Comment {
        text: String,
    },
    BailOut {
        reason: String,
    },
    Stream {
        channel: StreamChannel,
        text: String,
    },
}

/// One occurrence in a work item's run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub scope_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancel_run: bool,
    #[serde(flatten)]
    pub kind: EventKind,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Event {
    pub fn new(scope_id: u64, kind: EventKind) -> Self {
        Self {
            scope_id,
            timestamp: None,
            elapsed_ms: None,
            cancel_run: false,
            kind,
        }
    }

    pub fn comment(scope_id: u64, text: impl Into<String>) -> Self {
        Self::new(scope_id, EventKind::Comment { text: text.into() })
    }

    pub fn assertion(scope_id: u64, assertion: Assertion) -> Self {
        Self::new(scope_id, EventKind::Assertion(assertion))
    }

    pub fn bail_out(scope_id: u64, reason: impl Into<String>) -> Self {
        Self::new(
            scope_id,
            EventKind::BailOut {
                reason: reason.into(),
            },
        )
    }

    pub fn stream(scope_id: u64, channel: StreamChannel, text: impl Into<String>) -> Self {
        Self::new(
            scope_id,
            EventKind::Stream {
                channel,
                text: text.into(),
            },
        )
    }

    pub fn as_assertion(&self) -> Option<&Assertion> {
        match &self.kind {
            EventKind::Assertion(assertion) => Some(assertion),
            _ => None,
        }
    }

    pub fn is_bail_out(&self) -> bool {
        matches!(self.kind, EventKind::BailOut { .. })
    }

    pub fn is_root_enter(&self) -> bool {
        self.scope_id == ROOT_SCOPE && matches!(self.kind, EventKind::ScopeEnter { .. })
    }

    pub fn is_root_exit(&self) -> bool {
        self.scope_id == ROOT_SCOPE && matches!(self.kind, EventKind::ScopeExit { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            EventKind::ScopeEnter { .. } => "scopeEnter",
            EventKind::ScopeExit { .. } => "scopeExit",
            EventKind::Assertion(_) => "assertion",
            EventKind::Comment { .. } => "comment",
            EventKind::BailOut { .. } => "bailOut",
            EventKind::Stream { .. } => "stream",
        }
    }
}
