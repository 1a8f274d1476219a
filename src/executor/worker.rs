//! Executor contract
//!
//! An executor turns one work item into one ordered event stream that ends
//! with the item's root scope-exit. Whatever goes wrong, the item is still
//! accounted for: a stream that cannot be produced or that ends early is
//! completed with a synthesized failing assertion and closing exits.

use futures::future::BoxFuture;
use std::sync::Arc;

use super::error::ExecutorError;
use crate::models::{Assertion, ErrorValue, Event, EventKind, Operator, Value, WorkItem, ROOT_SCOPE};
use crate::output::EventSink;
use crate::scope::{ScopeChain, ScopeOptions, ScopeSummary};

/// Runs one work item
///
/// The returned future completes when the item's stream has ended; the
/// multiplexer closes the item exactly once after that.
pub trait Executor: Send + Sync {
    fn execute(&self, item: WorkItem, sink: Arc<dyn EventSink>) -> BoxFuture<'static, ()>;
}

/// Scope-enter, failing `unexpectedException` assertion, scope-exit
pub fn synthesize_load_failure(name: &str, error: &ExecutorError) -> Vec<Event> {
    let mut chain = ScopeChain::new();
    let root = chain.enter(ScopeOptions::new(name));
    let mut events = Vec::with_capacity(3);

    if let Some(mut enter) = chain.scope(root).map(|s| s.enter_event()) {
        chain.process(root, &mut enter);
        events.push(enter);
    }

    let mut failure = Event::assertion(root, failure_assertion(name, error));
    chain.process(root, &mut failure);
    events.push(failure);

    events.extend(chain.exit(root).into_iter().map(|(event, _)| event));
    events
}

fn failure_assertion(name: &str, error: &ExecutorError) -> Assertion {
    let value = Value::Error(ErrorValue::from_error(error).with_field("item", name));
    Assertion::new(
        format!("{name}: {error}"),
        false,
        Operator::UnexpectedException,
    )
    .with_error(&value)
}

/// Follows a stream that someone else produces
///
/// Knows which scopes are still open and how many assertions each holds, so
/// an interrupted stream can be closed with correct counters.
#[derive(Debug)]
pub struct StreamTally {
    name: String,
    open: Vec<(u64, String, ScopeSummary)>,
    root_seen: bool,
    closed: bool,
    last_sequence: u64,
}

impl StreamTally {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            open: Vec::new(),
            root_seen: false,
            closed: false,
            last_sequence: 0,
        }
    }

    /// Whether the root scope-exit has gone by
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Innermost open scope, for events without a scope of their own
    pub fn current_scope(&self) -> u64 {
        self.open.last().map_or(ROOT_SCOPE, |(id, _, _)| *id)
    }

    pub fn observe(&mut self, event: &Event) {
        match &event.kind {
            EventKind::ScopeEnter { name, .. } => {
                if event.scope_id == ROOT_SCOPE {
                    self.root_seen = true;
                }
                self.open
                    .push((event.scope_id, name.clone(), ScopeSummary::default()));
            }
            EventKind::ScopeExit {
                asserts,
                failed,
                skipped,
                ..
            } => {
                let Some(index) = self.open.iter().rposition(|(id, _, _)| *id == event.scope_id)
                else {
                    return;
                };
                self.open.truncate(index);
                if let Some((_, _, parent)) = self.open.last_mut() {
                    *parent += ScopeSummary {
                        asserts: *asserts,
                        failed: *failed,
                        skipped: *skipped,
                    };
                }
                if event.scope_id == ROOT_SCOPE {
                    self.closed = true;
                }
            }
            EventKind::Assertion(assertion) => {
                self.last_sequence = self.last_sequence.max(assertion.sequence_id);
                if let Some((_, _, counts)) = self.open.last_mut() {
                    counts.asserts += 1;
                    if assertion.skip {
                        counts.skipped += 1;
                    }
                    if assertion.is_failing() {
                        counts.failed += 1;
                    }
                }
            }
            EventKind::Comment { .. } | EventKind::BailOut { .. } | EventKind::Stream { .. } => {}
        }
    }

    /// Events that complete the stream after `error`
    ///
    /// Nothing when the root already closed; the whole load-failure trio when
    /// the root never opened.
    pub fn finish(&mut self, error: &ExecutorError) -> Vec<Event> {
        if self.closed {
            return Vec::new();
        }
        if !self.root_seen {
            self.closed = true;
            return synthesize_load_failure(&self.name, error);
        }

        let mut events = Vec::new();
        while self.open.len() > 1 {
            let Some((id, name, counts)) = self.open.pop() else {
                break;
            };
            events.push(exit_event(id, name, counts));
            if let Some((_, _, parent)) = self.open.last_mut() {
                *parent += counts;
            }
        }

        if let Some((id, name, mut counts)) = self.open.pop() {
            let mut assertion = failure_assertion(&self.name, error);
            self.last_sequence += 1;
            assertion.sequence_id = self.last_sequence;
            counts.asserts += 1;
            counts.failed += 1;
            events.push(Event::assertion(id, assertion));
            events.push(exit_event(id, name, counts));
        }
        self.closed = true;
        events
    }
}

fn exit_event(id: u64, name: String, counts: ScopeSummary) -> Event {
    Event::new(
        id,
        EventKind::ScopeExit {
            name,
            asserts: counts.asserts,
            failed: counts.failed,
            skipped: counts.skipped,
        },
    )
}
