//! Scope state
//!
//! One node of the scope tree: counters, inherited flags, timing and hooks.
//! The upward link to the parent lives in [`super::ScopeChain`]; a node never
//! refers to its children.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

use super::hooks::HookSet;
use super::signal::StopRun;
use crate::models::{Event, EventKind, Operator};
use crate::utils::Timer;

/// Options a scope is opened with
///
/// Flags set here are OR-ed with the parent's: a child can turn `skip`,
/// `todo` or `stop_on_failure` on, never off.
#[derive(Clone, Debug, Default)]
pub struct ScopeOptions {
    pub name: String,
    pub skip: bool,
    pub todo: bool,
    pub stop_on_failure: bool,
}

impl ScopeOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    pub fn todo(mut self, todo: bool) -> Self {
        self.todo = todo;
        self
    }

    pub fn stop_on_failure(mut self, stop_on_failure: bool) -> Self {
        self.stop_on_failure = stop_on_failure;
        self
    }
}

/// Assertion counters of a scope
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSummary {
    pub asserts: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl ScopeSummary {
    pub fn is_passing(&self) -> bool {
        self.failed == 0
    }
}

impl AddAssign for ScopeSummary {
    fn add_assign(&mut self, other: Self) {
        self.asserts += other.asserts;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[derive(Debug)]
pub struct ScopeState {
    id: u64,
    name: String,
    skip: bool,
    todo: bool,
    stop_on_failure: bool,
    cancel_run: bool,
    counts: ScopeSummary,
    sequence_offset: u64,
    timer: Timer,
    hooks: HookSet,
}

impl ScopeState {
    pub fn enter(parent: Option<&ScopeState>, id: u64, options: ScopeOptions) -> Self {
        let inherited = |own: bool, pick: fn(&ScopeState) -> bool| own || parent.is_some_and(pick);
        Self {
            id,
            skip: inherited(options.skip, |p| p.skip),
            todo: inherited(options.todo, |p| p.todo),
            stop_on_failure: inherited(options.stop_on_failure, |p| p.stop_on_failure),
            cancel_run: false,
            counts: ScopeSummary::default(),
            sequence_offset: parent.map_or(0, |p| p.sequence_offset + p.counts.asserts),
            timer: Timer::start(options.name.clone()),
            hooks: HookSet::default(),
            name: options.name,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn skip(&self) -> bool {
        self.skip
    }

    pub fn todo(&self) -> bool {
        self.todo
    }

    pub fn stop_on_failure(&self) -> bool {
        self.stop_on_failure
    }

    pub fn cancel_run(&self) -> bool {
        self.cancel_run
    }

    pub fn summary(&self) -> ScopeSummary {
        self.counts
    }

    pub fn sequence_offset(&self) -> u64 {
        self.sequence_offset
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookSet {
        &mut self.hooks
    }

    /// Local part of event processing, before the event reaches any consumer
    ///
    /// Returns whether the event is a failing assertion.
    pub fn process(&mut self, event: &mut Event) -> bool {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }
        if event.elapsed_ms.is_none() {
            event.elapsed_ms = Some(self.timer.elapsed_ms());
        }

        let EventKind::Assertion(assertion) = &mut event.kind else {
            return false;
        };

        assertion.skip |= self.skip;
        assertion.todo |= self.todo;
        self.counts.asserts += 1;
        if assertion.skip {
            self.counts.skipped += 1;
        }
        let failing = assertion.is_failing();
        if failing {
            self.counts.failed += 1;
        }
        assertion.sequence_id = self.counts.asserts + self.sequence_offset;
        failing
    }

    /// Whether this event raises cancellation at this scope
    pub fn should_cancel(&self, event: &Event, failing: bool) -> bool {
        (failing && self.stop_on_failure && !self.skip) || event.is_bail_out()
    }

    pub fn mark_cancelled(&mut self) {
        self.skip = true;
        self.cancel_run = true;
    }

    /// Post-processing, after the consumer recorded the event
    pub fn finalize(&self, event: &Event) -> Result<(), StopRun> {
        match &event.kind {
            EventKind::Assertion(assertion)
                if event.cancel_run && assertion.operator != Operator::UnexpectedException =>
            {
                Err(StopRun)
            }
            EventKind::BailOut { .. } => Err(StopRun),
            _ => Ok(()),
        }
    }

    /// Fold the counters into the parent; consumes the node
    pub fn merge_into(self, parent: &mut ScopeState) {
        parent.counts += self.counts;
        self.timer.stop();
    }

    pub fn enter_event(&self) -> Event {
        Event::new(
            self.id,
            EventKind::ScopeEnter {
                name: self.name.clone(),
                skip: self.skip,
                todo: self.todo,
            },
        )
    }

    pub fn exit_event(&self) -> Event {
        Event::new(
            self.id,
            EventKind::ScopeExit {
                name: self.name.clone(),
                asserts: self.counts.asserts,
                failed: self.counts.failed,
                skipped: self.counts.skipped,
            },
        )
    }
}
