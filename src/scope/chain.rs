//! Chain of open scopes for one work item
//!
//! The chain is an explicit stack owned by a single driver: index 0 is the
//! item scope, each entry's parent is the entry below it. Cancellation
//! propagates along the whole chain.

use tracing::{debug, warn};

use super::signal::StopRun;
use super::state::{ScopeOptions, ScopeState, ScopeSummary};
use crate::models::{Event, EventKind};

#[derive(Debug, Default)]
pub struct ScopeChain {
    scopes: Vec<ScopeState>,
    next_id: u64,
    /// Last assertion ordinal handed out in this item
    last_sequence: u64,
}

impl ScopeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Open a scope under the innermost open scope and return its id
    ///
    /// The first scope opened gets id 0.
    pub fn enter(&mut self, options: ScopeOptions) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let scope = ScopeState::enter(self.scopes.last(), id, options);
        self.scopes.push(scope);
        id
    }

    pub fn scope(&self, id: u64) -> Option<&ScopeState> {
        self.scopes.iter().rev().find(|s| s.id() == id)
    }

    pub fn scope_mut(&mut self, id: u64) -> Option<&mut ScopeState> {
        self.scopes.iter_mut().rev().find(|s| s.id() == id)
    }

    /// Ancestors of a scope, outermost first, excluding the scope itself
    pub fn ancestors(&self, id: u64) -> &[ScopeState] {
        match self.position(id) {
            Some(index) => &self.scopes[..index],
            None => &[],
        }
    }

    pub fn root(&self) -> Option<&ScopeState> {
        self.scopes.first()
    }

    /// Whether the run has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.scopes.iter().any(ScopeState::cancel_run)
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.scopes.iter().rposition(|s| s.id() == id)
    }

    /// Whether `outer` is open strictly below `inner`
    pub fn encloses(&self, outer: u64, inner: u64) -> bool {
        match (self.position(outer), self.position(inner)) {
            (Some(outer), Some(inner)) => outer < inner,
            _ => false,
        }
    }

    /// Process an event emitted in scope `id`
    ///
    /// Counts and stamps it in that scope, then applies cancellation: the
    /// first cancelling event marks every open scope skip + cancel_run.
    pub fn process(&mut self, id: u64, event: &mut Event) {
        let index = match self.position(id) {
            Some(index) => index,
            None if self.scopes.is_empty() => return,
            None => {
                warn!("event for closed scope {} routed to innermost scope", id);
                self.scopes.len() - 1
            }
        };

        let scope = &mut self.scopes[index];
        let failing = scope.process(event);
        if let EventKind::Assertion(assertion) = &mut event.kind {
            // Item-wide ordinal; a parent may emit while a child is open.
            self.last_sequence += 1;
            assertion.sequence_id = self.last_sequence;
        }
        let scope = &self.scopes[index];
        let raise = scope.should_cancel(event, failing);

        if raise && !scope.cancel_run() {
            debug!("cancellation raised in scope {} ({})", scope.id(), scope.name());
            for open in &mut self.scopes {
                open.mark_cancelled();
            }
            event.cancel_run = true;
        } else if self.scopes[index].cancel_run() {
            event.cancel_run = true;
        }
    }

    pub fn finalize(&self, id: u64, event: &Event) -> Result<(), StopRun> {
        match self.scope(id).or(self.scopes.last()) {
            Some(scope) => scope.finalize(event),
            None => Ok(()),
        }
    }

    /// Close scope `id`, and any scope left open above it
    ///
    /// Returns the processed exit events innermost first, with the summary of
    /// each closed scope. Every closed scope is merged into its parent exactly
    /// once, then dropped.
    pub fn exit(&mut self, id: u64) -> Vec<(Event, ScopeSummary)> {
        let Some(index) = self.position(id) else {
            return Vec::new();
        };

        let mut closed = Vec::new();
        while self.scopes.len() > index {
            let Some(mut scope) = self.scopes.pop() else {
                break;
            };
            if scope.id() != id {
                warn!("closing abandoned scope {} ({})", scope.id(), scope.name());
            }
            let mut event = scope.exit_event();
            scope.process(&mut event);
            event.cancel_run = scope.cancel_run();
            let summary = scope.summary();
            if let Some(parent) = self.scopes.last_mut() {
                scope.merge_into(parent);
            }
            closed.push((event, summary));
        }
        closed
    }

    /// Close every scope opened above `id`, innermost first
    pub fn close_above(&mut self, id: u64) -> Vec<(Event, ScopeSummary)> {
        let above = self
            .position(id)
            .and_then(|index| self.scopes.get(index + 1))
            .map(ScopeState::id);
        match above {
            Some(child) => self.exit(child),
            None => Vec::new(),
        }
    }
}
