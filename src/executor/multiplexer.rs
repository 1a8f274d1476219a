//! Concurrency multiplexer
//!
//! Runs up to `N` work items at once and merges their event streams into one
//! sink without ever interleaving two items. One task at a time holds
//! pass-through and reports straight to the sink; every other task's events
//! are retained until it closes and its buffer can be released as a block.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::error::{BodyOutcome, ExecutorError};
use super::worker::{Executor, StreamTally};
use crate::config::default_concurrency;
use crate::models::{Event, EventKind, TaskId, Value, WorkItem};
use crate::output::EventSink;

/// Totals of one multiplexed run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Items handed to an executor
    pub started: u64,
    /// Items whose root scope-exit was seen
    pub completed: u64,
    pub asserts: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cancelled: bool,
    /// Queued items dropped after cancellation
    pub not_started: u64,
}

impl RunSummary {
    pub fn passed(&self) -> bool {
        self.failed == 0 && !self.cancelled && self.not_started == 0
    }
}

/// What a `close` leaves for the caller to do
#[derive(Debug, Default)]
pub(crate) struct Release {
    /// Events to hand to the sink, in order
    pub flush: Vec<Event>,
    /// Item to start in the freed slot
    pub start: Option<WorkItem>,
    /// Nothing is left in flight
    pub finished: bool,
}

/// Bookkeeping of the multiplexer, free of any I/O
#[derive(Debug, Default)]
pub(crate) struct MuxState {
    queue: VecDeque<WorkItem>,
    in_flight: usize,
    retained: HashMap<TaskId, Vec<Event>>,
    owner: Option<TaskId>,
    ready: VecDeque<Vec<Event>>,
    cancelled: bool,
    summary: RunSummary,
}

impl MuxState {
    /// Queue `items` and take the ones that start right away
    pub(crate) fn submit(&mut self, items: Vec<WorkItem>, concurrency: usize) -> Vec<WorkItem> {
        self.queue.extend(items);
        let mut started = Vec::new();
        while self.in_flight < concurrency {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            self.in_flight += 1;
            self.summary.started += 1;
            started.push(item);
        }
        started
    }

    /// Route one event; returns what goes to the sink now
    pub(crate) fn report(&mut self, task: TaskId, event: Event) -> Vec<Event> {
        self.observe(&event);

        let owner = *self.owner.get_or_insert(task);
        if owner != task {
            self.retained.entry(task).or_default().push(event);
            return Vec::new();
        }

        let mut flush = self.retained.remove(&task).unwrap_or_default();
        flush.push(event);
        flush
    }

    /// End of a task's stream
    pub(crate) fn close(&mut self, task: TaskId) -> Release {
        let mut release = Release::default();
        self.in_flight = self.in_flight.saturating_sub(1);

        if self.cancelled {
            let dropped = self.queue.len() as u64;
            if dropped > 0 {
                debug!("Run cancelled, dropping {} queued items", dropped);
            }
            self.summary.not_started += dropped;
            self.queue.clear();
        } else if let Some(item) = self.queue.pop_front() {
            self.in_flight += 1;
            self.summary.started += 1;
            release.start = Some(item);
        }

        let own = self.retained.remove(&task).unwrap_or_default();
        if self.owner == Some(task) {
            release.flush.extend(own);
            while let Some(buffer) = self.ready.pop_front() {
                release.flush.extend(buffer);
            }
            self.owner = None;
        } else if self.owner.is_none() {
            release.flush.extend(own);
        } else if !own.is_empty() {
            self.ready.push_back(own);
        }

        if self.in_flight == 0 {
            self.retained.clear();
            self.ready.clear();
            release.finished = true;
        }
        release
    }

    fn observe(&mut self, event: &Event) {
        if event.cancel_run || event.is_bail_out() {
            self.cancelled = true;
            self.summary.cancelled = true;
        }
        if !event.is_root_exit() {
            return;
        }
        if let EventKind::ScopeExit {
            asserts,
            failed,
            skipped,
            ..
        } = &event.kind
        {
            self.summary.completed += 1;
            self.summary.asserts += asserts;
            self.summary.failed += failed;
            self.summary.skipped += skipped;
        }
    }

    pub(crate) fn summary(&self) -> RunSummary {
        self.summary
    }

    /// Start a fresh run with nothing in flight
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Bounded-concurrency runner over an [`Executor`]
pub struct Multiplexer {
    concurrency: usize,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn EventSink>,
    state: Mutex<MuxState>,
    done: Notify,
    next_id: Mutex<u64>,
    /// Held for the length of one `run`
    running: tokio::sync::Mutex<()>,
}

impl Multiplexer {
    pub fn new(executor: Arc<dyn Executor>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            concurrency: default_concurrency(),
            executor,
            sink,
            state: Mutex::new(MuxState::default()),
            done: Notify::new(),
            next_id: Mutex::new(0),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn lock_state(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run every reference as a work item and wait for all of them
    ///
    /// Each call reports its own totals. Calls on a shared multiplexer run
    /// one after another.
    pub async fn run<I, S>(self: Arc<Self>, references: I) -> RunSummary
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _running = self.running.lock().await;
        self.lock_state().reset();

        let items: Vec<WorkItem> = {
            let mut next_id = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            references
                .into_iter()
                .map(|reference| {
                    *next_id += 1;
                    WorkItem::new(TaskId(*next_id), reference)
                })
                .collect()
        };
        if items.is_empty() {
            return self.lock_state().summary();
        }

        info!(
            "Running {} items (max {} concurrent)",
            items.len(),
            self.concurrency
        );
        let started = self.lock_state().submit(items, self.concurrency);
        for item in started {
            self.spawn(item);
        }

        self.done.notified().await;

        let summary = self.lock_state().summary();
        info!(
            "Run finished: {} items, {} asserts, {} failed, {} skipped{}",
            summary.completed,
            summary.asserts,
            summary.failed,
            summary.skipped,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        summary
    }

    fn spawn(self: &Arc<Self>, item: WorkItem) {
        debug!("Starting {}", item);
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            let reporter = Arc::new(TaskReporter {
                mux: Arc::clone(&mux),
                task: item.id,
                tally: Mutex::new(StreamTally::new(item.reference.clone())),
            });

            let sink: Arc<dyn EventSink> = reporter.clone();
            let execution = {
                let executor = Arc::clone(&mux.executor);
                let item = item.clone();
                async move { executor.execute(item, sink).await }
            };

            if let Err(payload) = AssertUnwindSafe(execution).catch_unwind().await {
                let message = match BodyOutcome::from_panic(payload) {
                    BodyOutcome::Unexpected(Value::Error(error)) => error.message,
                    _ => String::from("unknown panic"),
                };
                reporter.finish(&ExecutorError::Panicked(message));
            }
            mux.close(item.id);
        });
    }

    fn report(&self, task: TaskId, event: Event) {
        let mut state = self.lock_state();
        for event in state.report(task, event) {
            self.sink.report(event);
        }
    }

    fn close(self: &Arc<Self>, task: TaskId) {
        let release = {
            let mut state = self.lock_state();
            let release = state.close(task);
            for event in release.flush.iter().cloned() {
                self.sink.report(event);
            }
            release
        };
        debug!("Closed {}", task);

        if let Some(item) = release.start {
            self.spawn(item);
        }
        if release.finished {
            self.done.notify_one();
        }
    }
}

/// Sink handed to one executor; tags events with the task they belong to
struct TaskReporter {
    mux: Arc<Multiplexer>,
    task: TaskId,
    tally: Mutex<StreamTally>,
}

impl TaskReporter {
    /// Complete the stream of an executor that panicked
    fn finish(&self, error: &ExecutorError) {
        let events = self
            .tally
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .finish(error);
        for event in events {
            self.mux.report(self.task, event);
        }
    }
}

impl EventSink for TaskReporter {
    fn report(&self, event: Event) {
        self.tally
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observe(&event);
        self.mux.report(self.task, event);
    }
}
