//! Execution driver
//!
//! Runs the queued tests of one work item sequentially and turns everything
//! that happens in them into a well-formed event sequence:
//! scope-enter, then assertions, comments and nested scopes, then scope-exit.
//! The item itself is the root scope (id 0), closed last with the aggregated
//! counts.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use super::context::{running_in, Test};
use super::error::{BodyOutcome, TestResult};
use crate::config::EnvConfig;
use crate::models::{Assertion, Event, Operator};
use crate::output::EventSink;
use crate::scope::{
    each_hook, once_hook, EachHook, HookKind, OnceHook, ScopeChain, ScopeOptions, ScopeSummary,
    StopRun,
};

/// Boxed test body
pub type TestBody = Box<dyn FnOnce(Test) -> BoxFuture<'static, TestResult> + Send>;

pub(crate) fn boxed_body<F, Fut>(body: F) -> TestBody
where
    F: FnOnce(Test) -> Fut + Send + 'static,
    Fut: Future<Output = TestResult> + Send + 'static,
{
    Box::new(move |t| body(t).boxed())
}

/// Plain options handed to a driver at construction
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Cancel the run on the first failing assertion
    pub stop_on_failure: bool,
    /// Default per-test timeout
    pub timeout: Option<Duration>,
    /// Run only tests registered with `only`
    pub only: bool,
}

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_on_failure(mut self, stop_on_failure: bool) -> Self {
        self.stop_on_failure = stop_on_failure;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn only(mut self, only: bool) -> Self {
        self.only = only;
        self
    }

    /// Settings passed down by a parent runner through the environment
    pub fn from_env() -> Self {
        let env = EnvConfig::load();
        Self {
            stop_on_failure: env.stop_on_failure.unwrap_or(false),
            timeout: env.timeout_ms.map(Duration::from_millis),
            only: env.only.unwrap_or(false),
        }
    }
}

/// Per-test options
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestOptions {
    pub skip: bool,
    pub todo: bool,
    pub only: bool,
    pub timeout: Option<Duration>,
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn todo(mut self) -> Self {
        self.todo = true;
        self
    }

    pub fn only(mut self) -> Self {
        self.only = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A queued test
pub struct TestDescriptor {
    pub name: String,
    pub options: TestOptions,
    pub body: TestBody,
}

impl TestDescriptor {
    pub fn new<F, Fut>(name: impl Into<String>, options: TestOptions, body: F) -> Self
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            options,
            body: boxed_body(body),
        }
    }
}

/// State shared by every handle of one driver
pub(crate) struct DriverShared {
    pub(crate) config: DriverConfig,
    sink: Arc<dyn EventSink>,
    chain: Mutex<ScopeChain>,
}

impl DriverShared {
    fn lock_chain(&self) -> MutexGuard<'_, ScopeChain> {
        self.chain.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Process, report, then finalize one event emitted in scope `scope_id`
    pub(crate) fn emit(&self, scope_id: u64, mut event: Event) -> Result<(), StopRun> {
        let mut chain = self.lock_chain();
        event.scope_id = scope_id;
        chain.process(scope_id, &mut event);
        let verdict = chain.finalize(scope_id, &event);
        // Reporting under the chain lock keeps processing and release order equal.
        self.sink.report(event);
        verdict
    }

    /// Open a child scope under the innermost open scope and report its entry
    pub(crate) fn open_scope(&self, options: ScopeOptions) -> u64 {
        let mut chain = self.lock_chain();
        let id = chain.enter(options);
        self.report_enter(&mut chain, id);
        id
    }

    /// Report the entry of a scope that is already on the chain
    pub(crate) fn announce_scope(&self, scope_id: u64) {
        let mut chain = self.lock_chain();
        self.report_enter(&mut chain, scope_id);
    }

    fn report_enter(&self, chain: &mut ScopeChain, scope_id: u64) {
        let Some(mut event) = chain.scope(scope_id).map(|s| s.enter_event()) else {
            return;
        };
        chain.process(scope_id, &mut event);
        self.sink.report(event);
    }

    /// Close a scope, report its exit and return its counters
    pub(crate) fn close_scope(&self, scope_id: u64) -> ScopeSummary {
        let mut chain = self.lock_chain();
        let mut summary = ScopeSummary::default();
        for (event, closed) in chain.exit(scope_id) {
            summary = closed;
            self.sink.report(event);
        }
        summary
    }

    /// Close nested scopes a dropped body left open above `scope_id`
    fn close_abandoned(&self, scope_id: u64) {
        let mut chain = self.lock_chain();
        for (event, _) in chain.close_above(scope_id) {
            self.sink.report(event);
        }
    }

    /// Whether `scope_id` encloses the open scope `inner`
    pub(crate) fn encloses(&self, scope_id: u64, inner: u64) -> bool {
        self.lock_chain().encloses(scope_id, inner)
    }

    pub(crate) fn is_skipped(&self, scope_id: u64) -> bool {
        self.lock_chain().scope(scope_id).map_or(true, |s| s.skip())
    }

    pub(crate) fn stop_state(&self) -> Result<(), StopRun> {
        if self.lock_chain().is_cancelled() {
            Err(StopRun)
        } else {
            Ok(())
        }
    }

    pub(crate) fn with_hooks<R>(
        &self,
        scope_id: u64,
        f: impl FnOnce(&mut crate::scope::HookSet) -> R,
    ) -> Option<R> {
        self.lock_chain().scope_mut(scope_id).map(|s| f(s.hooks_mut()))
    }

    /// `before_each` hooks of every scope enclosing `scope_id`, outermost first
    fn before_each_hooks(&self, scope_id: u64) -> Vec<EachHook> {
        self.lock_chain()
            .ancestors(scope_id)
            .iter()
            .flat_map(|s| s.hooks().before_each())
            .collect()
    }

    /// `after_each` hooks of every scope enclosing `scope_id`, innermost first
    fn after_each_hooks(&self, scope_id: u64) -> Vec<EachHook> {
        self.lock_chain()
            .ancestors(scope_id)
            .iter()
            .rev()
            .flat_map(|s| s.hooks().after_each())
            .collect()
    }
}

/// Runs the tests of one work item
pub struct Driver {
    name: String,
    shared: Arc<DriverShared>,
    root: Test,
    queue: Vec<TestDescriptor>,
}

impl Driver {
    pub fn new(name: impl Into<String>, config: DriverConfig, sink: Arc<dyn EventSink>) -> Self {
        let name = name.into();
        let mut chain = ScopeChain::new();
        let root_id = chain.enter(
            ScopeOptions::new(name.clone()).stop_on_failure(config.stop_on_failure),
        );
        let shared = Arc::new(DriverShared {
            config,
            sink,
            chain: Mutex::new(chain),
        });
        let root = Test::new(Arc::clone(&shared), root_id);

        Self {
            name,
            shared,
            root,
            queue: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    /// Queue a top-level test
    pub fn test<F, Fut>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.test_with(name, TestOptions::default(), body)
    }

    pub fn test_with<F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: TestOptions,
        body: F,
    ) -> &mut Self
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.queue.push(TestDescriptor::new(name, options, body));
        self
    }

    pub fn skip<F, Fut>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.test_with(name, TestOptions::new().skip(), body)
    }

    pub fn only<F, Fut>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.test_with(name, TestOptions::new().only(), body)
    }

    pub fn todo<F, Fut>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.test_with(name, TestOptions::new().todo(), body)
    }

    pub fn before_all<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.root.add_once_hook(HookKind::BeforeAll, once_hook(hook));
        self
    }

    pub fn after_all<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.root.add_once_hook(HookKind::AfterAll, once_hook(hook));
        self
    }

    pub fn before_each<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.root.add_each_hook(HookKind::BeforeEach, each_hook(hook));
        self
    }

    pub fn after_each<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.root.add_each_hook(HookKind::AfterEach, each_hook(hook));
        self
    }

    /// Run every queued test and close the item scope
    ///
    /// The returned counters are the final aggregate for the item; the same
    /// numbers travel on the root scope-exit event.
    pub async fn run(self) -> ScopeSummary {
        let Driver {
            name,
            shared,
            root,
            queue,
        } = self;

        info!("Running {} ({} tests)", name, queue.len());
        shared.announce_scope(root.scope_id());

        for descriptor in queue {
            if run_test(root.clone(), descriptor).await.is_err() {
                debug!("{}: stop reached the item scope", name);
            }
        }
        root.run_pending().await;

        let after_all = root.take_once_hooks(HookKind::AfterAll);
        let _ = run_once_hooks(&root, HookKind::AfterAll, after_all).await;

        let summary = shared.close_scope(root.scope_id());
        info!(
            "Finished {}: {} asserts, {} failed, {} skipped",
            name, summary.asserts, summary.failed, summary.skipped
        );
        summary
    }
}

/// Run one test under `parent`
///
/// Resolves to `Err(StopRun)` when the run is cancelled, so the stop signal
/// is the only outcome that reaches the enclosing body.
pub(crate) fn run_test(
    parent: Test,
    descriptor: TestDescriptor,
) -> BoxFuture<'static, Result<(), StopRun>> {
    async move {
        // Siblings never overlap, even when the enclosing body joins them.
        let _gate = parent.lock_gate().await;
        let shared = parent.shared();
        let TestDescriptor {
            name,
            options,
            body,
        } = descriptor;

        let skipped = options.skip
            || shared.is_skipped(parent.scope_id())
            || (shared.config.only && !options.only);
        if skipped {
            parent.comment(format!("SKIP {name}"));
            return shared.stop_state();
        }

        let before_all = parent.take_once_hooks(HookKind::BeforeAll);
        if run_once_hooks(&parent, HookKind::BeforeAll, before_all)
            .await
            .is_err()
        {
            return Err(StopRun);
        }

        let scope_id = shared.open_scope(ScopeOptions::new(name.clone()).todo(options.todo));
        let test = Test::new(Arc::clone(&shared), scope_id);

        let before_each = shared.before_each_hooks(scope_id);
        if run_each_hooks(&test, HookKind::BeforeEach, before_each)
            .await
            .is_ok()
        {
            let timeout = options.timeout.or(shared.config.timeout);
            let outcome = execute_body(test.clone(), body, timeout).await;
            shared.close_abandoned(scope_id);
            if matches!(outcome, BodyOutcome::TimedOut(_)) {
                test.discard_pending();
            }
            report_outcome(&test, &name, outcome);
        }
        test.run_pending().await;

        let after_all = test.take_once_hooks(HookKind::AfterAll);
        let _ = run_once_hooks(&test, HookKind::AfterAll, after_all).await;
        let after_each = shared.after_each_hooks(scope_id);
        let _ = run_each_hooks(&test, HookKind::AfterEach, after_each).await;

        let summary = shared.close_scope(scope_id);
        debug!(
            "{}: {} asserts, {} failed, {} skipped",
            name, summary.asserts, summary.failed, summary.skipped
        );
        shared.stop_state()
    }
    .boxed()
}

async fn execute_body(test: Test, body: TestBody, timeout: Option<Duration>) -> BodyOutcome {
    let frame = test.clone();
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| body(test))) {
        Ok(future) => AssertUnwindSafe(running_in(&frame, future)).catch_unwind(),
        Err(payload) => return BodyOutcome::from_panic(payload),
    };

    let result = match timeout {
        // Dropping the body abandons it; nothing is killed.
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => return BodyOutcome::TimedOut(limit),
        },
        None => future.await,
    };

    match result {
        Ok(result) => BodyOutcome::from_result(result),
        Err(payload) => BodyOutcome::from_panic(payload),
    }
}

/// Turn how a body or hook ended into events; never fails
fn report_outcome(test: &Test, name: &str, outcome: BodyOutcome) {
    let assertion = match outcome {
        BodyOutcome::Completed => return,
        BodyOutcome::Stopped => {
            test.comment(format!("{name}: stopped, run cancelled"));
            return;
        }
        BodyOutcome::Failed(failure) => {
            let mut assertion =
                Assertion::new(failure.message, false, failure.operator).at(failure.at);
            if let Some(actual) = &failure.actual {
                assertion = assertion.with_actual(actual);
            }
            if let Some(expected) = &failure.expected {
                assertion = assertion.with_expected(expected);
            }
            assertion
        }
        BodyOutcome::Unexpected(error) => {
            Assertion::new(format!("{name}: unexpected exception"), false, Operator::UnexpectedException)
                .with_error(&error)
        }
        BodyOutcome::TimedOut(limit) => {
            test.comment(format!("{name}: timed out after {}ms", limit.as_millis()));
            Assertion::new(format!("{name}: timed out"), false, Operator::Timeout)
        }
    };
    // The body already ended; a stop verdict here only marks the chain.
    let _ = test.record(assertion);
}

async fn run_hook(test: &Test, kind: HookKind, hook: BoxFuture<'static, TestResult>) -> Result<(), StopRun> {
    let outcome = match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => BodyOutcome::from_result(result),
        Err(payload) => BodyOutcome::from_panic(payload),
    };
    let stopped = matches!(outcome, BodyOutcome::Stopped);
    report_outcome(test, &format!("{} hook", kind.label()), outcome);
    if stopped {
        Err(StopRun)
    } else {
        test.shared().stop_state()
    }
}

async fn run_once_hooks(test: &Test, kind: HookKind, hooks: Vec<OnceHook>) -> Result<(), StopRun> {
    for hook in hooks {
        run_hook(test, kind, hook()).await?;
    }
    Ok(())
}

async fn run_each_hooks(test: &Test, kind: HookKind, hooks: Vec<EachHook>) -> Result<(), StopRun> {
    for hook in hooks {
        run_hook(test, kind, hook()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{AssertionFailure, TestError};
    use crate::models::EventKind;
    use crate::output::MemorySink;

    fn new_driver(config: DriverConfig) -> (Driver, MemorySink) {
        let sink = MemorySink::new();
        let driver = Driver::new("item", config, Arc::new(sink.clone()));
        (driver, sink)
    }

    fn root_exit(events: &[Event]) -> (u64, u64, u64) {
        match events.last().map(|e| &e.kind) {
            Some(EventKind::ScopeExit {
                asserts,
                failed,
                skipped,
                ..
            }) => (*asserts, *failed, *skipped),
            other => panic!("last event is not a scope exit: {other:?}"),
        }
    }

    fn assertions(events: &[Event]) -> Vec<&Assertion> {
        events.iter().filter_map(Event::as_assertion).collect()
    }

    /// Every event sits in the innermost open scope; ids strictly increase
    fn assert_well_formed(events: &[Event]) {
        let mut open = Vec::new();
        for event in events {
            match &event.kind {
                EventKind::ScopeEnter { .. } => open.push(event.scope_id),
                EventKind::ScopeExit { .. } => assert_eq!(open.pop(), Some(event.scope_id)),
                _ => assert_eq!(open.last(), Some(&event.scope_id), "misnested: {event:?}"),
            }
        }
        assert!(open.is_empty());

        let ids: Vec<u64> = assertions(events).iter().map(|a| a.sequence_id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "sequence ids: {ids:?}");
    }

    fn comments(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Comment { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_one_pass_one_fail() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.test("arithmetic", |t| async move {
            t.equal(2 + 2, 4, "adds")?;
            t.equal(2 * 2, 5, "multiplies")?;
            Ok(())
        });

        let summary = driver.run().await;
        let events = sink.events();

        assert_eq!(
            summary,
            ScopeSummary {
                asserts: 2,
                failed: 1,
                skipped: 0
            }
        );
        assert_eq!(root_exit(&events), (2, 1, 0));
        assert!(events[0].is_root_enter());
        assert!(events.last().unwrap().is_root_exit());
    }

    #[tokio::test]
    async fn test_stop_on_failure_halts_the_body() {
        let (mut driver, sink) = new_driver(DriverConfig::new().stop_on_failure(true));
        driver.test("fragile", |t| async move {
            t.ok(false, "first")?;
            t.ok(true, "second")?;
            Ok(())
        });
        driver.test("never runs", |t| async move {
            t.ok(true, "third")?;
            Ok(())
        });

        driver.run().await;
        let events = sink.events();

        let names: Vec<_> = assertions(&events).iter().map(|a| a.name.clone()).collect();
        assert_eq!(names, vec!["first"]);
        assert_eq!(root_exit(&events), (1, 1, 0));
        assert!(comments(&events).contains(&"SKIP never runs".to_string()));

        let test_exit = events
            .iter()
            .find(|e| e.scope_id == 1 && matches!(e.kind, EventKind::ScopeExit { .. }))
            .unwrap();
        assert!(matches!(
            test_exit.kind,
            EventKind::ScopeExit {
                asserts: 1,
                failed: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_sequence_ids_continue_through_nested_tests() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.test("outer", |t| async move {
            t.ok(true, "a")?;
            t.test("inner", |t| async move {
                t.ok(true, "b")?;
                t.test("innermost", |t| async move {
                    t.ok(true, "c")?;
                    Ok(())
                })
                .await?;
                Ok(())
            })
            .await?;
            t.ok(true, "d")?;
            Ok(())
        });
        driver.test("second", |t| async move {
            t.ok(true, "e")?;
            Ok(())
        });

        driver.run().await;
        let events = sink.events();
        let ids: Vec<u64> = assertions(&events).iter().map(|a| a.sequence_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(root_exit(&events), (5, 0, 0));
    }

    #[tokio::test]
    async fn test_events_are_well_formed() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.test("outer", |t| async move {
            t.test("inner", |t| async move {
                t.ok(true, "x")?;
                Ok(())
            })
            .await?;
            Ok(())
        });

        driver.run().await;
        assert_well_formed(&sink.events());
    }

    #[tokio::test]
    async fn test_unawaited_nested_tests_still_run() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.test("parent", |t| async move {
            let _ = t.test("first child", |t| async move {
                t.ok(true, "one")?;
                Ok(())
            });
            let _ = t.test("second child", |t| async move {
                t.ok(true, "two")?;
                Ok(())
            });
            t.ok(true, "parent")?;
            Ok(())
        });

        driver.run().await;
        let events = sink.events();
        let names: Vec<_> = assertions(&events).iter().map(|a| a.name.clone()).collect();
        assert_eq!(names, vec!["parent", "one", "two"]);
        assert_eq!(root_exit(&events), (3, 0, 0));
    }

    #[tokio::test]
    async fn test_joined_siblings_do_not_interleave() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.test("parent", |t| async move {
            let slow = t.test("slow", |t| async move {
                t.ok(true, "slow 1")?;
                tokio::time::sleep(Duration::from_millis(20)).await;
                t.ok(true, "slow 2")?;
                Ok(())
            });
            let fast = t.test("fast", |t| async move {
                t.ok(true, "fast 1")?;
                t.ok(true, "fast 2")?;
                Ok(())
            });
            let (a, b) = futures::join!(slow, fast);
            a?;
            b?;
            Ok(())
        });

        driver.run().await;
        let events = sink.events();
        let names: Vec<_> = assertions(&events).iter().map(|a| a.name.clone()).collect();
        let slow_first = names == vec!["slow 1", "slow 2", "fast 1", "fast 2"];
        let fast_first = names == vec!["fast 1", "fast 2", "slow 1", "slow 2"];
        assert!(slow_first || fast_first, "interleaved: {names:?}");
    }

    #[tokio::test]
    async fn test_thrown_errors_become_events() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.test("structured", |_t| async move {
            Err(TestError::from(
                AssertionFailure::new("lengths differ", Operator::Equal)
                    .with_actual(3)
                    .with_expected(4),
            ))
        });
        driver.test("anyhow", |_t| async move {
            Err(TestError::from(anyhow::anyhow!("connection reset")))
        });
        driver.test("panics", |_t| async move {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });
        driver.test("thrown value", |_t| async move { Err(TestError::thrown("plain string")) });

        let summary = driver.run().await;
        let events = sink.events();
        let found = assertions(&events);

        assert_eq!(summary.failed, 4);
        assert_eq!(found[0].operator, Operator::Equal);
        assert_eq!(found[0].actual, Some(serde_json::json!(3)));
        assert_eq!(found[0].expected, Some(serde_json::json!(4)));
        assert!(found[0].at.is_some());
        for assertion in &found[1..] {
            assert_eq!(assertion.operator, Operator::UnexpectedException);
            assert!(assertion.error.is_some());
            assert!(assertion.at.is_none());
        }
        assert_eq!(found[2].error.as_ref().unwrap()["message"], "kaboom");
    }

    #[tokio::test]
    async fn test_unexpected_exception_with_stop_on_failure_cancels() {
        let (mut driver, sink) = new_driver(DriverConfig::new().stop_on_failure(true));
        driver.test("outer", |t| async move {
            let nested = t
                .test("throws", |_t| async move {
                    Err(TestError::from(anyhow::anyhow!("boom")))
                })
                .await;
            assert_eq!(nested, Err(StopRun));
            t.ok(true, "unreachable in a real body")?;
            Ok(())
        });
        driver.test("after", |t| async move {
            t.ok(true, "skipped")?;
            Ok(())
        });

        let summary = driver.run().await;
        let events = sink.events();
        assert_eq!(summary.failed, 1);
        assert!(comments(&events).contains(&"SKIP after".to_string()));
        assert!(events.last().unwrap().cancel_run);
    }

    #[tokio::test]
    async fn test_stop_signal_is_informational() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.test("stops", |_t| async move { Err(TestError::from(StopRun)) });

        let summary = driver.run().await;
        assert_eq!(summary, ScopeSummary::default());
        assert!(comments(&sink.events())
            .iter()
            .any(|c| c.contains("stopped")));
    }

    #[tokio::test]
    async fn test_bail_out_cancels_everything() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.test("bails", |t| async move {
            t.ok(true, "before")?;
            t.bail_out("no database")?;
            t.ok(true, "after")?;
            Ok(())
        });
        driver.test("next", |t| async move {
            t.ok(true, "never")?;
            Ok(())
        });

        driver.run().await;
        let events = sink.events();
        let names: Vec<_> = assertions(&events).iter().map(|a| a.name.clone()).collect();
        assert_eq!(names, vec!["before"]);
        assert!(events.iter().any(|e| e.is_bail_out() && e.cancel_run));
        assert!(comments(&events).contains(&"SKIP next".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_abandons_the_body() {
        let (mut driver, sink) = new_driver(DriverConfig::new().timeout(Duration::from_millis(20)));
        driver.test("hangs", |t| async move {
            t.ok(true, "started")?;
            tokio::time::sleep(Duration::from_secs(60)).await;
            t.ok(true, "finished")?;
            Ok(())
        });
        driver.test("sibling", |t| async move {
            t.ok(true, "sibling runs")?;
            Ok(())
        });

        let summary = driver.run().await;
        let events = sink.events();
        let found = assertions(&events);

        assert_eq!(found.len(), 3);
        assert_eq!(found[1].operator, Operator::Timeout);
        assert_eq!(found[2].name, "sibling runs");
        assert_eq!(summary.failed, 1);
        assert!(comments(&events).iter().any(|c| c.contains("timed out after 20ms")));
    }

    #[tokio::test]
    async fn test_timeout_inside_nested_test_closes_it_first() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        let options = TestOptions::new().timeout(Duration::from_millis(30));
        driver.test_with("outer", options, |t| async move {
            t.test("inner", |t| async move {
                t.ok(true, "inner a")?;
                tokio::time::sleep(Duration::from_secs(60)).await;
                t.ok(true, "inner b")?;
                Ok(())
            })
            .await?;
            Ok(())
        });

        let summary = driver.run().await;
        let events = sink.events();
        assert_well_formed(&events);

        let found = assertions(&events);
        let ids: Vec<_> = found.iter().map(|a| (a.name.as_str(), a.sequence_id)).collect();
        assert_eq!(ids, vec![("inner a", 1), ("outer: timed out", 2)]);
        assert!(found[1].at.is_none());

        let inner_exit = events
            .iter()
            .position(|e| matches!(&e.kind, EventKind::ScopeExit { name, .. } if name == "inner"))
            .unwrap();
        let timeout_comment = events
            .iter()
            .position(|e| matches!(&e.kind, EventKind::Comment { text } if text.contains("timed out")))
            .unwrap();
        assert!(inner_exit < timeout_comment);
        assert_eq!(summary.asserts, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(root_exit(&events), (2, 1, 0));
    }

    #[tokio::test]
    async fn test_parent_assertions_joined_with_nested_test_keep_numbering() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.test("parent", |t| async move {
            let nested = t.test("nested", |t| async move {
                t.ok(true, "nested 1")?;
                tokio::task::yield_now().await;
                t.ok(true, "nested 2")?;
                Ok(())
            });
            let own = async {
                tokio::task::yield_now().await;
                t.ok(true, "parent 1")?;
                tokio::task::yield_now().await;
                t.ok(true, "parent 2")
            };
            let (a, b) = futures::join!(nested, own);
            a?;
            b?;
            Ok(())
        });

        driver.run().await;
        let events = sink.events();
        let mut ids: Vec<u64> = assertions(&events).iter().map(|a| a.sequence_id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "sequence ids: {ids:?}");
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(root_exit(&events), (4, 0, 0));
    }

    #[tokio::test]
    async fn test_nested_test_from_captured_ancestor_is_queued() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.test("outer", |t| async move {
            let outer = t.clone();
            t.test("x", move |x| async move {
                x.ok(true, "x")?;
                let queued = outer
                    .test("y", |y| async move {
                        y.ok(true, "y")?;
                        Ok(())
                    })
                    .await;
                assert_eq!(queued, Ok(()));
                Ok(())
            })
            .await?;
            Ok(())
        });

        let summary = tokio::time::timeout(Duration::from_secs(5), driver.run())
            .await
            .expect("driver deadlocked");
        let events = sink.events();
        assert_well_formed(&events);

        let names: Vec<_> = assertions(&events).iter().map(|a| a.name.clone()).collect();
        assert_eq!(names, vec!["x", "y"]);
        let exit_x = events
            .iter()
            .position(|e| matches!(&e.kind, EventKind::ScopeExit { name, .. } if name == "x"))
            .unwrap();
        let enter_y = events
            .iter()
            .position(|e| matches!(&e.kind, EventKind::ScopeEnter { name, .. } if name == "y"))
            .unwrap();
        assert!(exit_x < enter_y);
        assert_eq!(summary.asserts, 2);
    }

    #[tokio::test]
    async fn test_skip_todo_and_only() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.skip("skipped", |t| async move {
            t.ok(false, "never")?;
            Ok(())
        });
        driver.todo("unfinished", |t| async move {
            t.ok(false, "not yet")?;
            Ok(())
        });

        let summary = driver.run().await;
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.asserts, 1);
        assert!(comments(&sink.events()).contains(&"SKIP skipped".to_string()));

        let (mut driver, sink) = new_driver(DriverConfig::new().only(true));
        driver.test("ignored", |t| async move {
            t.ok(true, "ignored")?;
            Ok(())
        });
        driver.only("focused", |t| async move {
            t.ok(true, "focused")?;
            Ok(())
        });
        let summary = driver.run().await;
        assert_eq!(summary.asserts, 1);
        assert!(comments(&sink.events()).contains(&"SKIP ignored".to_string()));
    }

    #[tokio::test]
    async fn test_hook_order() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let (mut driver, _sink) = new_driver(DriverConfig::new());

        let push = |log: &Arc<Mutex<Vec<String>>>, label: &'static str| {
            let log = Arc::clone(log);
            move || {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(label.to_string());
                    Ok::<(), TestError>(())
                }
            }
        };

        driver.before_all(push(&log, "root before all"));
        driver.after_all(push(&log, "root after all"));
        driver.before_each(push(&log, "root before each 1"));
        driver.before_each(push(&log, "root before each 2"));
        driver.after_each(push(&log, "root after each 1"));
        driver.after_each(push(&log, "root after each 2"));

        let body_log = Arc::clone(&log);
        driver.test("outer", move |t| async move {
            let nested_log = Arc::clone(&body_log);
            t.before_each(push(&body_log, "outer before each"));
            t.after_all(push(&body_log, "outer after all"));
            t.test("inner", move |_t| async move {
                nested_log.lock().unwrap().push("inner body".to_string());
                Ok(())
            })
            .await?;
            Ok(())
        });

        driver.run().await;
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "root before all",
                "root before each 1",
                "root before each 2",
                "root before each 1",
                "root before each 2",
                "outer before each",
                "inner body",
                "root after each 2",
                "root after each 1",
                "outer after all",
                "root after each 2",
                "root after each 1",
                "root after all",
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_hook_is_reported() {
        let (mut driver, sink) = new_driver(DriverConfig::new());
        driver.before_each(|| async { Err(TestError::from(anyhow::anyhow!("fixture missing"))) });
        driver.test("uses fixture", |t| async move {
            t.ok(true, "body")?;
            Ok(())
        });

        let summary = driver.run().await;
        let events = sink.events();
        let found = assertions(&events);
        assert_eq!(summary.failed, 1);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "before each hook: unexpected exception");
    }
}
