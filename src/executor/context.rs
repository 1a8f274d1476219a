//! Test handle
//!
//! A [`Test`] is what a test body receives. It records assertions in the
//! body's own scope and opens nested tests beneath it.

use futures::future::BoxFuture;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::OwnedMutexGuard;

use super::driver::{run_test, DriverShared, TestDescriptor, TestOptions};
use super::error::{BodyOutcome, TestResult};
use crate::models::{deep_equal, Assertion, Event, Operator, SourceMarker, Value};
use crate::scope::{each_hook, once_hook, EachHook, HookKind, OnceHook, StopRun};

/// Handle to one running test scope
#[derive(Clone)]
pub struct Test {
    shared: Arc<DriverShared>,
    scope_id: u64,
    gate: Arc<tokio::sync::Mutex<()>>,
    pending: Arc<Mutex<VecDeque<TestDescriptor>>>,
}

impl Test {
    pub(crate) fn new(shared: Arc<DriverShared>, scope_id: u64) -> Self {
        Self {
            shared,
            scope_id,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            pending: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn scope_id(&self) -> u64 {
        self.scope_id
    }

    pub(crate) fn shared(&self) -> Arc<DriverShared> {
        Arc::clone(&self.shared)
    }

    /// Held while a nested test of this scope runs
    pub(crate) async fn lock_gate(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.gate).lock_owned().await
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<TestDescriptor>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run nested tests that were created but never awaited, in creation order
    pub(crate) async fn run_pending(&self) {
        loop {
            let next = self.lock_pending().pop_front();
            let Some(descriptor) = next else { break };
            // Cancellation shows up as SKIP comments for the rest.
            let _ = run_test(self.clone(), descriptor).await;
        }
    }

    /// Whether a nested test of this scope is the body being polled now
    fn is_inside_own_child(&self) -> bool {
        match RUNNING.with(Cell::get) {
            Some((driver, inner)) => {
                driver == self.driver_key()
                    && inner != self.scope_id
                    && self.shared.encloses(self.scope_id, inner)
            }
            None => false,
        }
    }

    fn driver_key(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    fn queue(&self, descriptor: TestDescriptor) {
        self.lock_pending().push_back(descriptor);
    }

    pub(crate) fn discard_pending(&self) {
        self.lock_pending().clear();
    }

    // Assertions

    /// Record a prepared assertion in this scope
    ///
    /// Resolves to whether it passed, or to the stop signal when the run is
    /// cancelled and the body should return.
    #[track_caller]
    pub fn assert(&self, assertion: Assertion) -> Result<bool, StopRun> {
        let assertion = match assertion.at {
            Some(_) => assertion,
            None => assertion.at(SourceMarker::caller()),
        };
        self.record(assertion)
    }

    /// Record an assertion as given, without stamping a location
    pub(crate) fn record(&self, assertion: Assertion) -> Result<bool, StopRun> {
        let pass = assertion.pass;
        self.shared
            .emit(self.scope_id, Event::assertion(self.scope_id, assertion))?;
        Ok(pass)
    }

    #[track_caller]
    pub fn ok(&self, value: bool, name: impl Into<String>) -> Result<bool, StopRun> {
        self.assert(
            Assertion::new(name, value, Operator::Ok)
                .with_actual(&Value::Bool(value))
                .with_expected(&Value::Bool(true)),
        )
    }

    #[track_caller]
    pub fn not_ok(&self, value: bool, name: impl Into<String>) -> Result<bool, StopRun> {
        self.assert(
            Assertion::new(name, !value, Operator::NotOk)
                .with_actual(&Value::Bool(value))
                .with_expected(&Value::Bool(false)),
        )
    }

    /// Deep equality
    #[track_caller]
    pub fn equal(
        &self,
        actual: impl Into<Value>,
        expected: impl Into<Value>,
        name: impl Into<String>,
    ) -> Result<bool, StopRun> {
        let (actual, expected) = (actual.into(), expected.into());
        self.compare(deep_equal(&actual, &expected), Operator::Equal, actual, expected, name)
    }

    #[track_caller]
    pub fn not_equal(
        &self,
        actual: impl Into<Value>,
        expected: impl Into<Value>,
        name: impl Into<String>,
    ) -> Result<bool, StopRun> {
        let (actual, expected) = (actual.into(), expected.into());
        self.compare(!deep_equal(&actual, &expected), Operator::NotEqual, actual, expected, name)
    }

    /// Identity: shared nodes must be the same node, other values equal
    #[track_caller]
    pub fn is(
        &self,
        actual: impl Into<Value>,
        expected: impl Into<Value>,
        name: impl Into<String>,
    ) -> Result<bool, StopRun> {
        let (actual, expected) = (actual.into(), expected.into());
        self.compare(actual.same(&expected), Operator::Is, actual, expected, name)
    }

    #[track_caller]
    pub fn is_not(
        &self,
        actual: impl Into<Value>,
        expected: impl Into<Value>,
        name: impl Into<String>,
    ) -> Result<bool, StopRun> {
        let (actual, expected) = (actual.into(), expected.into());
        self.compare(!actual.same(&expected), Operator::IsNot, actual, expected, name)
    }

    #[track_caller]
    fn compare(
        &self,
        pass: bool,
        operator: Operator,
        actual: Value,
        expected: Value,
        name: impl Into<String>,
    ) -> Result<bool, StopRun> {
        self.assert(
            Assertion::new(name, pass, operator)
                .with_actual(&actual)
                .with_expected(&expected),
        )
    }

    #[track_caller]
    pub fn fail(&self, name: impl Into<String>) -> Result<bool, StopRun> {
        self.assert(Assertion::new(name, false, Operator::Fail))
    }

    /// Passes when `f` returns an error or panics
    ///
    /// A stop signal raised inside `f` is not swallowed: it propagates.
    #[track_caller]
    pub fn throws<T, F>(&self, f: F, name: impl Into<String>) -> Result<bool, StopRun>
    where
        F: FnOnce() -> Result<T, super::TestError>,
    {
        let at = SourceMarker::caller();
        let assertion = match call_guarded(f) {
            Thrown::Nothing => Assertion::new(name, false, Operator::Throws),
            Thrown::Stop => return Err(StopRun),
            Thrown::Value(error) => Assertion::new(name, true, Operator::Throws).with_actual(&error),
        };
        self.assert(assertion.at(at))
    }

    #[track_caller]
    pub fn does_not_throw<T, F>(&self, f: F, name: impl Into<String>) -> Result<bool, StopRun>
    where
        F: FnOnce() -> Result<T, super::TestError>,
    {
        let at = SourceMarker::caller();
        let assertion = match call_guarded(f) {
            Thrown::Nothing => Assertion::new(name, true, Operator::DoesNotThrow),
            Thrown::Stop => return Err(StopRun),
            Thrown::Value(error) => {
                Assertion::new(name, false, Operator::DoesNotThrow).with_error(&error)
            }
        };
        self.assert(assertion.at(at))
    }

    pub fn comment(&self, text: impl Into<String>) {
        // Comments never stop a body.
        let _ = self
            .shared
            .emit(self.scope_id, Event::comment(self.scope_id, text));
    }

    /// Abort the whole run; always resolves to the stop signal
    pub fn bail_out(&self, reason: impl Into<String>) -> Result<(), StopRun> {
        self.shared
            .emit(self.scope_id, Event::bail_out(self.scope_id, reason))?;
        Err(StopRun)
    }

    // Nested tests

    /// Open a nested test under this scope
    ///
    /// Awaiting the returned [`SubTest`] runs it right away. When this handle
    /// is captured and used from inside one of its own nested tests, the new
    /// test cannot run until that nested test ends: it is queued instead and
    /// runs after this scope's body returns, and the `SubTest` resolves
    /// immediately.
    pub fn test<F, Fut>(&self, name: impl Into<String>, body: F) -> SubTest
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.test_with(name, TestOptions::default(), body)
    }

    pub fn test_with<F, Fut>(&self, name: impl Into<String>, options: TestOptions, body: F) -> SubTest
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        SubTest {
            parent: self.clone(),
            descriptor: Some(TestDescriptor::new(name, options, body)),
            running: None,
        }
    }

    pub fn skip<F, Fut>(&self, name: impl Into<String>, body: F) -> SubTest
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.test_with(name, TestOptions::new().skip(), body)
    }

    pub fn todo<F, Fut>(&self, name: impl Into<String>, body: F) -> SubTest
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.test_with(name, TestOptions::new().todo(), body)
    }

    pub fn only<F, Fut>(&self, name: impl Into<String>, body: F) -> SubTest
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.test_with(name, TestOptions::new().only(), body)
    }

    // Hooks

    pub fn before_all<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.add_once_hook(HookKind::BeforeAll, once_hook(hook));
    }

    pub fn after_all<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.add_once_hook(HookKind::AfterAll, once_hook(hook));
    }

    pub fn before_each<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.add_each_hook(HookKind::BeforeEach, each_hook(hook));
    }

    pub fn after_each<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.add_each_hook(HookKind::AfterEach, each_hook(hook));
    }

    pub(crate) fn add_once_hook(&self, kind: HookKind, hook: OnceHook) {
        self.shared.with_hooks(self.scope_id, |hooks| match kind {
            HookKind::BeforeAll => hooks.add_before_all(hook),
            HookKind::AfterAll => hooks.add_after_all(hook),
            HookKind::BeforeEach | HookKind::AfterEach => {}
        });
    }

    pub(crate) fn add_each_hook(&self, kind: HookKind, hook: EachHook) {
        self.shared.with_hooks(self.scope_id, |hooks| match kind {
            HookKind::BeforeEach => hooks.add_before_each(hook),
            HookKind::AfterEach => hooks.add_after_each(hook),
            HookKind::BeforeAll | HookKind::AfterAll => {}
        });
    }

    pub(crate) fn take_once_hooks(&self, kind: HookKind) -> Vec<OnceHook> {
        self.shared
            .with_hooks(self.scope_id, |hooks| match kind {
                HookKind::BeforeAll => hooks.take_before_all(),
                HookKind::AfterAll => hooks.take_after_all(),
                HookKind::BeforeEach | HookKind::AfterEach => Vec::new(),
            })
            .unwrap_or_default()
    }
}

impl fmt::Debug for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Test")
            .field("scope_id", &self.scope_id)
            .finish_non_exhaustive()
    }
}

enum Thrown {
    Nothing,
    Stop,
    Value(Value),
}

fn call_guarded<T, F>(f: F) -> Thrown
where
    F: FnOnce() -> Result<T, super::TestError>,
{
    let outcome = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(_)) => return Thrown::Nothing,
        Ok(Err(error)) => error.classify(),
        Err(payload) => BodyOutcome::from_panic(payload),
    };
    match outcome {
        BodyOutcome::Stopped => Thrown::Stop,
        BodyOutcome::Failed(failure) => Thrown::Value(Value::Error(
            crate::models::ErrorValue::new("AssertionError", failure.message),
        )),
        BodyOutcome::Unexpected(value) => Thrown::Value(value),
        BodyOutcome::Completed | BodyOutcome::TimedOut(_) => Thrown::Nothing,
    }
}

thread_local! {
    /// Driver and scope of the test body currently being polled
    static RUNNING: Cell<Option<(usize, u64)>> = const { Cell::new(None) };
}

/// Marks `future` as the body of `test` while it is polled
pub(crate) fn running_in<F: Future>(test: &Test, future: F) -> RunningIn<F> {
    RunningIn {
        frame: (test.driver_key(), test.scope_id),
        future,
    }
}

pub(crate) struct RunningIn<F> {
    frame: (usize, u64),
    future: F,
}

impl<F: Future + Unpin> Future for RunningIn<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let _restore = RestoreFrame(RUNNING.with(|running| running.replace(Some(this.frame))));
        Pin::new(&mut this.future).poll(cx)
    }
}

struct RestoreFrame(Option<(usize, u64)>);

impl Drop for RestoreFrame {
    fn drop(&mut self) {
        RUNNING.with(|running| running.set(self.0));
    }
}

/// A nested test, started on first poll
///
/// Resolves to `Err(StopRun)` once the run is cancelled. Dropping it without
/// polling queues the test to run after the enclosing body returns.
#[must_use = "an unawaited nested test runs only after the enclosing body returns"]
pub struct SubTest {
    parent: Test,
    descriptor: Option<TestDescriptor>,
    running: Option<BoxFuture<'static, Result<(), StopRun>>>,
}

impl Future for SubTest {
    type Output = Result<(), StopRun>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.running.is_none() {
            let Some(descriptor) = this.descriptor.take() else {
                return Poll::Ready(Ok(()));
            };
            if this.parent.is_inside_own_child() {
                // The child holds this scope's gate until it ends.
                this.parent.queue(descriptor);
                return Poll::Ready(Ok(()));
            }
            this.running = Some(run_test(this.parent.clone(), descriptor));
        }
        match this.running.as_mut() {
            Some(running) => running.as_mut().poll(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for SubTest {
    fn drop(&mut self) {
        if let Some(descriptor) = self.descriptor.take() {
            self.parent.queue(descriptor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::driver::{Driver, DriverConfig};
    use crate::executor::{AssertionFailure, TestError};
    use crate::models::{EventKind, SharedValue};
    use crate::output::MemorySink;

    async fn run_single<F, Fut>(config: DriverConfig, body: F) -> Vec<Event>
    where
        F: FnOnce(Test) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        let sink = MemorySink::new();
        let mut driver = Driver::new("item", config, Arc::new(sink.clone()));
        driver.test("single", body);
        driver.run().await;
        sink.events()
    }

    fn assertions(events: &[Event]) -> Vec<Assertion> {
        events.iter().filter_map(Event::as_assertion).cloned().collect()
    }

    #[tokio::test]
    async fn test_assertion_operators() {
        let events = run_single(DriverConfig::new(), |t| async move {
            assert!(t.ok(true, "ok")?);
            assert!(t.not_ok(false, "not ok")?);
            assert!(t.equal(vec![1, 2], vec![1, 2], "equal")?);
            assert!(t.not_equal("a", "b", "not equal")?);
            assert!(!t.equal(1, 2, "unequal")?);
            Ok(())
        })
        .await;

        let found = assertions(&events);
        let operators: Vec<_> = found.iter().map(|a| a.operator).collect();
        assert_eq!(
            operators,
            vec![
                Operator::Ok,
                Operator::NotOk,
                Operator::Equal,
                Operator::NotEqual,
                Operator::Equal
            ]
        );
        assert!(found[..4].iter().all(|a| a.pass));
        assert_eq!(found[4].actual, Some(serde_json::json!(1)));
        assert_eq!(found[4].expected, Some(serde_json::json!(2)));
        assert!(found[0].at.as_ref().unwrap().file.ends_with("context.rs"));
    }

    #[tokio::test]
    async fn test_identity_versus_equality() {
        let events = run_single(DriverConfig::new(), |t| async move {
            let node = SharedValue::new(vec![1, 2]);
            let copy = SharedValue::new(vec![1, 2]);
            t.is(node.clone(), node.clone(), "same node")?;
            t.is_not(node.clone(), copy.clone(), "different node")?;
            t.equal(node, copy, "same contents")?;
            Ok(())
        })
        .await;

        assert!(assertions(&events).iter().all(|a| a.pass));
    }

    #[tokio::test]
    async fn test_throws_and_does_not_throw() {
        let events = run_single(DriverConfig::new(), |t| async move {
            t.throws(
                || Err::<(), _>(TestError::from(anyhow::anyhow!("bad input"))),
                "returns an error",
            )?;
            t.throws(
                || -> Result<(), TestError> { panic!("overflow") },
                "panics",
            )?;
            t.throws(|| Ok::<_, TestError>(1), "does not throw")?;
            t.does_not_throw(|| Ok::<_, TestError>(()), "clean")?;
            t.does_not_throw(
                || Err::<(), _>(TestError::from(AssertionFailure::new("nope", Operator::Ok))),
                "fails",
            )?;
            Ok(())
        })
        .await;

        let passes: Vec<bool> = assertions(&events).iter().map(|a| a.pass).collect();
        assert_eq!(passes, vec![true, true, false, true, false]);
        let found = assertions(&events);
        assert_eq!(found[1].actual.as_ref().unwrap()["message"], "overflow");
        assert!(found[4].error.is_some());
    }

    #[tokio::test]
    async fn test_throws_lets_stop_through() {
        let events = run_single(DriverConfig::new(), |t| async move {
            let result = t.throws(|| Err::<(), _>(TestError::from(StopRun)), "stop inside");
            assert_eq!(result, Err(StopRun));
            result?;
            Ok(())
        })
        .await;

        assert!(assertions(&events).is_empty());
    }

    #[tokio::test]
    async fn test_fail_and_comment() {
        let events = run_single(DriverConfig::new(), |t| async move {
            t.comment("about to fail");
            assert!(!t.fail("explicit failure")?);
            Ok(())
        })
        .await;

        assert!(events
            .iter()
            .any(|e| matches!(&e.kind, EventKind::Comment { text } if text == "about to fail")));
        let found = assertions(&events);
        assert_eq!(found[0].operator, Operator::Fail);
        assert!(!found[0].pass);
    }

    #[tokio::test]
    async fn test_assertions_after_stop_resolve_to_stop() {
        let events = run_single(DriverConfig::new().stop_on_failure(true), |t| async move {
            assert_eq!(t.ok(false, "trips"), Err(StopRun));
            assert_eq!(t.ok(true, "after"), Err(StopRun));
            Ok(())
        })
        .await;

        let found = assertions(&events);
        assert_eq!(found.len(), 2);
        assert!(found[1].skip);
    }

    #[tokio::test]
    async fn test_skipped_nested_tests_emit_only_a_comment() {
        let events = run_single(DriverConfig::new(), |t| async move {
            t.skip("later", |t| async move {
                t.ok(true, "never")?;
                Ok(())
            })
            .await?;
            t.todo("unfinished", |t| async move {
                t.ok(false, "pending work")?;
                Ok(())
            })
            .await?;
            Ok(())
        })
        .await;

        let found = assertions(&events);
        assert_eq!(found.len(), 1);
        assert!(found[0].todo);
        assert!(events
            .iter()
            .any(|e| matches!(&e.kind, EventKind::Comment { text } if text == "SKIP later")));
    }

    #[tokio::test]
    async fn test_nested_hooks_fire_once() {
        let sink = MemorySink::new();
        let mut driver = Driver::new("item", DriverConfig::new(), Arc::new(sink.clone()));
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        driver.test("group", move |t| async move {
            let counter = Arc::clone(&counter);
            t.before_all(move || async move {
                *counter.lock().unwrap() += 1;
                Ok::<(), TestError>(())
            });
            for name in ["a", "b", "c"] {
                t.test(name, |t| async move {
                    t.ok(true, "child")?;
                    Ok(())
                })
                .await?;
            }
            Ok(())
        });

        let summary = driver.run().await;
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(summary.asserts, 3);
    }
}
