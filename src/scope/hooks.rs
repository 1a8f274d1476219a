//! Lifecycle hooks registered on a scope

use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::executor::TestResult;

pub type HookFuture = BoxFuture<'static, TestResult>;

/// Runs at most once: `before_all` / `after_all`
pub type OnceHook = Box<dyn FnOnce() -> HookFuture + Send>;

/// Runs around every nested test: `before_each` / `after_each`
pub type EachHook = Arc<dyn Fn() -> HookFuture + Send + Sync>;

pub fn once_hook<F, Fut>(hook: F) -> OnceHook
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = TestResult> + Send + 'static,
{
    Box::new(move || hook().boxed())
}

pub fn each_hook<F, Fut>(hook: F) -> EachHook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TestResult> + Send + 'static,
{
    Arc::new(move || hook().boxed())
}

/// Which lifecycle point a hook belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

impl HookKind {
    pub fn label(&self) -> &'static str {
        match self {
            HookKind::BeforeAll => "before all",
            HookKind::AfterAll => "after all",
            HookKind::BeforeEach => "before each",
            HookKind::AfterEach => "after each",
        }
    }
}

/// Ordered hook lists of one scope
///
/// `before_all` and `after_all` are consumed when taken, so each fires once
/// even if more are registered after the scope started. `before*` lists come
/// out in registration order, `after*` lists reversed.
#[derive(Default)]
pub struct HookSet {
    before_all: Vec<OnceHook>,
    after_all: Vec<OnceHook>,
    before_each: Vec<EachHook>,
    after_each: Vec<EachHook>,
}

impl HookSet {
    pub fn add_before_all(&mut self, hook: OnceHook) {
        self.before_all.push(hook);
    }

    pub fn add_after_all(&mut self, hook: OnceHook) {
        self.after_all.push(hook);
    }

    pub fn add_before_each(&mut self, hook: EachHook) {
        self.before_each.push(hook);
    }

    pub fn add_after_each(&mut self, hook: EachHook) {
        self.after_each.push(hook);
    }

    pub fn take_before_all(&mut self) -> Vec<OnceHook> {
        std::mem::take(&mut self.before_all)
    }

    pub fn take_after_all(&mut self) -> Vec<OnceHook> {
        let mut hooks = std::mem::take(&mut self.after_all);
        hooks.reverse();
        hooks
    }

    pub fn before_each(&self) -> Vec<EachHook> {
        self.before_each.clone()
    }

    pub fn after_each(&self) -> Vec<EachHook> {
        self.after_each.iter().rev().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.before_all.is_empty()
            && self.after_all.is_empty()
            && self.before_each.is_empty()
            && self.after_each.is_empty()
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("before_all", &self.before_all.len())
            .field("after_all", &self.after_all.len())
            .field("before_each", &self.before_each.len())
            .field("after_each", &self.after_each.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> OnceHook {
        let log = Arc::clone(log);
        once_hook(move || async move {
            log.lock().unwrap().push(label);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_once_hooks_are_consumed_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookSet::default();
        hooks.add_before_all(recorder(&log, "b1"));
        hooks.add_before_all(recorder(&log, "b2"));
        hooks.add_after_all(recorder(&log, "a1"));
        hooks.add_after_all(recorder(&log, "a2"));

        for hook in hooks.take_before_all() {
            hook().await.unwrap();
        }
        for hook in hooks.take_after_all() {
            hook().await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec!["b1", "b2", "a2", "a1"]);
        assert!(hooks.take_before_all().is_empty());
        assert!(hooks.is_empty());
    }

    #[tokio::test]
    async fn test_each_hooks_are_retained() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookSet::default();
        for label in ["e1", "e2"] {
            let log = Arc::clone(&log);
            hooks.add_after_each(each_hook(move || {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(label);
                    Ok(())
                }
            }));
        }

        for _ in 0..2 {
            for hook in hooks.after_each() {
                hook().await.unwrap();
            }
        }

        assert_eq!(*log.lock().unwrap(), vec!["e2", "e1", "e2", "e1"]);
    }
}
