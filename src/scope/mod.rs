//! Hierarchical scope accounting
//!
//! Every nested test boundary is a scope. Scopes count assertions, assign
//! sequence ids, stamp timing, propagate cancellation and hold hooks.

mod chain;
mod hooks;
mod signal;
mod state;

pub use chain::ScopeChain;
pub use hooks::{each_hook, once_hook, EachHook, HookFuture, HookKind, HookSet, OnceHook};
pub use signal::{StopRun, STOP_MESSAGE, STOP_NAME};
pub use state::{ScopeOptions, ScopeState, ScopeSummary};
