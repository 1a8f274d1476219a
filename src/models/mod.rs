//! Data models for test runs
//!
//! Events emitted by work items, the payload values they carry, and the
//! work items themselves.

mod event;
mod value;
mod work_item;

pub use event::{Assertion, Event, EventKind, Operator, SourceMarker, StreamChannel, ROOT_SCOPE};
pub use value::{deep_equal, revive, sanitize, ErrorValue, SharedValue, Value, TYPE_MARKER};
pub use work_item::{TaskId, WorkItem};
