//! Output module
//!
//! Sinks that receive the final ordered event stream.

mod sink;

pub use sink::{EventSink, MemorySink, NdjsonSink};
