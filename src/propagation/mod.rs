//! Distributed trace context propagation (`spec.md` §4.9).

mod trace_parent;

pub use trace_parent::{ParseTraceParentError, TraceParent};
