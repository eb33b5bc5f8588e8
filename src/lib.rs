//! Core of an in-process application performance monitoring agent.
//!
//! This crate owns three tightly coupled subsystems: the in-process trace
//! context model (transactions and spans, with head-based sampling and
//! child-span compression), per-flow context propagation (binding "the
//! current transaction" to the executing OS thread), and the event
//! transport pipeline (a single background worker that frames finished
//! transactions and errors into a gzipped ndjson stream and delivers them to
//! a remote collector).
//!
//! Framework- and library-specific instrumentation, configuration loading
//! from environment or files, and stack-frame/source-line extraction are
//! deliberately external to this crate; callers provide them.

pub mod api;
pub mod client;
pub mod config;
pub mod context;
pub mod encode;
pub mod error;
pub mod ids;
pub mod propagation;
pub mod trace;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::ScopedSpan;
pub use client::Client;
pub use config::AgentConfig;
pub use error::AgentError;
pub use ids::{SpanId, TraceId};
pub use trace::{Span, Transaction};
