//! In-process trace context model: transactions, spans, sampling and
//! ignore-pattern filtering.
//!
//! Mirrors the shape of `opentelemetry_sdk::trace`: a mutable-builder
//! `Transaction`/`Span` pair that accumulates state over its lifetime, then
//! is handed off as an immutable record once finished.

mod ignore;
mod sampler;
mod span;
mod transaction;

pub use ignore::IgnorePatterns;
pub use sampler::{ConstantSampler, DeterministicSampler, RandomSampler, Sampler};
pub use span::{Frame, FrameCollector, NoopFrameCollector, Span};
pub use transaction::{FinishedTransaction, Transaction};
