//! The scoped-span guard.
//!
//! `spec.md` §9: "model as a resource with guaranteed release (stack-scoped
//! destructor, deferred cleanup, or `finally` equivalent)". In Rust that's
//! a `Drop` guard, the same shape as `opentelemetry::Context`'s
//! `ContextGuard` or any RAII span handle in the corpus.

use crate::client::Client;

/// Acquired by [`Client::scoped_span`]; releases (ends) the span on every
/// exit path — normal return, early `?`, or panic unwind — the way
/// `elasticapm.traces.capture_span.__exit__` always calls `end_span`
/// regardless of how `__enter__`'s body exited.
///
/// A no-op when there was no current transaction (or it wasn't sampled) at
/// acquisition time (`spec.md` §4.5: "When invoked on a thread/task with no
/// current transaction, is a no-op").
#[must_use = "dropping this immediately ends the span"]
pub struct ScopedSpan<'a> {
    pub(crate) client: &'a Client,
    pub(crate) active: bool,
    pub(crate) skip_frames: u32,
}

impl Drop for ScopedSpan<'_> {
    fn drop(&mut self) {
        if self.active {
            self.client.end_span(self.skip_frames);
        }
    }
}
