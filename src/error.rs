//! Error kinds surfaced by this core, and the error/message capture record.
//!
//! The kinds mirror `spec.md` §7 exactly; the enum shape and `#[error(...)]`
//! messages follow `thiserror`-based enums elsewhere in the corpus (e.g.
//! `opentelemetry_sdk`'s own `Error` types).

use std::time::SystemTime;

use crate::ids::TraceId;
use crate::trace::Frame;

/// Errors this core can report. Per `spec.md` §7, none of these are ever
/// raised from producer-visible API in the steady state — they are logged
/// (see the `tracing` calls at each call site) and, for `close`/`flush`,
/// optionally returned to distinguish a clean shutdown from a forced one.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Surfaced only at client construction; after this the client runs
    /// with `disable_send=true` and accepts calls as no-ops.
    #[error("invalid agent configuration: {0}")]
    ConfigurationInvalid(String),

    /// The bounded event queue was full; the event was dropped.
    #[error("event queue is full, event dropped")]
    QueueFull,

    /// A record could not be serialized; it was skipped and the worker
    /// continued.
    #[error("failed to encode event: {0}")]
    EncodingError(String),

    /// A batch failed to reach the collector. Feeds the failure state
    /// machine; never surfaced to producer flows.
    #[error("failed to deliver event batch: {0}")]
    TransportFailure(String),

    /// Caller misuse (double `end_transaction`, tagging with no current
    /// transaction, an invalid tag key, ...). Logged at warning, never
    /// thrown.
    #[error("invalid use of the capture API: {0}")]
    UserApiMisuse(String),

    /// `close()`/`flush()` exceeded `max_flush_time` waiting for the
    /// worker's completion signal.
    #[error("timed out waiting for the event queue to flush")]
    FlushTimeout,
}

/// An exception or log message captured outside the span model
/// (`spec.md` §3 "Error / Message record"). Immutable once built.
///
/// Serialized onto the wire via `encode::ErrorWire`, which adds the fields
/// here that need conversion (`transaction_id` as hex, `timestamp` as
/// epoch micros) rather than deriving `Serialize` directly on this type.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub exception_type: Option<String>,
    pub exception_module: Option<String>,
    pub message: Option<String>,
    pub param_message: Option<String>,
    pub logger_name: Option<String>,
    pub handled: bool,
    pub frames: Vec<Frame>,
    pub culprit: Option<String>,
    pub transaction_id: Option<TraceId>,
    pub timestamp: SystemTime,
    pub custom_context: Option<serde_json::Value>,
}

impl ErrorEvent {
    pub fn for_exception(
        exception_type: impl Into<String>,
        exception_module: impl Into<String>,
        message: impl Into<String>,
        handled: bool,
        transaction_id: Option<TraceId>,
    ) -> Self {
        ErrorEvent {
            exception_type: Some(exception_type.into()),
            exception_module: Some(exception_module.into()),
            message: Some(message.into()),
            param_message: None,
            logger_name: None,
            handled,
            frames: Vec::new(),
            culprit: None,
            transaction_id,
            timestamp: SystemTime::now(),
            custom_context: None,
        }
    }

    pub fn for_message(
        message: impl Into<String>,
        param_message: Option<String>,
        logger_name: impl Into<String>,
        transaction_id: Option<TraceId>,
        custom_context: Option<serde_json::Value>,
    ) -> Self {
        ErrorEvent {
            exception_type: None,
            exception_module: None,
            message: Some(message.into()),
            param_message,
            logger_name: Some(logger_name.into()),
            handled: true,
            frames: Vec::new(),
            culprit: None,
            transaction_id,
            timestamp: SystemTime::now(),
            custom_context,
        }
    }
}
