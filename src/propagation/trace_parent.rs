//! W3C `traceparent` parsing and formatting.
//!
//! The validation rules (hex-only, lowercase-only, 4-dash-delimited fields)
//! are ported from `opentelemetry_sdk`'s
//! `TraceContextPropagator::extract_span_context`; unlike that propagator
//! this type only models the single header this core needs and never
//! touches `tracestate`, which is out of scope here.

use std::fmt;

use crate::ids::{ParseIdError, SpanId, TraceId};

const SUPPORTED_VERSION: u8 = 0;

/// A parsed (or freshly minted) W3C `traceparent` value:
/// `version-trace_id-parent_id-flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceParent {
    pub version: u8,
    pub trace_id: TraceId,
    pub parent_id: SpanId,
    pub flags: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseTraceParentError;

impl fmt::Display for ParseTraceParentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed traceparent header")
    }
}

impl std::error::Error for ParseTraceParentError {}

impl From<ParseIdError> for ParseTraceParentError {
    fn from(_: ParseIdError) -> Self {
        ParseTraceParentError
    }
}

impl TraceParent {
    /// `TraceParent.from_string(s)` (`spec.md` §4.9). Rejects uppercase hex,
    /// out-of-range versions, and anything other than exactly 4 dash
    /// fields for version 0 — mirroring the teacher's extraction rules so
    /// that malformed or foreign-format input never panics or corrupts
    /// state, only yields an error the caller turns into "start a new
    /// root" (`spec.md` §4.9: "Missing or malformed input yields a new
    /// root").
    pub fn from_string(s: &str) -> Result<Self, ParseTraceParentError> {
        let s = s.trim();
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() < 4 {
            return Err(ParseTraceParentError);
        }

        let version = u8::from_str_radix(parts[0], 16).map_err(|_| ParseTraceParentError)?;
        if version == 0 && parts.len() != 4 {
            return Err(ParseTraceParentError);
        }

        if parts[1].chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ParseTraceParentError);
        }
        let trace_id = TraceId::from_hex(parts[1])?;
        if trace_id.0 == 0 {
            return Err(ParseTraceParentError);
        }

        if parts[2].chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ParseTraceParentError);
        }
        let parent_id = SpanId::from_hex(parts[2])?;
        if parent_id.0 == 0 {
            return Err(ParseTraceParentError);
        }

        let flags = u8::from_str_radix(parts[3], 16).map_err(|_| ParseTraceParentError)?;
        if version == 0 && flags > 2 {
            return Err(ParseTraceParentError);
        }

        Ok(TraceParent {
            version,
            trace_id,
            parent_id,
            flags,
        })
    }

    /// Mints a fresh root traceparent for a trace beginning here.
    pub fn new_root(trace_id: TraceId, span_id: SpanId, sampled: bool) -> Self {
        TraceParent {
            version: SUPPORTED_VERSION,
            trace_id,
            parent_id: span_id,
            flags: if sampled { 1 } else { 0 },
        }
    }

    /// Injects a new `parent_id` (typically a child span's id) into an
    /// outbound copy of this context, as instrumentation does before
    /// calling into a downstream service (`spec.md` §4.9: "a child span's
    /// ID is injected into a fresh TraceParent via `copy_from`").
    pub fn copy_from(&self, span_id: SpanId) -> Self {
        TraceParent {
            version: self.version,
            trace_id: self.trace_id,
            parent_id: span_id,
            flags: self.flags,
        }
    }

    pub fn sampled(&self) -> bool {
        self.flags & 0x01 != 0
    }

    /// Serializes to the lowercase-hex ASCII wire form (`spec.md` §6).
    pub fn to_ascii(&self) -> String {
        format!(
            "{:02x}-{}-{}-{:02x}",
            self.version,
            self.trace_id.to_hex(),
            self.parent_id.to_hex(),
            self.flags
        )
    }
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ascii())
    }
}
