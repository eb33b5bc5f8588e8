//! Span records and the fingerprint used to detect repeated siblings.
//!
//! Split into a mutable in-progress shape (tracked on the transaction's
//! stack) and this finished `Span` record, the way
//! `opentelemetry_sdk::trace::span` separates the live `Span` handle from
//! the exported `SpanData`. The fingerprint digest and the fold-vs-clone
//! compression rule below are ported from `elasticapm.traces.Span`.

use std::cell::OnceCell;
use std::time::Duration;

/// A single stack frame, produced by an external frame collector.
///
/// This core never inspects a frame's contents beyond what the fingerprint
/// needs; source-line extraction is out of scope (`spec.md` §1).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Frame {
    pub abs_path: Option<String>,
    pub filename: Option<String>,
    pub module: Option<String>,
    pub function: Option<String>,
    pub lineno: Option<u32>,
    pub context_line: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pre_context: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_context: Vec<String>,
    pub in_app: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<serde_json::Value>,
}

/// External collaborator that turns a skip-count into the current call
/// stack's frames. Provided by the host; this core treats it as opaque
/// (`spec.md` §1: "pure utilities; the core consumes their results as
/// opaque records").
pub trait FrameCollector: Send + Sync {
    fn collect(&self, skip_frames: u32) -> Vec<Frame>;
}

/// Collects nothing. Used when the host hasn't wired up frame extraction,
/// and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFrameCollector;

impl FrameCollector for NoopFrameCollector {
    fn collect(&self, _skip_frames: u32) -> Vec<Frame> {
        Vec::new()
    }
}

/// A finished, nested timed operation within a transaction.
#[derive(Debug, Clone)]
pub struct Span {
    pub index: u32,
    pub name: String,
    pub span_type: String,
    pub start_offset: Duration,
    pub duration: Duration,
    pub parent_index: Option<u32>,
    pub context: Option<serde_json::Value>,
    pub frames: Vec<Frame>,
    pub leaf: bool,
    /// Number of original occurrences this span represents once it becomes
    /// a compression group; `0` for an ordinary, never-folded span.
    pub count: u32,
    fingerprint_vector: Vec<String>,
    fingerprint: OnceCell<u128>,
}

impl Span {
    pub(crate) fn new(
        index: u32,
        name: String,
        span_type: String,
        start_offset: Duration,
        context: Option<serde_json::Value>,
        fingerprint_vector: Vec<String>,
        leaf: bool,
    ) -> Self {
        Span {
            index,
            name,
            span_type,
            start_offset,
            duration: Duration::ZERO,
            parent_index: None,
            context,
            frames: Vec::new(),
            leaf,
            count: 0,
            fingerprint_vector,
            fingerprint: OnceCell::new(),
        }
    }

    /// Stable 128-bit digest over `(name, type, fingerprint_vector OR frame
    /// identity tuples)` (`spec.md` §3). Computed lazily and memoized since
    /// it is consulted at most once or twice per span, during compression.
    pub fn fingerprint(&self) -> u128 {
        *self.fingerprint.get_or_init(|| {
            let mut h = Fnv1a128::new();
            h.write(self.name.as_bytes());
            h.write(self.span_type.as_bytes());
            if !self.fingerprint_vector.is_empty() {
                for part in &self.fingerprint_vector {
                    h.write(part.as_bytes());
                }
            } else {
                for frame in &self.frames {
                    h.write(frame.abs_path.as_deref().unwrap_or("").as_bytes());
                    h.write(frame.module.as_deref().unwrap_or("").as_bytes());
                    h.write(frame.function.as_deref().unwrap_or("").as_bytes());
                    if let Some(lineno) = frame.lineno {
                        h.write(&lineno.to_le_bytes());
                    }
                }
            }
            h.finish128()
        })
    }
}

/// FNV-1a extended to 128 bits by running two independent 64-bit lanes over
/// the same input and concatenating them. Not cryptographic; fingerprints
/// never leave the process (`spec.md` §3: "Used solely for child
/// compression" — see `DESIGN.md`).
struct Fnv1a128 {
    lane_a: u64,
    lane_b: u64,
}

impl Fnv1a128 {
    const OFFSET_A: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME_A: u64 = 0x0000_0100_0000_01b3;
    const OFFSET_B: u64 = 0x9e37_79b9_7f4a_7c15;
    const PRIME_B: u64 = 0x1000_0000_01b3_0000 | 1;

    fn new() -> Self {
        Fnv1a128 {
            lane_a: Self::OFFSET_A,
            lane_b: Self::OFFSET_B,
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.lane_a ^= b as u64;
            self.lane_a = self.lane_a.wrapping_mul(Self::PRIME_A);
            self.lane_b ^= (b as u64).rotate_left(1);
            self.lane_b = self.lane_b.wrapping_mul(Self::PRIME_B);
        }
        // Separator so adjacent fields ("ab", "c") and ("a", "bc") don't collide.
        self.lane_a ^= 0xff;
        self.lane_a = self.lane_a.wrapping_mul(Self::PRIME_A);
        self.lane_b ^= 0xff;
        self.lane_b = self.lane_b.wrapping_mul(Self::PRIME_B);
    }

    fn finish128(&self) -> u128 {
        ((self.lane_a as u128) << 64) | self.lane_b as u128
    }
}
