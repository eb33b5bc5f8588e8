//! Identifier types and generation.
//!
//! Mirrors the shape of `opentelemetry_sdk`'s `IdGenerator`: a trait so
//! tests can supply deterministic ids, with a thread-local `SmallRng`-backed
//! default.

use std::cell::RefCell;
use std::fmt;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// 128-bit transaction/trace identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(pub u128);

/// 64-bit span identifier (used both for in-process span index correlation
/// in diagnostics and for the W3C `parent-id` on the wire).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub u64);

impl TraceId {
    pub const INVALID: TraceId = TraceId(0);

    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ParseIdError> {
        if s.len() != 32 {
            return Err(ParseIdError);
        }
        u128::from_str_radix(s, 16)
            .map(TraceId)
            .map_err(|_| ParseIdError)
    }
}

impl SpanId {
    pub const INVALID: SpanId = SpanId(0);

    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ParseIdError> {
        if s.len() != 16 {
            return Err(ParseIdError);
        }
        u64::from_str_radix(s, 16)
            .map(SpanId)
            .map_err(|_| ParseIdError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseIdError;

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed identifier")
    }
}

impl std::error::Error for ParseIdError {}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.to_hex())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.to_hex())
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Generates new trace and span identifiers.
///
/// Implementations must be cheap and thread-safe; the default draws from a
/// thread-local PRNG so concurrent flows never contend on a shared lock.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    fn new_trace_id(&self) -> TraceId;
    fn new_span_id(&self) -> SpanId;
}

/// Default [`IdGenerator`]: thread-local `SmallRng`.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| TraceId(rng.borrow_mut().random::<u128>()))
    }

    fn new_span_id(&self) -> SpanId {
        CURRENT_RNG.with(|rng| SpanId(rng.borrow_mut().random::<u64>()))
    }
}

thread_local! {
    static CURRENT_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_os_rng());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_hex_round_trip() {
        let id = TraceId(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736);
        assert_eq!(TraceId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn span_id_hex_round_trip() {
        let id = SpanId(0x00f0_67aa_0ba9_02b7);
        assert_eq!(SpanId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(TraceId::from_hex("00").is_err());
        assert!(SpanId::from_hex("00").is_err());
    }

    #[test]
    fn random_ids_are_nonzero_and_vary() {
        let gen = RandomIdGenerator::default();
        let a = gen.new_trace_id();
        let b = gen.new_trace_id();
        assert_ne!(a, b);
        assert_ne!(a.0, 0);
    }
}
