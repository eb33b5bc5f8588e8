//! Gzip-framed ndjson accumulation buffer (`spec.md` §4.7).
//!
//! Re-expresses `elasticapm.transport.base.Transport._init_buffer`/`_flush`
//! with `flate2::write::GzEncoder`, the same crate the teacher's own
//! `gzip-http` exporter feature depends on.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::encode::{encode_line, Metadata, Record};

/// Accumulates ndjson lines inside a gzip stream, seeded with the
/// `metadata` line every fresh batch must start with.
pub struct GzipBuffer {
    encoder: GzEncoder<Vec<u8>>,
    raw_len: usize,
    compress_level: u32,
}

impl GzipBuffer {
    /// `compress_level` is clamped to `[0, 9]` (`spec.md` §4.7).
    pub fn new(metadata: &Metadata, compress_level: u32) -> Self {
        let mut buf = GzipBuffer {
            encoder: GzEncoder::new(Vec::new(), Compression::new(compress_level.min(9))),
            raw_len: 0,
            compress_level: compress_level.min(9),
        };
        // The metadata record can't itself fail to encode: it has no
        // caller-supplied data. A failure here would be a programmer error.
        buf.append(&Record::Metadata(metadata))
            .expect("metadata record must always encode");
        buf
    }

    /// Appends one record as a line. Returns an encoding error without
    /// touching the buffer if serialization fails (`spec.md` §7:
    /// "EncodingError — logged; the offending record is skipped").
    pub fn append(&mut self, record: &Record<'_>) -> Result<(), serde_json::Error> {
        let line = encode_line(record)?;
        self.raw_len += line.len();
        // Write failures on an in-memory GzEncoder can't happen in practice;
        // treat them as fatal rather than threading a second error type
        // through every call site.
        self.encoder
            .write_all(line.as_bytes())
            .expect("writing to an in-memory gzip buffer cannot fail");
        Ok(())
    }

    /// Uncompressed byte size written so far — what `max_buffer_size` is
    /// measured against (`spec.md` §4.6 step 5).
    pub fn raw_len(&self) -> usize {
        self.raw_len
    }

    /// Closes the gzip stream and returns the compressed bytes, consuming
    /// the buffer.
    pub fn finish(self) -> Vec<u8> {
        self.encoder
            .finish()
            .expect("finishing an in-memory gzip stream cannot fail")
    }

    /// Resets to a fresh gzip stream seeded with a new metadata record
    /// (`spec.md` §4.6 step 6).
    pub fn reset(self, metadata: &Metadata) -> Self {
        GzipBuffer::new(metadata, self.compress_level)
    }
}
