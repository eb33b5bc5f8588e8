//! Inline (synchronous) delivery path for `async_mode = false` (`spec.md`
//! §6: "`async_mode` — Use background delivery vs. inline").
//!
//! Mirrors `transport::queue`'s worker loop — same buffer, same failure
//! state, same flush-trigger decision (explicit / byte-size / elapsed-time)
//! — but runs synchronously on the calling producer thread instead of a
//! dedicated background thread. This is the path
//! `elasticapm.transport.base.Transport` takes when a host forbids
//! background threads (e.g. certain WSGI workers): `queue()` calls
//! `_process_queue()` directly rather than handing the item to a thread.
//! There is no timer thread to fire an idle flush, so the elapsed-time
//! trigger is instead checked opportunistically on every producer call.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::encode::{Metadata, Record};
use crate::error::AgentError;

use super::buffer::GzipBuffer;
use super::queue::{EventRecord, WorkerConfig};
use super::sender::Sender as BatchSender;
use super::state::FailureState;

struct SyncState {
    buffer: GzipBuffer,
    failure_state: FailureState,
    last_flush: Instant,
    written_since_flush: bool,
}

/// Owned by [`crate::client::Client`] in place of [`super::EventQueue`] +
/// [`super::WorkerHandle`] when `async_mode = false`.
pub struct SyncPipeline {
    metadata: Metadata,
    max_buffer_size: usize,
    max_flush_time: Option<Duration>,
    compress_level: u32,
    sender: Arc<dyn BatchSender>,
    state: Mutex<SyncState>,
}

impl SyncPipeline {
    pub fn new(metadata: Metadata, config: WorkerConfig, sender: Arc<dyn BatchSender>) -> Self {
        let buffer = GzipBuffer::new(&metadata, config.compress_level);
        SyncPipeline {
            max_buffer_size: config.max_buffer_size,
            max_flush_time: config.max_flush_time,
            compress_level: config.compress_level,
            metadata,
            sender,
            state: Mutex::new(SyncState {
                buffer,
                failure_state: FailureState::new(),
                last_flush: Instant::now(),
                written_since_flush: false,
            }),
        }
    }

    /// Encodes and appends `record`, then flushes immediately if the
    /// byte-size threshold or the idle-time threshold has been reached
    /// (`spec.md` §4.6 step 5, evaluated inline instead of via a timed
    /// receive).
    pub fn enqueue(&self, record: EventRecord) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        let append_result = match &record {
            EventRecord::Transaction(t) => state.buffer.append(&Record::Transaction(t)),
            EventRecord::Error(e) => state.buffer.append(&Record::Error(e)),
        };
        if let Err(err) = append_result {
            return Err(AgentError::EncodingError(err.to_string()));
        }
        state.written_since_flush = true;

        let due_by_size = state.buffer.raw_len() > self.max_buffer_size;
        let due_by_time = self
            .max_flush_time
            .is_some_and(|max| state.last_flush.elapsed() >= max);
        if due_by_size || due_by_time {
            self.flush_locked(&mut state);
        }
        Ok(())
    }

    /// Explicit flush (`Client::flush`/`Client::close` call this). Always
    /// succeeds synchronously — there is no background thread to wait on.
    pub fn flush(&self) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        if state.written_since_flush {
            self.flush_locked(&mut state);
        } else {
            state.last_flush = Instant::now();
        }
        Ok(())
    }

    fn flush_locked(&self, state: &mut SyncState) {
        let fresh = GzipBuffer::new(&self.metadata, self.compress_level);
        let finished = std::mem::replace(&mut state.buffer, fresh);
        if state.failure_state.should_try() {
            let bytes = finished.finish();
            match self.sender.send(bytes) {
                Ok(()) => state.failure_state.set_success(),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to deliver event batch");
                    state.failure_state.set_fail();
                }
            }
        } else {
            tracing::warn!("dropping flushed batch: transport is in back-off");
            drop(finished.finish());
        }
        state.written_since_flush = false;
        state.last_flush = Instant::now();
    }
}
