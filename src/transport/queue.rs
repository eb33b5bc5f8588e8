//! Bounded MPSC event queue and its single dedicated consumer thread.
//!
//! The thread/channel/shutdown-handshake shape is
//! `opentelemetry_sdk::trace::span_processor::SimpleSpanProcessor`'s
//! (`crossbeam_channel`, a named background thread, a bounded rendezvous
//! channel used purely as a completion signal for `Flush`/`Shutdown`); the
//! flush-trigger decision tree inside the loop is
//! `elasticapm.transport.base.Transport._process_queue`'s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::encode::{Metadata, Record};
use crate::error::{AgentError, ErrorEvent};
use crate::trace::FinishedTransaction;

use super::buffer::GzipBuffer;
use super::sender::Sender as BatchSender;
use super::state::FailureState;

const QUEUE_CAPACITY: usize = 10_000;

/// One finished record ready for the worker to frame and send.
#[derive(Debug)]
pub enum EventRecord {
    Transaction(FinishedTransaction),
    Error(ErrorEvent),
}

enum QueueItem {
    Record(EventRecord),
    Flush(Sender<()>),
    Close(Sender<()>),
}

/// Tuning knobs the worker loop needs; the rest of [`crate::config::AgentConfig`]
/// is consumed before the worker starts.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_flush_time: Option<Duration>,
    pub max_buffer_size: usize,
    pub compress_level: u32,
}

/// The producer-facing handle: a cheap-to-clone sender plus a flag the
/// worker flips when it terminates, so a producer after `close()` knows
/// further sends are pointless.
#[derive(Debug, Clone)]
pub struct EventQueue {
    sender: Sender<QueueItem>,
    closed: Arc<AtomicBool>,
}

/// Owns the worker's `JoinHandle`. Held by [`crate::client::Client`] so
/// `close()` can join the thread after the completion handshake.
pub struct WorkerHandle {
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn join(&mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl EventQueue {
    /// Spawns the dedicated worker thread and returns the producer handle
    /// plus a join handle for clean shutdown. Per `spec.md` §5's fork
    /// semantics, callers that know the host pre-forks should defer this
    /// until the post-fork hook in each child, never calling it in the
    /// parent.
    pub fn spawn(
        metadata: Metadata,
        config: WorkerConfig,
        sender: Arc<dyn BatchSender>,
    ) -> (Self, WorkerHandle) {
        let (tx, rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let worker_closed = Arc::clone(&closed);

        let join = std::thread::Builder::new()
            .name("apm-event-worker".to_string())
            .spawn(move || {
                run_worker(rx, metadata, config, sender);
                worker_closed.store(true, Ordering::Release);
            })
            .expect("failed to spawn the event worker thread");

        (
            EventQueue {
                sender: tx,
                closed,
            },
            WorkerHandle { join: Some(join) },
        )
    }

    /// Non-blocking enqueue. Producers MUST NEVER block (`spec.md` §4.6):
    /// on a full queue the event is dropped and [`AgentError::QueueFull`]
    /// is returned for the caller to log.
    pub fn enqueue(&self, record: EventRecord) -> Result<(), AgentError> {
        match self.sender.try_send(QueueItem::Record(record)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AgentError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(AgentError::QueueFull),
        }
    }

    /// Enqueues a flush-only sentinel and waits up to `timeout` for the
    /// worker's completion signal (`spec.md` §5).
    pub fn flush(&self, timeout: Duration) -> Result<(), AgentError> {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(0);
        if self.sender.send(QueueItem::Flush(ack_tx)).is_err() {
            return Ok(()); // worker already gone; nothing to flush
        }
        ack_rx
            .recv_timeout(timeout)
            .map_err(|_| AgentError::FlushTimeout)
    }

    /// Enqueues the close sentinel and waits up to `timeout` for the
    /// worker to drain and terminate.
    pub fn close(&self, timeout: Duration) -> Result<(), AgentError> {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(0);
        if self.sender.send(QueueItem::Close(ack_tx)).is_err() {
            return Ok(());
        }
        ack_rx
            .recv_timeout(timeout)
            .map_err(|_| AgentError::FlushTimeout)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn run_worker(
    rx: Receiver<QueueItem>,
    metadata: Metadata,
    config: WorkerConfig,
    sender: Arc<dyn BatchSender>,
) {
    let mut buffer = GzipBuffer::new(&metadata, config.compress_level);
    let mut written_since_flush = false;
    let mut failure_state = FailureState::new();
    let mut last_flush = Instant::now();

    loop {
        let recv_result = match config.max_flush_time {
            Some(max_flush_time) => {
                let elapsed = last_flush.elapsed();
                let timeout = max_flush_time.saturating_sub(elapsed);
                rx.recv_timeout(timeout)
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match recv_result {
            Ok(QueueItem::Close(ack)) => {
                if written_since_flush {
                    buffer = flush_batch(
                        buffer,
                        &metadata,
                        config.compress_level,
                        &mut failure_state,
                        sender.as_ref(),
                    );
                    last_flush = Instant::now();
                    written_since_flush = false;
                }
                let _ = ack.send(());
                return;
            }
            Ok(QueueItem::Flush(ack)) => {
                if written_since_flush {
                    buffer = flush_batch(
                        buffer,
                        &metadata,
                        config.compress_level,
                        &mut failure_state,
                        sender.as_ref(),
                    );
                    written_since_flush = false;
                }
                last_flush = Instant::now();
                let _ = ack.send(());
            }
            Ok(QueueItem::Record(record)) => {
                append_record(&mut buffer, record);
                written_since_flush = true;
                if buffer.raw_len() > config.max_buffer_size {
                    buffer = flush_batch(
                        buffer,
                        &metadata,
                        config.compress_level,
                        &mut failure_state,
                        sender.as_ref(),
                    );
                    written_since_flush = false;
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if written_since_flush {
                    buffer = flush_batch(
                        buffer,
                        &metadata,
                        config.compress_level,
                        &mut failure_state,
                        sender.as_ref(),
                    );
                    written_since_flush = false;
                }
                last_flush = Instant::now();
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn append_record(buffer: &mut GzipBuffer, record: EventRecord) {
    let result = match &record {
        EventRecord::Transaction(t) => buffer.append(&Record::Transaction(t)),
        EventRecord::Error(e) => buffer.append(&Record::Error(e)),
    };
    if let Err(err) = result {
        tracing::warn!(error = %err, "dropping record that failed to encode");
    }
}

/// `flush(buffer)` (`spec.md` §4.6): consults the failure-state gate,
/// hands the framed bytes to the sender if permitted, records the outcome,
/// and always returns a fresh buffer seeded with a new metadata line.
fn flush_batch(
    buffer: GzipBuffer,
    metadata: &Metadata,
    compress_level: u32,
    failure_state: &mut FailureState,
    sender: &dyn BatchSender,
) -> GzipBuffer {
    if failure_state.should_try() {
        let bytes = buffer.finish();
        match sender.send(bytes) {
            Ok(()) => failure_state.set_success(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to deliver event batch");
                failure_state.set_fail();
            }
        }
    } else {
        tracing::warn!("dropping flushed batch: transport is in back-off");
        drop(buffer.finish());
    }
    GzipBuffer::new(metadata, compress_level)
}
