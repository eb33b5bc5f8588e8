//! The agent entry point: wires configuration, trace context, sampling and
//! the transport pipeline into the handful of methods [`crate::api`]
//! exposes to instrumentation.
//!
//! `spec.md` §9 permits more than one `Client` per process (mainly for
//! tests); each owns its own transport pipeline but all share the same
//! per-thread [`crate::context::TraceContextStore`] slot, exactly as
//! `elasticapm`'s `thread_local.transaction` is a single module-level
//! global regardless of how many `Client`/`TransactionsStore` instances
//! exist in the process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::ScopedSpan;
use crate::config::AgentConfig;
use crate::context::TraceContextStore;
use crate::encode::Metadata;
use crate::error::{AgentError, ErrorEvent};
use crate::ids::{IdGenerator, RandomIdGenerator, TraceId};
use crate::propagation::TraceParent;
use crate::trace::{
    FrameCollector, IgnorePatterns, NoopFrameCollector, RandomSampler, Sampler, Transaction,
};
use crate::transport::{EventQueue, EventRecord, Sender, SyncPipeline, WorkerConfig, WorkerHandle};

/// The transport pipeline a [`Client`] drives, chosen by `config.async_mode`
/// (`spec.md` §6): a dedicated background worker thread, or inline delivery
/// on the calling producer's thread. `None` means sending is disabled (no
/// pipeline has ever been started).
enum Pipeline {
    None,
    Async(EventQueue, WorkerHandle),
    Sync(SyncPipeline),
}

/// Owns one transport pipeline (bounded queue + dedicated worker thread, or
/// an inline pipeline — see [`Pipeline`]) plus the pieces the capture API
/// needs: the sampler, ignore patterns, id generator and frame collector.
pub struct Client {
    config: AgentConfig,
    context: TraceContextStore,
    sampler: Arc<dyn Sampler>,
    ignore_patterns: IgnorePatterns,
    id_generator: Arc<dyn IdGenerator>,
    frame_collector: Arc<dyn FrameCollector>,
    sender: Arc<dyn Sender>,
    metadata: Metadata,
    worker_config: WorkerConfig,
    pipeline: Mutex<Pipeline>,
}

impl Client {
    /// Builds a client and starts its worker thread immediately. Most
    /// callers want this; hosts that pre-fork should use
    /// [`Client::new_without_worker`] instead and call [`Client::start_worker`]
    /// (or [`Client::post_fork_child`]) once per child after `fork()`
    /// (`spec.md` §5).
    pub fn new(config: AgentConfig, sender: Arc<dyn Sender>, frame_collector: Arc<dyn FrameCollector>) -> Self {
        Self::build(config, sender, frame_collector, None, true)
    }

    /// Like [`Client::new`] but overrides the sampler instead of building a
    /// [`RandomSampler`] from `config.transaction_sample_rate` — lets tests
    /// pin an exact draw sequence via [`crate::trace::DeterministicSampler`]
    /// (`spec.md` §8 scenario 1: "Sampling floor").
    pub fn new_with_sampler(
        config: AgentConfig,
        sender: Arc<dyn Sender>,
        frame_collector: Arc<dyn FrameCollector>,
        sampler: Arc<dyn Sampler>,
    ) -> Self {
        Self::build(config, sender, frame_collector, Some(sampler), true)
    }

    /// Like [`Client::new`] but leaves the worker thread unstarted — the
    /// parent process in a pre-forking host never gets a background thread
    /// a `fork()` would silently orphan.
    pub fn new_without_worker(
        config: AgentConfig,
        sender: Arc<dyn Sender>,
        frame_collector: Arc<dyn FrameCollector>,
    ) -> Self {
        Self::build(config, sender, frame_collector, None, false)
    }

    /// A client with no transport at all (no worker, `send_enabled()` is
    /// never consulted because there's nowhere to send). Useful in tests
    /// that only exercise the trace-context model.
    pub fn disconnected(config: AgentConfig) -> Self {
        Self::build(
            AgentConfig {
                disable_send: true,
                ..config
            },
            Arc::new(crate::testing::RecordingSender::new()),
            Arc::new(NoopFrameCollector),
            None,
            false,
        )
    }

    fn build(
        mut config: AgentConfig,
        sender: Arc<dyn Sender>,
        frame_collector: Arc<dyn FrameCollector>,
        sampler_override: Option<Arc<dyn Sampler>>,
        start_worker: bool,
    ) -> Self {
        if let Err(err) = config.validate() {
            tracing::error!(error = %err, "invalid agent configuration; disabling send");
            config.disable_send = true;
        }

        let ignore_patterns =
            IgnorePatterns::compile(&config.transactions_ignore_patterns).unwrap_or_else(|err| {
                tracing::error!(error = %err, "invalid transactions_ignore_patterns; ignoring all of them");
                IgnorePatterns::default()
            });

        let metadata = Metadata {
            service_name: config.service_name.clone(),
            agent_name: "apm-agent-core".to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: config.environment.clone(),
        };
        let worker_config = WorkerConfig {
            max_flush_time: config.max_flush_time,
            max_buffer_size: config.max_buffer_size,
            compress_level: config.compress_level,
        };
        let sampler: Arc<dyn Sampler> =
            sampler_override.unwrap_or_else(|| Arc::new(RandomSampler::new(config.transaction_sample_rate)));

        let client = Client {
            config,
            context: TraceContextStore::new(),
            sampler,
            ignore_patterns,
            id_generator: Arc::new(RandomIdGenerator::default()),
            frame_collector,
            sender,
            metadata,
            worker_config,
            pipeline: Mutex::new(Pipeline::None),
        };
        if start_worker {
            client.start_worker();
        }
        client
    }

    /// Starts the transport pipeline if it isn't already running and
    /// sending is enabled. Idempotent. Spawns a dedicated worker thread
    /// when `config.async_mode` is set (the default); otherwise wires up
    /// the inline pipeline, which has no thread to spawn (`spec.md` §6:
    /// "`async_mode` — Use background delivery vs. inline").
    pub fn start_worker(&self) {
        if !self.config.send_enabled() {
            return;
        }
        let mut pipeline = self.pipeline.lock().unwrap();
        if !matches!(*pipeline, Pipeline::None) {
            return;
        }
        *pipeline = if self.config.async_mode {
            let (queue, handle) = EventQueue::spawn(
                self.metadata.clone(),
                self.worker_config.clone(),
                self.sender.clone(),
            );
            Pipeline::Async(queue, handle)
        } else {
            Pipeline::Sync(SyncPipeline::new(
                self.metadata.clone(),
                self.worker_config.clone(),
                self.sender.clone(),
            ))
        };
    }

    /// Called once in each child immediately after `fork()`. A background
    /// worker thread (if any) does not survive the fork — its `JoinHandle`
    /// is discarded without joining, since joining a thread that no longer
    /// exists in this process would hang — and a fresh pipeline is started
    /// in its place (`spec.md` §5).
    pub fn post_fork_child(&self) {
        *self.pipeline.lock().unwrap() = Pipeline::None;
        self.start_worker();
    }

    fn enqueue(&self, record: EventRecord) {
        let pipeline = self.pipeline.lock().unwrap();
        let result = match &*pipeline {
            Pipeline::None => return,
            Pipeline::Async(queue, _) => queue.enqueue(record),
            Pipeline::Sync(sync) => sync.enqueue(record),
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "dropping event");
        }
    }

    /// Flushes any buffered events without stopping the pipeline.
    pub fn flush(&self, timeout: Duration) -> Result<(), AgentError> {
        match &*self.pipeline.lock().unwrap() {
            Pipeline::None => Ok(()),
            Pipeline::Async(queue, _) => queue.flush(timeout),
            Pipeline::Sync(sync) => sync.flush(),
        }
    }

    /// Flushes, then stops the pipeline — joining the worker thread in
    /// async mode, or simply dropping the inline pipeline in sync mode.
    pub fn close(&self, timeout: Duration) -> Result<(), AgentError> {
        let pipeline = std::mem::replace(&mut *self.pipeline.lock().unwrap(), Pipeline::None);
        match pipeline {
            Pipeline::None => Ok(()),
            Pipeline::Async(queue, mut handle) => {
                let result = queue.close(timeout);
                handle.join();
                result
            }
            Pipeline::Sync(sync) => sync.flush(),
        }
    }

    // -- capture API (spec.md §4.5) -----------------------------------

    /// Starts a transaction on the calling flow, or returns the one
    /// already current if this flow has one (`spec.md` §4.1: an existing
    /// current transaction is never shadowed by a nested
    /// `begin_transaction`).
    pub fn begin_transaction(
        &self,
        transaction_type: impl Into<String>,
        trace_parent: Option<TraceParent>,
    ) -> Arc<Transaction> {
        if let Some(existing) = self.context.get() {
            return existing;
        }

        let sampled = match &trace_parent {
            Some(tp) => tp.sampled(),
            None => self.sampler.should_sample(),
        };
        let max_spans = self.config.transaction_max_spans;
        let transaction_type = transaction_type.into();

        let txn = Arc::new(match &trace_parent {
            Some(tp) => Transaction::new_with_ids(
                transaction_type,
                sampled,
                max_spans,
                self.id_generator.new_trace_id(),
                tp.trace_id,
                self.id_generator.new_span_id(),
                Some(tp.parent_id),
            ),
            None => {
                let trace_id = self.id_generator.new_trace_id();
                Transaction::new_with_ids(
                    transaction_type,
                    sampled,
                    max_spans,
                    trace_id,
                    trace_id,
                    self.id_generator.new_span_id(),
                    None,
                )
            }
        });

        // Intentionally leave the slot set: transactions don't nest
        // (`spec.md` §4.1), so there is no enclosing context to restore to
        // until `end_transaction` explicitly clears it.
        std::mem::forget(self.context.set(txn.clone()));
        txn
    }

    /// Ends the current transaction, if any, and enqueues it for delivery
    /// unless its final name matches a configured ignore pattern
    /// (`spec.md` §4.4). Returns the ended transaction so the caller can
    /// still inspect it.
    pub fn end_transaction(
        &self,
        result: Option<String>,
        name_if_unset: Option<String>,
    ) -> Option<Arc<Transaction>> {
        let txn = self.context.get()?;
        txn.end_transaction(result, name_if_unset);
        self.context.clear();

        let trace_parent = TraceParent::new_root(txn.trace_id, txn.span_id, txn.sampled);
        let finished = txn.to_finished(Some(trace_parent));
        if self.ignore_patterns.matches(&finished.name) {
            tracing::trace!(name = %finished.name, "transaction matched an ignore pattern, dropping");
        } else {
            self.enqueue(EventRecord::Transaction(finished));
        }
        Some(txn)
    }

    /// Begins a span under the current transaction, if one exists and is
    /// sampled; otherwise returns an inert guard (`spec.md` §4.5: "no-op
    /// when there is no current transaction").
    pub fn scoped_span(
        &self,
        name: impl Into<String>,
        span_type: impl Into<String>,
        context: Option<serde_json::Value>,
        fingerprint_vector: Vec<String>,
        leaf: bool,
    ) -> ScopedSpan<'_> {
        match self.context.get() {
            Some(txn) if txn.sampled => {
                txn.begin_span(name, span_type, context, fingerprint_vector, leaf);
                ScopedSpan {
                    client: self,
                    active: true,
                    skip_frames: 1,
                }
            }
            _ => ScopedSpan {
                client: self,
                active: false,
                skip_frames: 0,
            },
        }
    }

    pub(crate) fn end_span(&self, skip_frames: u32) {
        if let Some(txn) = self.context.get() {
            txn.end_span(
                skip_frames,
                self.frame_collector.as_ref(),
                self.config.span_frames_min_duration,
            );
        }
    }

    /// Captures a handled or unhandled exception, correlated to the
    /// current transaction if one exists.
    pub fn capture_error(
        &self,
        exception_type: impl Into<String>,
        exception_module: impl Into<String>,
        message: impl Into<String>,
        handled: bool,
    ) {
        let transaction_id = self.current_transaction_id();
        let mut event =
            ErrorEvent::for_exception(exception_type, exception_module, message, handled, transaction_id);
        event.frames = self.frame_collector.collect(1);
        self.enqueue(EventRecord::Error(event));
    }

    /// Captures a free-form log message, correlated to the current
    /// transaction if one exists.
    pub fn capture_message(
        &self,
        message: impl Into<String>,
        param_message: Option<String>,
        logger_name: impl Into<String>,
        custom_context: Option<serde_json::Value>,
    ) {
        let transaction_id = self.current_transaction_id();
        let mut event =
            ErrorEvent::for_message(message, param_message, logger_name, transaction_id, custom_context);
        event.frames = self.frame_collector.collect(1);
        self.enqueue(EventRecord::Error(event));
    }

    fn current_transaction_id(&self) -> Option<TraceId> {
        self.context.get().map(|t| t.id)
    }

    /// Tags the current transaction. A no-op (with a warning) if `key`
    /// fails the tag-name validation, and a silent no-op if there is no
    /// current transaction.
    pub fn set_tag(&self, key: &str, value: impl Into<serde_json::Value>) {
        if let Some(txn) = self.context.get() {
            if txn.set_tag(key, value).is_err() {
                tracing::warn!(key, "tag key rejected, must not contain '.', '*' or '\"'");
            }
        }
    }

    pub fn set_user(&self, username: Option<String>, email: Option<String>, user_id: Option<String>) {
        if let Some(txn) = self.context.get() {
            let mut user = serde_json::Map::new();
            if let Some(v) = username {
                user.insert("username".to_string(), v.into());
            }
            if let Some(v) = email {
                user.insert("email".to_string(), v.into());
            }
            if let Some(v) = user_id {
                user.insert("id".to_string(), v.into());
            }
            txn.merge_context("user", serde_json::Value::Object(user));
        }
    }

    pub fn set_custom_context(&self, value: serde_json::Value) {
        if let Some(txn) = self.context.get() {
            txn.merge_context("custom", value);
        }
    }

    pub fn set_request_context(&self, value: serde_json::Value) {
        if let Some(txn) = self.context.get() {
            txn.merge_context("request", value);
        }
    }

    pub fn set_response_context(&self, value: serde_json::Value) {
        if let Some(txn) = self.context.get() {
            txn.merge_context("response", value);
        }
    }

    pub fn set_transaction_name(&self, name: impl Into<String>, override_existing: bool) {
        if let Some(txn) = self.context.get() {
            txn.set_transaction_name(name.into(), override_existing);
        }
    }

    pub fn set_transaction_result(&self, result: impl Into<String>, override_existing: bool) {
        if let Some(txn) = self.context.get() {
            txn.set_transaction_result(result.into(), override_existing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSender;
    use std::thread;

    fn client_with(config: AgentConfig) -> (Client, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::new());
        let client = Client::new(config, sender.clone(), Arc::new(NoopFrameCollector));
        (client, sender)
    }

    #[test]
    fn begin_transaction_does_not_shadow_an_existing_one() {
        let (client, _sender) = client_with(AgentConfig::new("svc"));
        let first = client.begin_transaction("request", None);
        let second = client.begin_transaction("request", None);
        assert!(Arc::ptr_eq(&first, &second));
        client.close(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn scoped_span_is_noop_without_a_current_transaction() {
        let (client, _sender) = client_with(AgentConfig::new("svc"));
        {
            let _span = client.scoped_span("op", "custom", None, vec![], false);
        }
        client.close(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn end_transaction_enqueues_exactly_one_event() {
        let (client, sender) = client_with(AgentConfig::new("svc"));
        client.begin_transaction("request", None);
        {
            let _span = client.scoped_span("db.query", "db", None, vec![], false);
        }
        client.end_transaction(Some("OK".to_string()), Some("GET /x".to_string()));
        client.close(Duration::from_secs(5)).unwrap();
        assert_eq!(sender.transaction_names(), vec!["GET /x".to_string()]);
    }

    #[test]
    fn ignored_transaction_never_reaches_the_worker() {
        let config = AgentConfig::new("svc").with_ignore_pattern("^OPTIONS");
        let (client, sender) = client_with(config);

        client.begin_transaction("request", None);
        client.end_transaction(Some("OK".to_string()), Some("OPTIONS /health".to_string()));

        client.begin_transaction("request", None);
        client.end_transaction(Some("OK".to_string()), Some("GET /users".to_string()));

        client.close(Duration::from_secs(5)).unwrap();
        assert_eq!(sender.transaction_names(), vec!["GET /users".to_string()]);
    }

    #[test]
    fn context_is_isolated_per_thread() {
        let (client, _sender) = client_with(AgentConfig::new("svc"));
        let txn = client.begin_transaction("request", None);
        let handle = thread::spawn(move || {
            let config = AgentConfig::new("svc");
            let (other_client, _sender) = client_with(config);
            assert!(other_client.begin_transaction("request", None).id != txn.id);
        });
        handle.join().unwrap();
        client.end_transaction(None, None);
        client.close(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn close_with_no_transport_is_a_noop() {
        let client = Client::disconnected(AgentConfig::new("svc"));
        client.begin_transaction("request", None);
        client.end_transaction(Some("OK".to_string()), Some("n".to_string()));
        assert!(client.close(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn set_tag_without_a_current_transaction_is_a_silent_noop() {
        let (client, _sender) = client_with(AgentConfig::new("svc"));
        client.set_tag("env", "prod");
    }

    #[test]
    fn sampling_floor_marks_exactly_the_draws_under_the_rate() {
        // spec.md §8 scenario 1: rate=0.4 against this exact draw sequence
        // samples draws at indices 0, 2, 4, 8 (values 0.1, 0.3, 0.2, 0.35).
        let draws = vec![0.1, 0.5, 0.3, 0.9, 0.2, 0.7, 0.6, 0.8, 0.35, 0.45];
        let sampler: Arc<dyn crate::trace::Sampler> =
            Arc::new(crate::trace::DeterministicSampler::new(0.4, draws));
        let sender = Arc::new(RecordingSender::new());
        let client = Client::new_with_sampler(
            AgentConfig::new("svc"),
            sender.clone(),
            Arc::new(NoopFrameCollector),
            sampler,
        );

        let mut sampled_flags = Vec::new();
        for i in 0..10 {
            let txn = client.begin_transaction("request", None);
            sampled_flags.push(txn.sampled);
            if txn.sampled {
                client.scoped_span(format!("span-{i}"), "custom", None, vec![], false);
            }
            client.end_transaction(Some("OK".to_string()), Some(format!("txn-{i}")));
        }
        client.close(Duration::from_secs(5)).unwrap();

        assert_eq!(sampled_flags.iter().filter(|&&b| b).count(), 4);
        assert_eq!(
            sampled_flags,
            vec![true, false, true, false, true, false, false, false, true, false]
        );

        let lines = sender.lines();
        let spans_present: Vec<bool> = lines
            .iter()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|v| v.get("transaction").cloned())
            .map(|t| t.get("spans").is_some())
            .collect();
        assert_eq!(spans_present.len(), 10);
        assert_eq!(spans_present.iter().filter(|&&b| b).count(), 4);
    }

    #[test]
    fn inline_mode_delivers_without_a_background_worker() {
        let config = AgentConfig::new("svc").with_async_mode(false);
        let (client, sender) = client_with(config);

        client.begin_transaction("request", None);
        client.end_transaction(Some("OK".to_string()), Some("GET /inline".to_string()));
        // No worker thread backs this pipeline, so the events must already
        // be delivered by the time `end_transaction` returns; `flush` here
        // only closes out the batch so `transaction_names` can decode it.
        client.flush(Duration::from_secs(1)).unwrap();

        assert_eq!(sender.transaction_names(), vec!["GET /inline".to_string()]);
        client.close(Duration::from_secs(1)).unwrap();
    }
}
