//! Transaction lifecycle: the root timed operation owning a span stack,
//! context dictionaries and tags.
//!
//! Grounded in `elasticapm.traces.Transaction`/`TransactionsStore`, with the
//! mutable-inner-behind-a-lock shape borrowed from
//! `opentelemetry::trace::context::SynchronizedSpan` — a transaction is
//! handed around as `Arc<Transaction>` (the context store clones that Arc
//! freely) but mutated from exactly one flow at a time, so a `Mutex` around
//! the mutable fields is enough; it is never contended in practice.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use crate::ids::{SpanId, TraceId};
use crate::propagation::TraceParent;

use super::span::{FrameCollector, Span};

/// What occupies a stack slot for an in-progress span.
enum StackSlot {
    Active(InProgressSpan),
    /// Pushed when the span budget was already exhausted.
    Dropped,
    /// Pushed while an ancestor `leaf` span's subtree is being ignored.
    Ignored,
}

struct InProgressSpan {
    index: u32,
    name: String,
    span_type: String,
    start_offset: Duration,
    context: Option<serde_json::Value>,
    fingerprint_vector: Vec<String>,
    leaf: bool,
}

struct TransactionInner {
    name: Option<String>,
    result: Option<String>,
    duration: Option<Duration>,
    ended: bool,
    spans: Vec<Span>,
    stack: Vec<StackSlot>,
    context: serde_json::Map<String, serde_json::Value>,
    tags: std::collections::BTreeMap<String, serde_json::Value>,
    dropped_spans: u32,
    span_counter: u32,
    ignore_subtree: bool,
}

/// A root timed operation representing one unit of work, e.g. handling one
/// request (`spec.md` §3).
///
/// Bound to exactly one flow via [`crate::context::TraceContextStore`]
/// between `begin_transaction` and `end_transaction`; after that it is
/// handed to the event queue as an immutable [`FinishedTransaction`].
#[derive(Debug)]
pub struct Transaction {
    pub id: TraceId,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub transaction_type: String,
    pub sampled: bool,
    pub max_spans: Option<u32>,
    pub timestamp: SystemTime,
    start_instant: Instant,
    inner: Mutex<TransactionInner>,
}

impl std::fmt::Debug for TransactionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionInner")
            .field("name", &self.name)
            .field("ended", &self.ended)
            .field("spans", &self.spans.len())
            .finish()
    }
}

impl Transaction {
    /// Creates a new, unended transaction rooting its own trace (no
    /// incoming distributed-trace parent). `sampled` is decided once, by
    /// the caller (typically from a [`crate::trace::Sampler`]), before
    /// construction — sampling is a one-shot decision per `spec.md` §4.3.
    ///
    /// `name` is the provisional transaction name; instrumentation may
    /// leave it in place or override it later via
    /// [`Transaction::set_transaction_name`], and `end_transaction`'s
    /// `name_if_unset` only takes effect if the name is still unset at that
    /// point (never the case for this constructor, which always starts
    /// with one — see [`Transaction::new_with_ids`] for a variant that
    /// truly leaves the name unset).
    pub fn new(name: String, transaction_type: String, sampled: bool, max_spans: Option<u32>) -> Self {
        use crate::ids::{IdGenerator, RandomIdGenerator};
        let gen = RandomIdGenerator::default();
        let trace_id = gen.new_trace_id();
        let span_id = gen.new_span_id();
        let mut t = Self::new_with_ids(transaction_type, sampled, max_spans, trace_id, trace_id, span_id, None);
        t.inner.get_mut().unwrap().name = Some(name);
        t
    }

    /// Full constructor used by `begin_transaction`: `id` is this
    /// transaction's own identity, `trace_id`/`span_id`/`parent_span_id`
    /// carry (or originate) the distributed trace context (`spec.md`
    /// §4.9). The transaction's name is left unset.
    pub fn new_with_ids(
        transaction_type: String,
        sampled: bool,
        max_spans: Option<u32>,
        id: TraceId,
        trace_id: TraceId,
        span_id: SpanId,
        parent_span_id: Option<SpanId>,
    ) -> Self {
        Transaction {
            id,
            trace_id,
            span_id,
            parent_span_id,
            transaction_type,
            sampled,
            max_spans,
            timestamp: SystemTime::now(),
            start_instant: Instant::now(),
            inner: Mutex::new(TransactionInner {
                name: None,
                result: None,
                duration: None,
                ended: false,
                spans: Vec::new(),
                stack: Vec::new(),
                context: serde_json::Map::new(),
                tags: std::collections::BTreeMap::new(),
                dropped_spans: 0,
                span_counter: 0,
                ignore_subtree: false,
            }),
        }
    }

    /// Test/simple-construction convenience: generates its own ids, leaves
    /// the name unset, and has no incoming distributed-trace parent.
    pub fn simple(transaction_type: String, sampled: bool, max_spans: Option<u32>) -> Self {
        use crate::ids::{IdGenerator, RandomIdGenerator};
        let gen = RandomIdGenerator::default();
        let trace_id = gen.new_trace_id();
        let span_id = gen.new_span_id();
        Transaction::new_with_ids(transaction_type, sampled, max_spans, trace_id, trace_id, span_id, None)
    }

    fn lock(&self) -> MutexGuard<'_, TransactionInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.start_instant)
    }

    /// `begin_span` (`spec.md` §4.2).
    pub fn begin_span(
        &self,
        name: impl Into<String>,
        span_type: impl Into<String>,
        context: Option<serde_json::Value>,
        fingerprint_vector: Vec<String>,
        leaf: bool,
    ) {
        let mut inner = self.lock();
        if inner.ignore_subtree {
            inner.stack.push(StackSlot::Ignored);
            return;
        }
        if leaf {
            inner.ignore_subtree = true;
        }
        inner.span_counter += 1;
        if let Some(max) = self.max_spans {
            if inner.span_counter > max {
                inner.dropped_spans += 1;
                inner.stack.push(StackSlot::Dropped);
                return;
            }
        }
        let index = inner.span_counter - 1;
        let start_offset = self.elapsed();
        inner.stack.push(StackSlot::Active(InProgressSpan {
            index,
            name: name.into(),
            span_type: span_type.into(),
            start_offset,
            context,
            fingerprint_vector,
            leaf,
        }));
    }

    /// `end_span` (`spec.md` §4.2), including child-span compression.
    ///
    /// Deviates from `elasticapm.traces.Transaction.end_span` in one
    /// respect: `ignore_subtree` is only cleared when the popped slot is the
    /// real leaf span that set it, not when an `IGNORED` placeholder
    /// beneath it is popped — clearing on every `IGNORED` pop (as a literal
    /// reading of the fold description alone might suggest) would let a
    /// leaf's later siblings escape suppression before the leaf itself
    /// ends. See `DESIGN.md`.
    ///
    /// `span_frames_min_duration` is `spec.md` §6's
    /// `span_frames_min_duration`: spans shorter than it skip frame
    /// collection entirely, `None`/zero meaning no floor.
    pub fn end_span(&self, skip_frames: u32, frames: &dyn FrameCollector, span_frames_min_duration: Option<Duration>) {
        let mut inner = self.lock();
        let slot = match inner.stack.pop() {
            Some(slot) => slot,
            None => return,
        };
        let in_progress = match slot {
            StackSlot::Ignored => return,
            StackSlot::Dropped => {
                inner.ignore_subtree = false;
                return;
            }
            StackSlot::Active(s) => {
                inner.ignore_subtree = false;
                s
            }
        };

        let now = self.elapsed();
        let duration = now.saturating_sub(in_progress.start_offset);
        let parent_index = match inner.stack.last() {
            Some(StackSlot::Active(parent)) => Some(parent.index),
            _ => None,
        };

        let mut cur = Span::new(
            in_progress.index,
            in_progress.name,
            in_progress.span_type,
            in_progress.start_offset,
            in_progress.context,
            in_progress.fingerprint_vector,
            in_progress.leaf,
        );
        cur.duration = duration;
        cur.parent_index = parent_index;

        if Self::try_compress(&mut inner, &mut cur, now) {
            inner.spans.push(cur);
            return;
        }

        if cur.duration >= span_frames_min_duration.unwrap_or(Duration::ZERO) {
            cur.frames = frames.collect(skip_frames);
        }
        inner.spans.push(cur);
    }

    /// Detects and folds a repeated sibling into an existing or brand-new
    /// grouping span (`spec.md` §4.2 step 5). Returns `true` if `cur` was
    /// folded (its frames must stay empty; the caller skips frame
    /// collection), `false` if it is an ordinary span.
    fn try_compress(inner: &mut TransactionInner, cur: &mut Span, now: Duration) -> bool {
        let Some(pre_idx) = inner.spans.len().checked_sub(1) else {
            return false;
        };
        let pre_matches = {
            let pre = &inner.spans[pre_idx];
            pre.name == cur.name && pre.fingerprint() == cur.fingerprint()
        };
        if !pre_matches {
            return false;
        }

        let pre_parent = inner.spans[pre_idx].parent_index;
        if let Some(parent_idx) = pre_parent {
            let parent_matches = inner
                .spans
                .get(parent_idx as usize)
                .is_some_and(|p| p.fingerprint() == cur.fingerprint());
            if parent_matches {
                let group = &mut inner.spans[parent_idx as usize];
                group.duration = now.saturating_sub(group.start_offset);
                group.count += 1;
                cur.parent_index = Some(parent_idx);
                cur.frames.clear();
                return true;
            }
        }

        // No existing group yet: promote `pre` itself into the group,
        // keeping its own (lower) index and its already-collected frames —
        // it stays the "first" occurrence `spec.md` §8 scenario 3 expects to
        // carry a stacktrace. A clone of `pre` takes a freshly minted,
        // necessarily-higher index and becomes an ordinary, frameless child
        // alongside `cur`. Reusing `pre_idx` rather than minting a new,
        // larger index for the group itself is what keeps the universal
        // invariant `s.parent_index < s.index` true for both children: a
        // synthetic parent can never be older than its children's indices.
        // This also leaves `pre.parent_index` untouched, so `pre`'s real
        // ancestor (if it is itself a nested span) isn't clobbered.
        let clone_index = inner.span_counter;
        inner.span_counter += 1;

        let mut clone = inner.spans[pre_idx].clone();
        clone.index = clone_index;
        clone.parent_index = Some(pre_idx as u32);
        clone.count = 0;
        clone.frames.clear();

        let pre = &mut inner.spans[pre_idx];
        pre.count = 2;
        pre.duration = now.saturating_sub(pre.start_offset);

        cur.parent_index = Some(pre_idx as u32);
        cur.frames.clear();

        inner.spans.push(clone);
        true
    }

    /// `end_transaction(result, name_if_unset)` (`spec.md` §4.2). A second
    /// call is a no-op (idempotence, `spec.md` §8).
    pub fn end_transaction(&self, result: Option<String>, name_if_unset: Option<String>) {
        let mut inner = self.lock();
        if inner.ended {
            return;
        }
        inner.ended = true;
        inner.duration = Some(self.elapsed());
        inner.result = result;
        if inner.name.is_none() {
            inner.name = name_if_unset;
        }
    }

    pub fn is_ended(&self) -> bool {
        self.lock().ended
    }

    pub fn set_transaction_name(&self, name: String, override_existing: bool) {
        let mut inner = self.lock();
        if inner.name.is_none() || override_existing {
            inner.name = Some(name);
        }
    }

    pub fn set_transaction_result(&self, result: String, override_existing: bool) {
        let mut inner = self.lock();
        if inner.result.is_none() || override_existing {
            inner.result = Some(result);
        }
    }

    pub fn set_tag(&self, key: &str, value: impl Into<serde_json::Value>) -> Result<(), ()> {
        if !crate::encode::tag_name_regex().is_match(key) {
            return Err(());
        }
        self.lock().tags.insert(key.to_string(), value.into());
        Ok(())
    }

    pub fn merge_context(&self, section: &str, value: serde_json::Value) {
        let mut inner = self.lock();
        match inner.context.get_mut(section) {
            Some(serde_json::Value::Object(existing)) => {
                if let serde_json::Value::Object(new_fields) = value {
                    existing.extend(new_fields);
                } else {
                    inner.context.insert(section.to_string(), value);
                }
            }
            _ => {
                inner.context.insert(section.to_string(), value);
            }
        }
    }

    pub fn dropped_spans(&self) -> u32 {
        self.lock().dropped_spans
    }

    pub fn span_count(&self) -> u32 {
        self.lock().span_counter
    }

    pub fn finished_span_count(&self) -> usize {
        self.lock().spans.len()
    }

    /// Snapshots the transaction into its serializable, immutable form.
    /// Only meaningful after `end_transaction`.
    pub fn to_finished(&self, trace_parent: Option<TraceParent>) -> FinishedTransaction {
        let inner = self.lock();
        FinishedTransaction {
            id: self.id,
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            timestamp: self.timestamp,
            name: inner.name.clone().unwrap_or_default(),
            transaction_type: self.transaction_type.clone(),
            result: inner.result.clone().unwrap_or_default(),
            duration: inner.duration.unwrap_or_default(),
            sampled: self.sampled,
            spans: if self.sampled {
                inner.spans.clone()
            } else {
                Vec::new()
            },
            context: if self.sampled {
                let mut ctx = inner.context.clone();
                if !inner.tags.is_empty() {
                    ctx.insert(
                        "tags".to_string(),
                        serde_json::Value::Object(inner.tags.clone().into_iter().collect()),
                    );
                }
                Some(serde_json::Value::Object(ctx))
            } else {
                None
            },
            dropped_spans: inner.dropped_spans,
            trace_parent,
        }
    }
}

/// An ended transaction's immutable, owned record, ready for the event
/// queue. Errors reference a transaction only by [`TraceId`] after this
/// point (`spec.md` §3: "Errors borrow the transaction ID only").
#[derive(Debug, Clone)]
pub struct FinishedTransaction {
    pub id: TraceId,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub timestamp: SystemTime,
    pub name: String,
    pub transaction_type: String,
    pub result: String,
    pub duration: Duration,
    pub sampled: bool,
    pub spans: Vec<Span>,
    pub context: Option<serde_json::Value>,
    pub dropped_spans: u32,
    pub trace_parent: Option<TraceParent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::NoopFrameCollector;

    fn txn(max_spans: Option<u32>) -> Transaction {
        Transaction::simple("test".to_string(), true, max_spans)
    }

    #[test]
    fn span_budget_drops_excess_siblings() {
        let t = txn(Some(3));
        let collector = NoopFrameCollector;
        // begin 1, within it begin 2, within it begin 3 (kept)
        t.begin_span("s1", "custom", None, vec![], false);
        t.begin_span("s2", "custom", None, vec![], false);
        t.begin_span("s3", "custom", None, vec![], false);
        t.end_span(0, &collector, None);
        t.end_span(0, &collector, None);
        t.end_span(0, &collector, None);
        // then begin 4,5,6 as siblings (dropped)
        for name in ["s4", "s5", "s6"] {
            t.begin_span(name, "custom", None, vec![], false);
            t.end_span(0, &collector, None);
        }
        assert_eq!(t.finished_span_count(), 3);
        assert_eq!(t.dropped_spans(), 3);
        assert_eq!(t.span_count(), 6);
    }

    #[test]
    fn parent_index_is_always_less_than_span_index() {
        let t = txn(None);
        let collector = NoopFrameCollector;
        t.begin_span("outer", "custom", None, vec![], false);
        t.begin_span("inner", "custom", None, vec![], false);
        t.end_span(0, &collector, None);
        t.end_span(0, &collector, None);
        let inner = t.lock();
        for s in &inner.spans {
            if let Some(p) = s.parent_index {
                assert!(p < s.index, "parent {p} >= index {}", s.index);
            }
        }
    }

    #[test]
    fn compress_ten_identical_siblings_into_one_group() {
        let t = txn(None);
        let collector = NoopFrameCollector;
        for _ in 0..10 {
            t.begin_span("db", "db", None, vec!["select".to_string()], false);
            t.end_span(0, &collector, None);
        }
        let inner = t.lock();
        let groups: Vec<&Span> = inner.spans.iter().filter(|s| s.count > 0).collect();
        assert_eq!(groups.len(), 1, "exactly one grouping span expected");
        assert_eq!(groups[0].count, 10);
        let without_frames = inner
            .spans
            .iter()
            .filter(|s| s.index != groups[0].index)
            .all(|s| s.frames.is_empty());
        assert!(without_frames);
        for s in inner.spans.iter() {
            if let Some(p) = s.parent_index {
                assert!(p < s.index, "parent {p} >= index {}", s.index);
            }
        }
    }

    #[test]
    fn compressed_group_does_not_clobber_a_nested_sibling_run_s_real_parent() {
        // The grouping branch must leave `pre.parent_index` untouched when
        // `pre` is itself nested under some outer span, rather than
        // overwriting it with the synthetic group/clone link.
        let t = txn(None);
        let collector = NoopFrameCollector;
        t.begin_span("outer", "custom", None, vec![], false);
        for _ in 0..3 {
            t.begin_span("db", "db", None, vec!["select".to_string()], false);
            t.end_span(0, &collector, None);
        }
        t.end_span(0, &collector, None);
        let inner = t.lock();
        let outer = inner.spans.iter().find(|s| s.name == "outer").unwrap();
        let group = inner
            .spans
            .iter()
            .find(|s| s.name == "db" && s.count > 0)
            .unwrap();
        assert_eq!(group.parent_index, Some(outer.index));
        for s in inner.spans.iter() {
            if let Some(p) = s.parent_index {
                assert!(p < s.index, "parent {p} >= index {}", s.index);
            }
        }
    }

    #[test]
    fn leaf_suppresses_entire_subtree_not_just_direct_child() {
        let t = txn(None);
        let collector = NoopFrameCollector;
        t.begin_span("leaf-op", "custom", None, vec![], true);
        t.begin_span("child-a", "custom", None, vec![], false);
        t.end_span(0, &collector, None); // pops IGNORED for child-a
        t.begin_span("child-b", "custom", None, vec![], false);
        t.end_span(0, &collector, None); // must ALSO be ignored: leaf hasn't ended yet
        t.end_span(0, &collector, None); // ends leaf-op itself
        let inner = t.lock();
        assert_eq!(inner.spans.len(), 1);
        assert_eq!(inner.spans[0].name, "leaf-op");
    }

    #[test]
    fn end_transaction_is_idempotent() {
        let t = txn(None);
        t.end_transaction(Some("OK".to_string()), Some("first".to_string()));
        t.end_transaction(Some("ignored".to_string()), Some("second".to_string()));
        let inner = t.lock();
        assert_eq!(inner.result.as_deref(), Some("OK"));
    }

    #[test]
    fn unsampled_transaction_drops_spans_and_context_on_finish() {
        let t = Transaction::simple("test".to_string(), false, None);
        let collector = NoopFrameCollector;
        t.begin_span("s", "custom", None, vec![], false);
        t.end_span(0, &collector, None);
        t.merge_context("custom", serde_json::json!({"k": "v"}));
        t.end_transaction(Some("OK".to_string()), Some("n".to_string()));
        let finished = t.to_finished(None);
        assert!(finished.spans.is_empty());
        assert!(finished.context.is_none());
    }

    struct StubFrameCollector;

    impl crate::trace::FrameCollector for StubFrameCollector {
        fn collect(&self, _skip_frames: u32) -> Vec<crate::trace::Frame> {
            vec![crate::trace::Frame::default()]
        }
    }

    #[test]
    fn span_frames_min_duration_none_always_collects_frames() {
        let t = txn(None);
        let collector = StubFrameCollector;
        t.begin_span("s", "custom", None, vec![], false);
        t.end_span(0, &collector, None);
        let inner = t.lock();
        assert!(!inner.spans[0].frames.is_empty());
    }

    #[test]
    fn span_frames_min_duration_above_span_duration_omits_frames() {
        let t = txn(None);
        let collector = StubFrameCollector;
        t.begin_span("s", "custom", None, vec![], false);
        // Every span in this test finishes in well under an hour, so a
        // floor that high must suppress frame collection entirely
        // (`spec.md` §6: "spans shorter than this omit frames").
        t.end_span(0, &collector, Some(Duration::from_secs(3600)));
        let inner = t.lock();
        assert!(inner.spans[0].frames.is_empty());
    }
}
