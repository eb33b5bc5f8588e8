//! Canonical textual encoding of records: the `{event_type: record}\n`
//! ndjson convention, keyword truncation, and the tag-name validation regex.
//!
//! Grounded in `elasticapm.transport.base`'s queue items (each wrapped as a
//! single-key dict keyed by event type before being written as one JSON
//! line) and `elasticapm.utils.encoding.keyword_field`.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::error::ErrorEvent;
use crate::trace::FinishedTransaction;

/// Any string field marked as a "keyword" is truncated to this many code
/// units (`spec.md` §6). `elastic/apm-agent-python`'s real constant; kept
/// here since `original_source`'s retrieved files didn't include
/// `conf/constants.py`.
pub const KEYWORD_MAX_LENGTH: usize = 1024;

/// Replaces the truncation point's tail so equality with the untruncated
/// original is guaranteed to fail (`spec.md` §6).
const TRUNCATION_MARKER: char = '\u{2026}'; // "…"

/// Truncates `s` to `KEYWORD_MAX_LENGTH` Unicode scalar values, replacing
/// the last one with [`TRUNCATION_MARKER`] when truncation occurs.
pub fn keyword_field(s: &str) -> String {
    if s.chars().count() <= KEYWORD_MAX_LENGTH {
        return s.to_string();
    }
    let mut truncated: String = s.chars().take(KEYWORD_MAX_LENGTH.saturating_sub(1)).collect();
    truncated.push(TRUNCATION_MARKER);
    truncated
}

/// `^[^.*"]+$` — tag keys may not contain dots, stars or double quotes
/// (`spec.md` §4.5).
// TODO Replace this with LazyLock once it is stable.
static TAG_NAME_PATTERN: OnceLock<Regex> = OnceLock::new();

pub fn tag_name_regex() -> &'static Regex {
    TAG_NAME_PATTERN.get_or_init(|| Regex::new(r#"^[^.*"]+$"#).expect("static pattern is valid"))
}

/// One of the three event kinds that can appear as an ndjson line, plus the
/// `metadata` line every batch starts with (`spec.md` §4.7).
#[derive(Debug)]
pub enum Record<'a> {
    Metadata(&'a Metadata),
    Transaction(&'a FinishedTransaction),
    Error(&'a ErrorEvent),
}

/// Static per-agent/service metadata written as the first line of every
/// batch.
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub service_name: String,
    pub agent_name: String,
    pub agent_version: String,
    pub environment: Option<String>,
}

/// Encodes `record` as one `{event_type: ...}` JSON line, including the
/// trailing `\n` (`spec.md` §4.7: "terminated by `\n`").
pub fn encode_line(record: &Record<'_>) -> Result<String, serde_json::Error> {
    let mut buf = match record {
        Record::Metadata(m) => serialize_wrapped("metadata", m)?,
        Record::Transaction(t) => serialize_wrapped("transaction", &TransactionWire::from(*t))?,
        Record::Error(e) => serialize_wrapped("error", &ErrorWire::from(*e))?,
    };
    buf.push('\n');
    Ok(buf)
}

/// Wire shape for a captured error/message record. Carries the associated
/// transaction id (if any) and a microsecond timestamp onto the wire, which
/// `ErrorEvent` itself keeps out of its `Serialize` impl so in-process code
/// can compare/clone it without dealing with timestamp formatting
/// (`spec.md` §3: "associated transaction ID (if any), timestamp").
#[derive(Debug, Serialize)]
struct ErrorWire {
    #[serde(skip_serializing_if = "Option::is_none")]
    exception_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exception_module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    param_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logger_name: Option<String>,
    handled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stacktrace: Vec<crate::trace::Frame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    culprit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id: Option<String>,
    timestamp: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_context: Option<serde_json::Value>,
}

impl From<&ErrorEvent> for ErrorWire {
    fn from(e: &ErrorEvent) -> Self {
        ErrorWire {
            exception_type: e.exception_type.as_deref().map(keyword_field),
            exception_module: e.exception_module.as_deref().map(keyword_field),
            message: e.message.clone(),
            param_message: e.param_message.clone(),
            logger_name: e.logger_name.as_deref().map(keyword_field),
            handled: e.handled,
            stacktrace: e.frames.clone(),
            culprit: e.culprit.clone(),
            transaction_id: e.transaction_id.map(|id| id.to_hex()),
            timestamp: e
                .timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_micros())
                .unwrap_or(0),
            custom_context: e.custom_context.clone(),
        }
    }
}

fn serialize_wrapped<T: Serialize>(key: &str, value: &T) -> Result<String, serde_json::Error> {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(key.to_string(), serde_json::to_value(value)?);
    serde_json::to_string(&serde_json::Value::Object(map))
}

/// Wire shape for a finished transaction: applies keyword truncation to
/// `name`/`type`/`result` and the span `name`/`type` fields, expresses
/// durations in milliseconds and `timestamp` as epoch micros, and reports
/// `span_count` as `{dropped, started}` (`elasticapm.traces.Transaction.to_dict`,
/// `spec.md` §8 scenario 2).
#[derive(Debug, Serialize)]
struct TransactionWire {
    id: String,
    trace_id: String,
    timestamp: u128,
    name: String,
    #[serde(rename = "type")]
    transaction_type: String,
    duration: f64,
    result: String,
    sampled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    spans: Option<Vec<SpanWire>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    span_count: Option<SpanCount>,
}

#[derive(Debug, Serialize)]
struct SpanCount {
    dropped: u32,
    started: u32,
}

#[derive(Debug, Serialize)]
struct SpanWire {
    id: u32,
    name: String,
    #[serde(rename = "type")]
    span_type: String,
    start: f64,
    duration: f64,
    parent: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stacktrace: Vec<crate::trace::Frame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<serde_json::Value>,
}

impl From<&FinishedTransaction> for TransactionWire {
    fn from(t: &FinishedTransaction) -> Self {
        TransactionWire {
            id: t.id.to_hex(),
            trace_id: t.trace_id.to_hex(),
            timestamp: t
                .timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_micros())
                .unwrap_or(0),
            name: keyword_field(&t.name),
            transaction_type: keyword_field(&t.transaction_type),
            duration: t.duration.as_secs_f64() * 1000.0,
            result: keyword_field(&t.result),
            sampled: t.sampled,
            spans: if t.sampled {
                Some(t.spans.iter().map(SpanWire::from).collect())
            } else {
                None
            },
            context: t.context.clone(),
            span_count: if t.dropped_spans > 0 {
                Some(SpanCount {
                    dropped: t.dropped_spans,
                    started: t.spans.len() as u32,
                })
            } else {
                None
            },
        }
    }
}

impl From<&crate::trace::Span> for SpanWire {
    fn from(s: &crate::trace::Span) -> Self {
        let display_name = if s.count > 0 {
            format!("({}x) {}", s.count, s.name)
        } else {
            s.name.clone()
        };
        SpanWire {
            id: s.index,
            name: keyword_field(&display_name),
            span_type: keyword_field(&s.span_type),
            start: s.start_offset.as_secs_f64() * 1000.0,
            duration: s.duration.as_secs_f64() * 1000.0,
            parent: s.parent_index,
            stacktrace: s.frames.clone(),
            context: s.context.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_field_passes_through_short_strings() {
        assert_eq!(keyword_field("short"), "short");
    }

    #[test]
    fn keyword_field_truncates_and_marks_long_strings() {
        let long = "x".repeat(KEYWORD_MAX_LENGTH + 1);
        let truncated = keyword_field(&long);
        assert_eq!(truncated.chars().count(), KEYWORD_MAX_LENGTH);
        assert_ne!(truncated.chars().last().unwrap(), 'x');
        assert_eq!(truncated.chars().last().unwrap(), TRUNCATION_MARKER);
        assert_ne!(truncated, long[..KEYWORD_MAX_LENGTH]);
    }

    #[test]
    fn tag_name_regex_rejects_dots_stars_and_quotes() {
        assert!(tag_name_regex().is_match("clean_tag"));
        assert!(!tag_name_regex().is_match("has.dot"));
        assert!(!tag_name_regex().is_match("has*star"));
        assert!(!tag_name_regex().is_match("has\"quote"));
    }

    #[test]
    fn metadata_line_is_first_and_newline_terminated() {
        let meta = Metadata {
            service_name: "svc".to_string(),
            agent_name: "apm-agent-core".to_string(),
            agent_version: "0.1.0".to_string(),
            environment: None,
        };
        let line = encode_line(&Record::Metadata(&meta)).unwrap();
        assert!(line.starts_with("{\"metadata\":"));
        assert!(line.ends_with('\n'));
    }

    fn finished_transaction_with_dropped_spans(max_spans: u32, total_begins: u32) -> FinishedTransaction {
        let t = crate::trace::Transaction::simple("request".to_string(), true, Some(max_spans));
        let collector = crate::trace::NoopFrameCollector;
        for i in 0..total_begins {
            t.begin_span(format!("s{i}"), "custom", None, vec![], false);
            t.end_span(0, &collector, None);
        }
        t.end_transaction(Some("OK".to_string()), Some("GET /x".to_string()));
        t.to_finished(None)
    }

    #[test]
    fn transaction_wire_carries_its_wall_clock_timestamp() {
        let finished = finished_transaction_with_dropped_spans(3, 3);
        let line = encode_line(&Record::Transaction(&finished)).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        let wire_timestamp = value["transaction"]["timestamp"].as_u64().unwrap();
        let expected = finished
            .timestamp
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_micros() as u64;
        assert_eq!(wire_timestamp, expected);
    }

    #[test]
    fn span_count_reports_both_dropped_and_started() {
        // spec.md §8 scenario 2: max_spans=3, 6 begins -> 3 kept, 3 dropped.
        let finished = finished_transaction_with_dropped_spans(3, 6);
        assert_eq!(finished.spans.len(), 3);
        assert_eq!(finished.dropped_spans, 3);
        let line = encode_line(&Record::Transaction(&finished)).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            value["transaction"]["span_count"],
            serde_json::json!({"dropped": 3, "started": 3})
        );
    }

    #[test]
    fn error_wire_carries_the_associated_transaction_id() {
        let txn_id = crate::ids::TraceId(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736);
        let err = ErrorEvent::for_exception("ValueError", "builtins", "boom", true, Some(txn_id));
        let line = encode_line(&Record::Error(&err)).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            value["error"]["transaction_id"].as_str(),
            Some(txn_id.to_hex().as_str())
        );
    }

    #[test]
    fn error_wire_omits_transaction_id_when_there_is_none() {
        let err = ErrorEvent::for_message("boom", None, "app", None, None);
        let line = encode_line(&Record::Error(&err)).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert!(value["error"].get("transaction_id").is_none());
    }
}
