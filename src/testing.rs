//! In-memory collaborators for tests: a recording transport [`Sender`] any
//! crate consumer can wire into a [`crate::Client`] instead of
//! [`crate::transport::HttpSender`].
//!
//! Shaped after `opentelemetry_sdk::testing::trace::InMemorySpanExporter`:
//! capture everything, never fail unless told to, expose it back for
//! assertions.

use std::io::Read;
use std::sync::Mutex;

use crate::transport::Sender;

/// Records every batch handed to it instead of sending it anywhere.
#[derive(Debug, Default)]
pub struct RecordingSender {
    batches: Mutex<Vec<Vec<u8>>>,
    always_fail: bool,
}

impl RecordingSender {
    pub fn new() -> Self {
        RecordingSender::default()
    }

    pub fn always_failing() -> Self {
        RecordingSender {
            batches: Mutex::new(Vec::new()),
            always_fail: true,
        }
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    /// Decodes every recorded batch and returns its ndjson lines, in the
    /// order batches were sent.
    pub fn lines(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|gz| {
                let mut decoder = flate2::read::GzDecoder::new(gz.as_slice());
                let mut text = String::new();
                decoder
                    .read_to_string(&mut text)
                    .expect("recorded batch must be valid gzip");
                text.lines().map(str::to_string).collect::<Vec<_>>()
            })
            .collect()
    }

    /// The `name` field of every `transaction` record across every batch.
    pub fn transaction_names(&self) -> Vec<String> {
        self.lines()
            .iter()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|value| {
                value
                    .get("transaction")
                    .and_then(|t| t.get("name"))
                    .and_then(|n| n.as_str())
                    .map(str::to_string)
            })
            .collect()
    }
}

impl Sender for RecordingSender {
    fn send(&self, body: Vec<u8>) -> Result<(), String> {
        self.batches.lock().unwrap().push(body);
        if self.always_fail {
            Err("simulated failure".to_string())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_sent_batches() {
        let sender = RecordingSender::new();
        assert!(sender.send(vec![1, 2, 3]).is_ok());
        assert_eq!(sender.batch_count(), 1);
    }

    #[test]
    fn always_failing_reports_errors_but_still_records() {
        let sender = RecordingSender::always_failing();
        assert!(sender.send(vec![1, 2, 3]).is_err());
        assert_eq!(sender.batch_count(), 1);
    }
}
