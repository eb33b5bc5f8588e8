//! End-to-end smoke test driving the public API the way a host integration
//! would: begin a transaction, nest a span, capture an error, tag it, end
//! it, and confirm exactly the expected record reaches the transport.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apm_agent_core::trace::NoopFrameCollector;
use apm_agent_core::transport::Sender;
use apm_agent_core::{AgentConfig, Client};

#[derive(Debug, Default)]
struct CapturingSender {
    batches: Mutex<Vec<Vec<u8>>>,
}

impl Sender for CapturingSender {
    fn send(&self, body: Vec<u8>) -> Result<(), String> {
        self.batches.lock().unwrap().push(body);
        Ok(())
    }
}

impl CapturingSender {
    fn transaction_names(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|gz| {
                let mut decoder = flate2::read::GzDecoder::new(gz.as_slice());
                let mut text = String::new();
                decoder.read_to_string(&mut text).unwrap();
                text.lines().map(str::to_string).collect::<Vec<_>>()
            })
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(&line).ok())
            .filter_map(|v| {
                v.get("transaction")
                    .and_then(|t| t.get("name"))
                    .and_then(|n| n.as_str())
                    .map(str::to_string)
            })
            .collect()
    }
}

#[test]
fn end_to_end_transaction_with_spans_and_error_reaches_the_collector() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sender = Arc::new(CapturingSender::default());
    let client = Client::new(
        AgentConfig::new("smoke-test-service"),
        sender.clone(),
        Arc::new(NoopFrameCollector),
    );

    client.begin_transaction("request", None);
    {
        let _span = client.scoped_span(
            "SELECT",
            "db.query",
            None,
            vec!["select".to_string()],
            false,
        );
    }
    client.capture_error("ValueError", "builtins", "boom", true);
    client.set_tag("env", "staging");
    client.end_transaction(Some("OK".to_string()), Some("GET /smoke".to_string()));

    client.close(Duration::from_secs(5)).unwrap();

    assert_eq!(sender.transaction_names(), vec!["GET /smoke".to_string()]);
}
