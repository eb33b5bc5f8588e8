//! HTTP delivery of a framed batch (`spec.md` §6).
//!
//! Trait shape borrowed from `opentelemetry_http::HttpClient`; the default
//! implementation uses `reqwest`'s blocking client the way
//! `opentelemetry-otlp`'s `reqwest-blocking-client` feature does, since the
//! worker thread is a dedicated OS thread and the network send is meant to
//! be a blocking suspension point (`spec.md` §5).

use std::fmt;
use std::time::Duration;

/// Sends a framed, gzipped batch to the collector. A trait so tests can
/// substitute [`crate::testing::RecordingSender`] for the real HTTP client.
pub trait Sender: Send + Sync + fmt::Debug {
    /// Returns `Ok(())` on any 2xx response, `Err` otherwise (transport
    /// exception or non-2xx status). Never panics on a network failure.
    fn send(&self, body: Vec<u8>) -> Result<(), String>;
}

/// Blocking HTTP POST sender.
#[derive(Debug)]
pub struct HttpSender {
    client: reqwest::blocking::Client,
    endpoint: String,
    secret_token: Option<String>,
    user_agent: String,
}

impl HttpSender {
    pub fn new(
        server_url: &str,
        secret_token: Option<String>,
        agent_name: &str,
        agent_version: &str,
        verify_server_cert: bool,
        timeout: Duration,
    ) -> Result<Self, String> {
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(!verify_server_cert)
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(HttpSender {
            client,
            endpoint: format!("{}/intake/v2/events", server_url.trim_end_matches('/')),
            secret_token,
            user_agent: format!("{agent_name}/{agent_version}"),
        })
    }
}

impl Sender for HttpSender {
    fn send(&self, body: Vec<u8>) -> Result<(), String> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/x-ndjson")
            .header("Content-Encoding", "gzip")
            .header("User-Agent", &self.user_agent);
        if let Some(token) = &self.secret_token {
            if !token.is_empty() {
                req = req.header("Authorization", format!("Bearer {token}"));
            }
        }
        let response = req.body(body).send().map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().unwrap_or_default();
            Err(format!("collector responded {status}: {text}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FakeSender {
        always_fail: bool,
    }

    impl Sender for FakeSender {
        fn send(&self, _body: Vec<u8>) -> Result<(), String> {
            if self.always_fail {
                Err("simulated failure".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn fake_sender_reports_failure() {
        let s = FakeSender { always_fail: true };
        assert!(s.send(vec![1, 2, 3]).is_err());
    }

    #[test]
    fn fake_sender_reports_success() {
        let s = FakeSender { always_fail: false };
        assert!(s.send(vec![1, 2, 3]).is_ok());
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let sender = HttpSender::new(
            "https://collector.example/",
            None,
            "apm-agent-core",
            "0.1.0",
            true,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(sender.endpoint, "https://collector.example/intake/v2/events");
    }
}
