//! Agent configuration surface (`spec.md` §6).
//!
//! Programmatic setters only: loading from environment or files is an
//! explicit Non-goal (`spec.md` §1) left to the host, but the builder
//! shape itself follows `opentelemetry_sdk::trace::config::Config` /
//! `BatchConfig` — plain fields with `with_*` builder methods and a
//! `Default` impl carrying the teacher's own defaults where `spec.md` is
//! silent on a number.

use std::time::Duration;

use regex::Regex;

const SERVICE_NAME_PATTERN: &str = r"^[a-zA-Z0-9 _-]+$";

/// Controls whether captured local variables are attached to records, and
/// to which record kinds (`spec.md` §6: `collect_local_variables`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectLocalVariables {
    #[default]
    Disabled,
    Errors,
    Transactions,
    All,
}

/// How many lines of surrounding source to capture per frame class
/// (`spec.md` §6: `source_lines_{error,span}_{app,library}_frames`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceContextLines {
    pub error_app_frames: u32,
    pub error_library_frames: u32,
    pub span_app_frames: u32,
    pub span_library_frames: u32,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub service_name: String,
    pub secret_token: Option<String>,
    pub server_url: String,
    /// Absence disables send (`spec.md` §6: "transport_class ... absence
    /// disables send"). `None` means "no transport configured".
    pub transport_enabled: bool,
    pub verify_server_cert: bool,
    pub async_mode: bool,
    pub compress_level: u32,
    pub max_flush_time: Option<Duration>,
    pub max_buffer_size: usize,
    pub transaction_max_spans: Option<u32>,
    pub transaction_sample_rate: f64,
    pub transactions_ignore_patterns: Vec<String>,
    pub span_frames_min_duration: Option<Duration>,
    pub collect_local_variables: CollectLocalVariables,
    pub local_var_max_length: usize,
    pub local_var_list_max_length: usize,
    pub source_lines: SourceContextLines,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub disable_send: bool,
    pub environment: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            service_name: String::new(),
            secret_token: None,
            server_url: "http://localhost:8200".to_string(),
            transport_enabled: true,
            verify_server_cert: true,
            async_mode: true,
            compress_level: 5,
            max_flush_time: Some(Duration::from_secs(10)),
            max_buffer_size: 768 * 1024,
            transaction_max_spans: Some(500),
            transaction_sample_rate: 1.0,
            transactions_ignore_patterns: Vec::new(),
            span_frames_min_duration: None,
            collect_local_variables: CollectLocalVariables::default(),
            local_var_max_length: 200,
            local_var_list_max_length: 10,
            source_lines: SourceContextLines::default(),
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            disable_send: false,
            environment: None,
        }
    }
}

impl AgentConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        AgentConfig {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_secret_token(mut self, token: impl Into<String>) -> Self {
        self.secret_token = Some(token.into());
        self
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_transaction_sample_rate(mut self, rate: f64) -> Self {
        self.transaction_sample_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_transaction_max_spans(mut self, max_spans: Option<u32>) -> Self {
        self.transaction_max_spans = max_spans;
        self
    }

    pub fn with_ignore_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.transactions_ignore_patterns.push(pattern.into());
        self
    }

    pub fn with_max_flush_time(mut self, max_flush_time: Option<Duration>) -> Self {
        self.max_flush_time = max_flush_time;
        self
    }

    pub fn with_max_buffer_size(mut self, bytes: usize) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    pub fn with_compress_level(mut self, level: u32) -> Self {
        self.compress_level = level.min(9);
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_disable_send(mut self, disable: bool) -> Self {
        self.disable_send = disable;
        self
    }

    /// `async_mode = false` selects inline delivery on the producer thread
    /// instead of a dedicated background worker (`spec.md` §6).
    pub fn with_async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    /// `service_name` must be non-empty and match `[a-zA-Z0-9 _-]+`
    /// (`spec.md` §6). An invalid value is reported so the caller can
    /// disable send, not panic.
    pub fn validate(&self) -> Result<(), crate::error::AgentError> {
        let re = Regex::new(SERVICE_NAME_PATTERN).expect("static pattern is valid");
        if self.service_name.is_empty() || !re.is_match(&self.service_name) {
            return Err(crate::error::AgentError::ConfigurationInvalid(format!(
                "service_name {:?} must be non-empty and match {SERVICE_NAME_PATTERN}",
                self.service_name
            )));
        }
        Ok(())
    }

    pub fn send_enabled(&self) -> bool {
        self.transport_enabled && !self.disable_send
    }
}
