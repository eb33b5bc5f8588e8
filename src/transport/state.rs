//! Failure state machine: online/error back-off gating for the worker's
//! network sends.
//!
//! Field names and the `min(retry_number, 6)^2` formula are carried over
//! exactly from `elasticapm.transport.base.TransportState` (`spec.md`
//! §4.8). Owned exclusively by the worker thread — producers never
//! consult or mutate it (`spec.md` §5).

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Online,
    Error,
}

/// Gates whether the worker attempts a network send this flush.
#[derive(Debug)]
pub struct FailureState {
    state: State,
    retry_number: i32,
    last_check: Option<Instant>,
}

impl Default for FailureState {
    fn default() -> Self {
        FailureState {
            state: State::Online,
            retry_number: -1,
            last_check: None,
        }
    }
}

impl FailureState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True in `ONLINE`; in `ERROR`, true iff
    /// `monotonic_now − last_check > min(retry_number, 6)^2` seconds.
    pub fn should_try(&self) -> bool {
        match self.state {
            State::Online => true,
            State::Error => {
                let last_check = match self.last_check {
                    Some(t) => t,
                    None => return true,
                };
                let backoff = (self.retry_number.clamp(0, 6) as f64).powi(2);
                last_check.elapsed().as_secs_f64() > backoff
            }
        }
    }

    pub fn set_success(&mut self) {
        self.state = State::Online;
        self.retry_number = -1;
        self.last_check = None;
    }

    pub fn set_fail(&mut self) {
        self.state = State::Error;
        self.retry_number += 1;
        self.last_check = Some(Instant::now());
    }

    pub fn is_online(&self) -> bool {
        self.state == State::Online
    }
}
