//! Count-based circuit breaker gating backend relaunches.
//!
//! Three states: closed (normal), open (relaunches suppressed), half-open
//! (one probe allowed after the recovery window). Transitions depend only on
//! failure/success counts plus a wall-clock recovery timestamp.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: State,
    failure_threshold: u32,
    recovery: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            state: State::Closed { failures: 0 },
            failure_threshold,
            recovery,
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        match self.state {
            State::Closed { .. } => true,
            State::Open { since } => {
                if now.saturating_duration_since(since) >= self.recovery {
                    self.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => true,
        }
    }

    pub fn record_success(&mut self) {
        self.state = State::Closed { failures: 0 };
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.state = match self.state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    State::Open { since: now }
                } else {
                    State::Closed { failures }
                }
            }
            // A failed probe re-opens immediately.
            State::HalfOpen | State::Open { .. } => State::Open { since: now },
        };
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. })
    }
}
