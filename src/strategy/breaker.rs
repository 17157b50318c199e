use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_reset_timeout_ms() -> u64 {
    60_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// A state transition, reported so the engine can publish an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
}

/// Per-upstream circuit breaker.
///
/// closed --(failures reach threshold)--> open
/// open --(reset timeout elapsed, one probe)--> half-open
/// half-open --(any failure)--> open
/// half-open --(success_threshold consecutive successes)--> closed
///
/// Closed-state failures decay by one on each success so an occasional
/// error never accumulates into a trip.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_change: Instant,
    next_retry: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failures: 0,
            successes: 0,
            last_change: Instant::now(),
            next_retry: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    #[allow(dead_code)]
    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    #[allow(dead_code)]
    pub fn last_change(&self) -> Instant {
        self.last_change
    }

    #[allow(dead_code)]
    pub fn next_retry(&self) -> Option<Instant> {
        self.next_retry
    }

    /// Whether traffic may flow right now. Open admits nothing until the
    /// probe transition is taken explicitly via `try_half_open`.
    pub fn admits(&self) -> bool {
        matches!(self.state, BreakerState::Closed | BreakerState::HalfOpen)
    }

    /// Take the open -> half-open probe transition if the reset timeout
    /// has elapsed.
    pub fn try_half_open(&mut self, now: Instant) -> Option<Transition> {
        if self.state != BreakerState::Open {
            return None;
        }
        match self.next_retry {
            Some(at) if now >= at => {
                Some(self.transition(BreakerState::HalfOpen, now))
            }
            _ => None,
        }
    }

    pub fn record_success(&mut self, now: Instant) -> Option<Transition> {
        match self.state {
            BreakerState::Closed => {
                self.failures = self.failures.saturating_sub(1);
                None
            }
            BreakerState::HalfOpen => {
                self.successes += 1;
                if self.successes >= self.config.success_threshold {
                    Some(self.transition(BreakerState::Closed, now))
                } else {
                    None
                }
            }
            // A late success while open changes nothing.
            BreakerState::Open => None,
        }
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<Transition> {
        match self.state {
            BreakerState::Closed => {
                self.failures += 1;
                if self.failures >= self.config.failure_threshold {
                    Some(self.trip(now))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => Some(self.trip(now)),
            BreakerState::Open => None,
        }
    }

    /// Operator-initiated reset back to closed.
    pub fn reset(&mut self, now: Instant) -> Option<Transition> {
        if self.state == BreakerState::Closed {
            self.failures = 0;
            return None;
        }
        Some(self.transition(BreakerState::Closed, now))
    }

    fn trip(&mut self, now: Instant) -> Transition {
        let t = self.transition(BreakerState::Open, now);
        self.next_retry = Some(now + self.config.reset_timeout());
        t
    }

    fn transition(&mut self, to: BreakerState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_change = now;
        self.failures = 0;
        self.successes = 0;
        if to != BreakerState::Open {
            self.next_retry = None;
        }
        Transition { from, to }
    }
}
