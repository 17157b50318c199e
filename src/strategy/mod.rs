pub mod breaker;
pub mod retry;

use crate::error::{GatewayError, GatewayResult};
use crate::events::{self, EventSender, GatewayEvent};
use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Weighted,
    #[default]
    RoundRobin,
    LeastConnections,
    LatencyBased,
    Failover,
}

/// Derived upstream health, computed from breaker state and error rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Connected,
    Degraded,
    Disconnected,
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamMetrics {
    pub requests: u64,
    pub errors: u64,
    pub total_latency_ms: u64,
    pub in_flight: u32,
    #[serde(skip)]
    pub last_activity: Option<Instant>,
}

impl UpstreamMetrics {
    pub fn mean_latency_ms(&self) -> Option<f64> {
        if self.requests == 0 {
            None
        } else {
            Some(self.total_latency_ms as f64 / self.requests as f64)
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    #[serde(default)]
    pub kind: StrategyKind,
    /// Weights for the weighted strategy; unlisted upstreams weigh 1.
    #[serde(default)]
    pub weights: HashMap<String, u32>,
    /// Preference order for the failover strategy; first entry is the
    /// primary. Candidates not listed rank last, in candidate order.
    #[serde(default)]
    pub failover_order: Vec<String>,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: retry::RetryPolicy,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::default(),
            weights: HashMap::new(),
            failover_order: Vec::new(),
            breaker: BreakerConfig::default(),
            retry: retry::RetryPolicy::default(),
        }
    }
}

/// Picks an upstream for each call and tracks per-upstream breakers and
/// metrics. All operations take `&mut self` behind the router's lock;
/// critical sections are short and never await.
pub struct StrategyEngine {
    config: StrategyConfig,
    breakers: HashMap<String, CircuitBreaker>,
    metrics: HashMap<String, UpstreamMetrics>,
    /// Per-tool rotation cursor for round-robin.
    rr_cursor: HashMap<String, usize>,
    events: EventSender,
}

impl StrategyEngine {
    pub fn new(config: StrategyConfig, events: EventSender) -> Self {
        Self {
            config,
            breakers: HashMap::new(),
            metrics: HashMap::new(),
            rr_cursor: HashMap::new(),
            events,
        }
    }

    pub fn retry_policy(&self) -> &retry::RetryPolicy {
        &self.config.retry
    }

    /// Select an upstream for `tool` among `candidates`.
    ///
    /// Breaker-admitted candidates are preferred; when none admit
    /// traffic, one open breaker past its retry horizon is probed
    /// (half-open). A `<server>__` prefix in the tool name short-circuits
    /// to that server when it is among the healthy set.
    pub fn select(
        &mut self,
        tool: &str,
        candidates: &[String],
        now: Instant,
    ) -> GatewayResult<String> {
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyUpstreams { tool: tool.into() });
        }

        let mut healthy: Vec<String> = candidates
            .iter()
            .filter(|name| self.breaker(name).admits())
            .cloned()
            .collect();

        if healthy.is_empty() {
            // Probe the first open breaker whose horizon has passed.
            for name in candidates {
                if let Some(t) = self.breaker_mut(name).try_half_open(now) {
                    self.emit_transition(name, t);
                    healthy.push(name.clone());
                    break;
                }
            }
        }

        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyUpstreams { tool: tool.into() });
        }

        // Explicit server prefix wins when that server is healthy.
        if let Some(prefix) = tool.split("__").next() {
            if prefix != tool && healthy.iter().any(|h| h == prefix) {
                return Ok(prefix.to_string());
            }
        }

        let chosen = match self.config.kind {
            StrategyKind::Weighted => self.pick_weighted(&healthy),
            StrategyKind::RoundRobin => self.pick_round_robin(tool, &healthy),
            StrategyKind::LeastConnections => self.pick_least_connections(&healthy),
            StrategyKind::LatencyBased => self.pick_latency(&healthy),
            StrategyKind::Failover => self.pick_failover(tool, candidates, &healthy),
        };
        debug!("Selected upstream '{}' for tool '{}'", chosen, tool);
        Ok(chosen)
    }

    fn pick_weighted(&self, healthy: &[String]) -> String {
        let weights: Vec<u64> = healthy
            .iter()
            .map(|name| u64::from(*self.config.weights.get(name).unwrap_or(&1)).max(1))
            .collect();
        let total: u64 = weights.iter().sum();
        let mut roll = rand::random_range(0..total);
        for (name, weight) in healthy.iter().zip(&weights) {
            if roll < *weight {
                return name.clone();
            }
            roll -= weight;
        }
        healthy[healthy.len() - 1].clone()
    }

    fn pick_round_robin(&mut self, tool: &str, healthy: &[String]) -> String {
        let cursor = self.rr_cursor.entry(tool.to_string()).or_insert(0);
        let chosen = healthy[*cursor % healthy.len()].clone();
        *cursor = cursor.wrapping_add(1);
        chosen
    }

    fn pick_least_connections(&self, healthy: &[String]) -> String {
        healthy
            .iter()
            .min_by_key(|name| {
                self.metrics
                    .get(name.as_str())
                    .map(|m| m.in_flight)
                    .unwrap_or(0)
            })
            .cloned()
            .unwrap_or_else(|| healthy[0].clone())
    }

    fn pick_latency(&self, healthy: &[String]) -> String {
        healthy
            .iter()
            .min_by(|a, b| {
                let la = self
                    .metrics
                    .get(a.as_str())
                    .and_then(|m| m.mean_latency_ms())
                    .unwrap_or(f64::INFINITY);
                let lb = self
                    .metrics
                    .get(b.as_str())
                    .and_then(|m| m.mean_latency_ms())
                    .unwrap_or(f64::INFINITY);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .unwrap_or_else(|| healthy[0].clone())
    }

    fn pick_failover(&self, tool: &str, declared: &[String], healthy: &[String]) -> String {
        // Declared order first, then remaining candidates in their
        // natural order.
        let primary = self
            .config
            .failover_order
            .first()
            .cloned()
            .unwrap_or_else(|| declared[0].clone());

        let ordered = self
            .config
            .failover_order
            .iter()
            .chain(declared.iter().filter(|c| !self.config.failover_order.contains(c)));

        for name in ordered {
            if healthy.iter().any(|h| h == name) {
                if *name != primary {
                    events::emit(
                        &self.events,
                        GatewayEvent::Failover {
                            tool: tool.to_string(),
                            from: primary.clone(),
                            to: name.clone(),
                        },
                    );
                }
                return name.clone();
            }
        }
        healthy[0].clone()
    }

    // -- accounting ---------------------------------------------------------

    pub fn begin_request(&mut self, server: &str, now: Instant) {
        let m = self.metrics.entry(server.to_string()).or_default();
        m.in_flight += 1;
        m.last_activity = Some(now);
    }

    pub fn record_success(&mut self, server: &str, latency_ms: u64, now: Instant) {
        {
            let m = self.metrics.entry(server.to_string()).or_default();
            m.in_flight = m.in_flight.saturating_sub(1);
            m.requests += 1;
            m.total_latency_ms += latency_ms;
            m.last_activity = Some(now);
        }
        if let Some(t) = self.breaker_mut(server).record_success(now) {
            self.emit_transition(server, t);
        }
    }

    pub fn record_failure(&mut self, server: &str, now: Instant) {
        {
            let m = self.metrics.entry(server.to_string()).or_default();
            m.in_flight = m.in_flight.saturating_sub(1);
            m.requests += 1;
            m.errors += 1;
            m.last_activity = Some(now);
        }
        if let Some(t) = self.breaker_mut(server).record_failure(now) {
            self.emit_transition(server, t);
        }
    }

    /// Operator-initiated reset back to closed.
    #[allow(dead_code)]
    pub fn reset_breaker(&mut self, server: &str, now: Instant) {
        if let Some(t) = self.breaker_mut(server).reset(now) {
            self.emit_transition(server, t);
        }
    }

    #[allow(dead_code)]
    pub fn breaker_state(&self, server: &str) -> BreakerState {
        self.breaker(server).state()
    }

    #[allow(dead_code)]
    pub fn metrics_of(&self, server: &str) -> Option<&UpstreamMetrics> {
        self.metrics.get(server)
    }

    /// open breaker -> disconnected; error rate above one half ->
    /// degraded; no samples -> unknown; else connected.
    pub fn health_of(&self, server: &str) -> HealthState {
        if self.breaker(server).state() == BreakerState::Open {
            return HealthState::Disconnected;
        }
        match self.metrics.get(server) {
            None => HealthState::Unknown,
            Some(m) if m.requests == 0 => HealthState::Unknown,
            Some(m) if m.error_rate() > 0.5 => HealthState::Degraded,
            Some(_) => HealthState::Connected,
        }
    }

    fn breaker(&self, server: &str) -> &CircuitBreaker {
        // Read path: a missing breaker behaves as a fresh closed one.
        // The static fallback avoids mutating on reads.
        static FRESH: std::sync::OnceLock<CircuitBreaker> = std::sync::OnceLock::new();
        self.breakers.get(server).unwrap_or_else(|| {
            FRESH.get_or_init(|| CircuitBreaker::new(BreakerConfig::default()))
        })
    }

    fn breaker_mut(&mut self, server: &str) -> &mut CircuitBreaker {
        let config = self.config.breaker.clone();
        self.breakers
            .entry(server.to_string())
            .or_insert_with(|| CircuitBreaker::new(config))
    }

    fn emit_transition(&self, server: &str, t: breaker::Transition) {
        events::emit(
            &self.events,
            GatewayEvent::BreakerTransition {
                server: server.to_string(),
                from: t.from.as_str().to_string(),
                to: t.to.as_str().to_string(),
            },
        );
    }
}
