// Per-role quota enforcement. Window counters are keyed by session id,
// not role, so two sessions resolved to the same role never share a
// budget. Windows roll lazily: a counter older than its window length is
// reset at the next check.

use crate::error::{GatewayError, GatewayResult};
use crate::events::{self, EventSender, GatewayEvent};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    fn length(&self) -> Duration {
        match self {
            Window::Minute => Duration::minutes(1),
            Window::Hour => Duration::hours(1),
            Window::Day => Duration::days(1),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Window::Minute => "per minute",
            Window::Hour => "per hour",
            Window::Day => "per day",
        }
    }
}

/// Window limits shared by role-level quotas and per-tool overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    #[serde(default)]
    pub max_calls_per_minute: Option<u64>,
    #[serde(default)]
    pub max_calls_per_hour: Option<u64>,
    #[serde(default)]
    pub max_calls_per_day: Option<u64>,
    #[serde(default)]
    pub max_concurrent: Option<u32>,
}

impl QuotaLimits {
    fn limit_for(&self, window: Window) -> Option<u64> {
        match window {
            Window::Minute => self.max_calls_per_minute,
            Window::Hour => self.max_calls_per_hour,
            Window::Day => self.max_calls_per_day,
        }
    }

    fn is_unlimited(&self) -> bool {
        self.max_calls_per_minute.is_none()
            && self.max_calls_per_hour.is_none()
            && self.max_calls_per_day.is_none()
            && self.max_concurrent.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    #[serde(flatten)]
    pub limits: QuotaLimits,
    /// Overrides replace the role limits for the named tool only.
    #[serde(default)]
    pub per_tool: HashMap<String, QuotaLimits>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowUsage {
    pub minute: u64,
    pub hour: u64,
    pub day: u64,
    pub concurrent: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub usage: WindowUsage,
    pub limits: QuotaLimits,
    /// Advisory: how long until the nearest exceeded window expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl RateLimitDecision {
    fn allowed(usage: WindowUsage, limits: QuotaLimits) -> Self {
        Self {
            allowed: true,
            reason: None,
            usage,
            limits,
            retry_after_ms: None,
        }
    }

    #[allow(dead_code)]
    pub fn into_result(self) -> GatewayResult<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(GatewayError::RateLimited {
                reason: self.reason.unwrap_or_else(|| "quota exceeded".into()),
                retry_after_ms: self.retry_after_ms.unwrap_or(0),
            })
        }
    }
}

#[derive(Debug, Clone)]
struct WindowCounter {
    start: DateTime<Utc>,
    count: u64,
}

impl WindowCounter {
    fn new(now: DateTime<Utc>) -> Self {
        Self { start: now, count: 0 }
    }

    fn roll(&mut self, now: DateTime<Utc>, window: Window) {
        if now - self.start >= window.length() {
            self.start = now;
            self.count = 0;
        }
    }

    fn expires_in_ms(&self, now: DateTime<Utc>, window: Window) -> u64 {
        let expiry = self.start + window.length();
        (expiry - now).num_milliseconds().max(0) as u64
    }
}

#[derive(Debug, Clone)]
struct ScopeCounters {
    minute: WindowCounter,
    hour: WindowCounter,
    day: WindowCounter,
}

impl ScopeCounters {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            minute: WindowCounter::new(now),
            hour: WindowCounter::new(now),
            day: WindowCounter::new(now),
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        self.minute.roll(now, Window::Minute);
        self.hour.roll(now, Window::Hour);
        self.day.roll(now, Window::Day);
    }

    fn counter(&self, window: Window) -> &WindowCounter {
        match window {
            Window::Minute => &self.minute,
            Window::Hour => &self.hour,
            Window::Day => &self.day,
        }
    }

    fn bump(&mut self) {
        self.minute.count += 1;
        self.hour.count += 1;
        self.day.count += 1;
    }
}

struct SessionCounters {
    role_wide: ScopeCounters,
    per_tool: HashMap<String, ScopeCounters>,
    in_flight: u32,
    last_seen: DateTime<Utc>,
}

/// Quota enforcement engine. `check` is read-only; `consume` advances
/// the window counters and fires 80% warnings; concurrent-start/end
/// bracket in-flight calls.
pub struct RateLimiter {
    quotas: HashMap<String, Quota>,
    sessions: HashMap<String, SessionCounters>,
    events: EventSender,
}

const WARN_RATIO: f64 = 0.8;

impl RateLimiter {
    pub fn new(quotas: HashMap<String, Quota>, events: EventSender) -> Self {
        Self {
            quotas,
            sessions: HashMap::new(),
            events,
        }
    }

    #[allow(dead_code)]
    pub fn set_quota(&mut self, role: impl Into<String>, quota: Quota) {
        self.quotas.insert(role.into(), quota);
    }

    #[allow(dead_code)]
    pub fn quota_for(&self, role: &str) -> Option<&Quota> {
        self.quotas.get(role)
    }

    pub fn check(&mut self, role: &str, session: &str, tool: &str) -> RateLimitDecision {
        self.check_at(role, session, tool, Utc::now())
    }

    pub fn check_at(
        &mut self,
        role: &str,
        session: &str,
        tool: &str,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let quota = match self.quotas.get(role).cloned() {
            Some(quota) => quota,
            None => {
                // Unlimited role; still track for observability.
                let usage = self.usage_of(session, None, now);
                return RateLimitDecision::allowed(usage, QuotaLimits::default());
            }
        };

        let (limits, tool_scope) = match quota.per_tool.get(tool) {
            Some(overridden) => (overridden.clone(), Some(tool.to_string())),
            None => (quota.limits.clone(), None),
        };

        if limits.is_unlimited() {
            let usage = self.usage_of(session, tool_scope.as_deref(), now);
            return RateLimitDecision::allowed(usage, limits);
        }

        let in_flight = self
            .sessions
            .get(session)
            .map(|s| s.in_flight)
            .unwrap_or(0);

        let counters = self.scope_counters(session, tool_scope.as_deref(), now);
        counters.roll(now);

        let usage = WindowUsage {
            minute: counters.minute.count,
            hour: counters.hour.count,
            day: counters.day.count,
            concurrent: in_flight,
        };

        // Deny on the first exceeded window; advisory retry is the
        // soonest expiry among all exceeded windows.
        let mut denial: Option<String> = None;
        let mut retry_after: Option<u64> = None;
        for window in [Window::Minute, Window::Hour, Window::Day] {
            if let Some(limit) = limits.limit_for(window) {
                let counter = counters.counter(window);
                if counter.count >= limit {
                    let expires = counter.expires_in_ms(now, window);
                    retry_after = Some(retry_after.map_or(expires, |r: u64| r.min(expires)));
                    if denial.is_none() {
                        denial = Some(format!("{} calls {} exceeded", limit, window.label()));
                    }
                }
            }
        }

        if denial.is_none() {
            if let Some(max) = limits.max_concurrent {
                if in_flight >= max {
                    denial = Some(format!("{} concurrent calls exceeded", max));
                }
            }
        }

        match denial {
            Some(reason) => {
                events::emit(
                    &self.events,
                    GatewayEvent::RateLimitExceeded {
                        role: role.to_string(),
                        session: session.to_string(),
                        reason: reason.clone(),
                    },
                );
                RateLimitDecision {
                    allowed: false,
                    reason: Some(reason),
                    usage,
                    limits,
                    retry_after_ms: retry_after,
                }
            }
            None => RateLimitDecision::allowed(usage, limits),
        }
    }

    /// Advance the window counters for one admitted call.
    pub fn consume(&mut self, role: &str, session: &str, tool: &str) {
        self.consume_at(role, session, tool, Utc::now());
    }

    pub fn consume_at(&mut self, role: &str, session: &str, tool: &str, now: DateTime<Utc>) {
        let Some(quota) = self.quotas.get(role).cloned() else {
            return;
        };
        let tool_scope = quota.per_tool.contains_key(tool).then(|| tool.to_string());
        let governing = quota
            .per_tool
            .get(tool)
            .cloned()
            .unwrap_or_else(|| quota.limits.clone());

        // The role-wide window advances for every call; the tool window
        // only when an override governs that tool.
        let counters = self.scope_counters(session, None, now);
        counters.roll(now);
        counters.bump();

        if let Some(tool_key) = &tool_scope {
            let counters = self.scope_counters(session, Some(tool_key), now);
            counters.roll(now);
            counters.bump();
        }

        // 80% warnings against the governing limits.
        let counters = self
            .scope_counters(session, tool_scope.as_deref(), now)
            .clone();
        for window in [Window::Minute, Window::Hour, Window::Day] {
            if let Some(limit) = governing.limit_for(window) {
                let count = counters.counter(window).count;
                let threshold = ((limit as f64) * WARN_RATIO).ceil() as u64;
                if count == threshold && count < limit {
                    debug!(
                        "Session {} at {}/{} of {} window for role {}",
                        session,
                        count,
                        limit,
                        window.label(),
                        role
                    );
                    events::emit(
                        &self.events,
                        GatewayEvent::RateLimitWarning {
                            role: role.to_string(),
                            session: session.to_string(),
                            window: window.label().to_string(),
                            usage: count,
                            limit,
                        },
                    );
                }
            }
        }
    }

    pub fn begin_concurrent(&mut self, session: &str) {
        let now = Utc::now();
        let entry = self.session_entry(session, now);
        entry.in_flight += 1;
        entry.last_seen = now;
    }

    pub fn end_concurrent(&mut self, session: &str) {
        if let Some(entry) = self.sessions.get_mut(session) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            entry.last_seen = Utc::now();
        }
    }

    /// Drop sessions idle longer than `max_idle`, keeping any with
    /// in-flight calls.
    pub fn reap_idle(&mut self, max_idle: Duration, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.in_flight > 0 || now - s.last_seen < max_idle);
        before - self.sessions.len()
    }

    #[allow(dead_code)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn usage_of(&mut self, session: &str, tool_scope: Option<&str>, now: DateTime<Utc>) -> WindowUsage {
        let in_flight = self
            .sessions
            .get(session)
            .map(|s| s.in_flight)
            .unwrap_or(0);
        let counters = self.scope_counters(session, tool_scope, now);
        counters.roll(now);
        WindowUsage {
            minute: counters.minute.count,
            hour: counters.hour.count,
            day: counters.day.count,
            concurrent: in_flight,
        }
    }

    fn session_entry(&mut self, session: &str, now: DateTime<Utc>) -> &mut SessionCounters {
        self.sessions
            .entry(session.to_string())
            .or_insert_with(|| SessionCounters {
                role_wide: ScopeCounters::new(now),
                per_tool: HashMap::new(),
                in_flight: 0,
                last_seen: now,
            })
    }

    fn scope_counters(
        &mut self,
        session: &str,
        tool_scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> &mut ScopeCounters {
        let entry = self.session_entry(session, now);
        entry.last_seen = now;
        match tool_scope {
            Some(tool) => entry
                .per_tool
                .entry(tool.to_string())
                .or_insert_with(|| ScopeCounters::new(now)),
            None => &mut entry.role_wide,
        }
    }
}
