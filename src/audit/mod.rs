pub mod rate_limit;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// Keys whose values are replaced with `[REDACTED]` before an audit
/// entry is stored. Matching is substring, case-insensitive.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "credentials",
    "private_key",
    "privatekey",
    "authorization",
    "auth",
];

pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Error,
}

impl AuditOutcome {
    #[allow(dead_code)]
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Allowed => "allowed",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub role_id: String,
    pub tool: String,
    #[serde(default)]
    pub server: Option<String>,
    /// Sanitized before storage; never contains sensitive values.
    pub args: Value,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Value,
}

/// What to record; the log assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub session_id: String,
    pub role_id: String,
    pub tool: String,
    pub server: Option<String>,
    pub args: Value,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub duration_ms: Option<u64>,
    pub metadata: Value,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub role: Option<String>,
    pub tool: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

struct AuditInner {
    entries: VecDeque<AuditEntry>,
    next_id: u64,
}

/// Bounded in-memory decision log. Appends hold one mutex; the ring
/// drops its oldest entry once `capacity` is reached. Export snapshots
/// the current contents.
pub struct AuditLog {
    capacity: usize,
    inner: Mutex<AuditInner>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(AuditInner {
                entries: VecDeque::new(),
                next_id: 1,
            }),
        }
    }

    pub fn record(&self, record: AuditRecord) -> u64 {
        let entry_args = redact(record.args);
        let mut inner = self.inner.lock().expect("audit lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(AuditEntry {
            id,
            timestamp: Utc::now(),
            session_id: record.session_id,
            role_id: record.role_id,
            tool: record.tool,
            server: record.server,
            args: entry_args,
            outcome: record.outcome,
            reason: record.reason,
            duration_ms: record.duration_ms,
            metadata: record.metadata,
        });
        id
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("audit lock poisoned").entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filtered read, newest first, with offset/limit pagination.
    #[allow(dead_code)]
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let inner = self.inner.lock().expect("audit lock poisoned");
        let matched = inner
            .entries
            .iter()
            .rev()
            .filter(|e| {
                filter.role.as_deref().map_or(true, |r| e.role_id == r)
                    && filter.tool.as_deref().map_or(true, |t| e.tool == t)
                    && filter.outcome.map_or(true, |o| e.outcome == o)
                    && filter.since.map_or(true, |s| e.timestamp >= s)
                    && filter.until.map_or(true, |u| e.timestamp <= u)
            })
            .skip(filter.offset);
        match filter.limit {
            Some(limit) => matched.take(limit).cloned().collect(),
            None => matched.cloned().collect(),
        }
    }

    /// Operator snapshot entry point.
    #[allow(dead_code)]
    pub fn export_json(&self) -> String {
        let inner = self.inner.lock().expect("audit lock poisoned");
        let all: Vec<&AuditEntry> = inner.entries.iter().collect();
        serde_json::to_string_pretty(&all).unwrap_or_else(|_| "[]".to_string())
    }

    /// Operator snapshot entry point.
    #[allow(dead_code)]
    pub fn export_csv(&self) -> String {
        let inner = self.inner.lock().expect("audit lock poisoned");
        let mut out = String::from(
            "id,timestamp,sessionId,roleId,tool,server,outcome,reason,durationMs,args\n",
        );
        for e in &inner.entries {
            let row = [
                e.id.to_string(),
                e.timestamp.to_rfc3339(),
                e.session_id.clone(),
                e.role_id.clone(),
                e.tool.clone(),
                e.server.clone().unwrap_or_default(),
                e.outcome.as_str().to_string(),
                e.reason.clone().unwrap_or_default(),
                e.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
                e.args.to_string(),
            ];
            let escaped: Vec<String> = row.iter().map(|f| csv_escape(f)).collect();
            out.push_str(&escaped.join(","));
            out.push('\n');
        }
        out
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Replace values under sensitive keys, walking nested objects and
/// arrays.
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let redacted = map
                .into_iter()
                .map(|(key, v)| {
                    if is_sensitive_key(&key) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, redact(v))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|s| lowered.contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_for(tool: &str, outcome: AuditOutcome) -> AuditRecord {
        AuditRecord {
            session_id: "s1".into(),
            role_id: "developer".into(),
            tool: tool.into(),
            server: Some("fs".into()),
            args: json!({"path": "/tmp/x"}),
            outcome,
            reason: None,
            duration_ms: Some(12),
            metadata: Value::Null,
        }
    }

    #[test]
    fn redacts_sensitive_keys_recursively() {
        let args = json!({
            "path": "/tmp/x",
            "api_key": "sk-12345",
            "nested": {
                "Authorization": "Bearer abc",
                "config": { "ClientSecret": "hush" },
                "safe": "visible"
            },
            "items": [{"token": "t1"}, {"value": 3}]
        });
        let redacted = redact(args);
        assert_eq!(redacted["api_key"], REDACTED);
        assert_eq!(redacted["nested"]["Authorization"], REDACTED);
        assert_eq!(redacted["nested"]["config"]["ClientSecret"], REDACTED);
        assert_eq!(redacted["nested"]["safe"], "visible");
        assert_eq!(redacted["items"][0]["token"], REDACTED);
        assert_eq!(redacted["items"][1]["value"], 3);
        assert_eq!(redacted["path"], "/tmp/x");
    }

    #[test]
    fn stored_entries_never_contain_secret_values() {
        let log = AuditLog::new(16);
        let mut rec = record_for("fs__read", AuditOutcome::Allowed);
        rec.args = json!({"password": "hunter2", "query": "ok"});
        log.record(rec);
        let exported = log.export_json();
        assert!(!exported.contains("hunter2"));
        assert!(exported.contains(REDACTED));
        assert!(exported.contains("\"query\": \"ok\""));
    }

    #[test]
    fn ring_drops_oldest_at_capacity() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.record(record_for(&format!("tool{}", i), AuditOutcome::Allowed));
        }
        assert_eq!(log.len(), 3);
        let entries = log.query(&AuditFilter::default());
        // Newest first, ids keep climbing monotonically.
        let ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[test]
    fn query_filters_and_paginates() {
        let log = AuditLog::new(64);
        log.record(record_for("fs__read", AuditOutcome::Allowed));
        log.record(record_for("fs__write", AuditOutcome::Denied));
        log.record(record_for("fs__read", AuditOutcome::Allowed));
        log.record(record_for("web__fetch", AuditOutcome::Error));

        let denied = log.query(&AuditFilter {
            outcome: Some(AuditOutcome::Denied),
            ..Default::default()
        });
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].tool, "fs__write");

        let reads = log.query(&AuditFilter {
            tool: Some("fs__read".into()),
            ..Default::default()
        });
        assert_eq!(reads.len(), 2);

        let page = log.query(&AuditFilter {
            offset: 1,
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].tool, "fs__read");
    }

    #[test]
    fn csv_export_escapes_fields() {
        let log = AuditLog::new(8);
        let mut rec = record_for("fs__read", AuditOutcome::Denied);
        rec.reason = Some("role \"guest\", not allowed".into());
        log.record(rec);
        let csv = log.export_csv();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,timestamp"));
        let row = lines.next().unwrap();
        assert!(row.contains("\"role \"\"guest\"\", not allowed\""));
    }
}
