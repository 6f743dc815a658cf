//! Append-only audit log
//!
//! Every externally-triggered action produces exactly one event. Values
//! under sensitive keys are masked before persistence, events are never
//! mutated after the append, and expired rows are swept by maintenance.
//! An audit write must never fail the surrounding operation: on failure
//! a minimal last-resort event is appended instead.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AuditConfig;
use crate::types::{AuditId, CorrelationId, UserId};

/// Placeholder written over masked values.
const MASK: &str = "***";

/// Broad category of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    UserAction,
    SystemEvent,
    DataAccess,
    Security,
}

/// One immutable audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: AuditId,
    pub ts: DateTime<Utc>,
    pub owner: Option<UserId>,
    pub category: AuditCategory,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub description: String,
    pub success: bool,
    pub ip: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    /// Masked before/after snapshots, when the action mutated state.
    pub pre: Option<Value>,
    pub post: Option<Value>,
    pub retention_expires_at: DateTime<Utc>,
}

/// Input to one audit append.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub owner: Option<UserId>,
    pub category: AuditCategory,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub description: String,
    pub success: bool,
    pub ip: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub pre: Option<Value>,
    pub post: Option<Value>,
}

impl AuditEntry {
    pub fn action(
        owner: UserId,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            owner: Some(owner),
            category: AuditCategory::UserAction,
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            description: description.into(),
            success: true,
            ip: None,
            correlation_id: None,
            pre: None,
            post: None,
        }
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

/// Query filter for reading the log.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub owner: Option<UserId>,
    pub category: Option<AuditCategory>,
    pub correlation_id: Option<CorrelationId>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Append-only event record.
pub struct AuditLog {
    events: RwLock<Vec<AuditEvent>>,
    config: AuditConfig,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Append one event. Sensitive values in `pre`/`post` are masked;
    /// failures degrade to a minimal event rather than propagating.
    pub fn record(&self, entry: AuditEntry) -> AuditId {
        let id = AuditId::new();
        let now = Utc::now();
        let retention =
            now + chrono::Duration::days(i64::from(self.config.retention_days));

        let event = AuditEvent {
            id,
            ts: now,
            owner: entry.owner,
            category: entry.category,
            action: entry.action.clone(),
            resource_type: entry.resource_type,
            resource_id: entry.resource_id,
            description: entry.description,
            success: entry.success,
            ip: entry.ip,
            correlation_id: entry.correlation_id,
            pre: entry.pre.map(|v| self.mask(v)),
            post: entry.post.map(|v| self.mask(v)),
            retention_expires_at: retention,
        };

        self.events.write().push(event);
        id
    }

    /// Last-resort append when a richer record could not be built.
    pub fn record_minimal(&self, action: &str, error: &str) -> AuditId {
        let id = AuditId::new();
        let now = Utc::now();
        self.events.write().push(AuditEvent {
            id,
            ts: now,
            owner: None,
            category: AuditCategory::SystemEvent,
            action: action.to_string(),
            resource_type: "audit".to_string(),
            resource_id: None,
            description: format!("audit degraded: {}", error),
            success: false,
            ip: None,
            correlation_id: None,
            pre: None,
            post: None,
            retention_expires_at: now
                + chrono::Duration::days(i64::from(self.config.retention_days)),
        });
        id
    }

    /// Replace values under sensitive keys, recursively.
    fn mask(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, v)| {
                        if self.is_sensitive(&key) {
                            (key, Value::String(MASK.to_string()))
                        } else {
                            (key, self.mask(v))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.mask(v)).collect())
            }
            other => other,
        }
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let lowered = key.to_lowercase();
        self.config
            .sensitive_fields
            .iter()
            .any(|field| lowered.contains(field.as_str()))
    }

    /// Events matching the filter, oldest first. Events sharing a
    /// correlation id come back in temporal order.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let events = self.events.read();
        let mut matched: Vec<AuditEvent> = events
            .iter()
            .filter(|e| query.owner.map_or(true, |o| e.owner == Some(o)))
            .filter(|e| query.category.map_or(true, |c| e.category == c))
            .filter(|e| {
                query
                    .correlation_id
                    .map_or(true, |c| e.correlation_id == Some(c))
            })
            .filter(|e| query.since.map_or(true, |s| e.ts >= s))
            .filter(|e| query.until.map_or(true, |u| e.ts <= u))
            .cloned()
            .collect();
        if query.limit > 0 && matched.len() > query.limit {
            let skip = matched.len() - query.limit;
            matched.drain(..skip);
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drop events past their retention expiry. Returns the count
    /// expunged. This is the only way an event ever leaves the log.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.retention_expires_at > now);
        before - events.len()
    }

    /// JSON export of matching events.
    pub fn export_json(&self, query: &AuditQuery) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.query(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log() -> AuditLog {
        AuditLog::new(AuditConfig::default())
    }

    #[test]
    fn masks_sensitive_keys_recursively() {
        let log = log();
        let owner = UserId::new();
        let entry = AuditEntry {
            post: Some(json!({
                "password": "hunter2",
                "nested": { "api_token": "sk-123", "rows": 10 },
                "items": [{ "secret_key": "x" }]
            })),
            ..AuditEntry::action(owner, "update", "user", "changed settings")
        };
        let id = log.record(entry);
        let events = log.query(&AuditQuery::default());
        let event = events.iter().find(|e| e.id == id).unwrap();
        let post = event.post.as_ref().unwrap();
        assert_eq!(post["password"], "***");
        assert_eq!(post["nested"]["api_token"], "***");
        assert_eq!(post["nested"]["rows"], 10);
        assert_eq!(post["items"][0]["secret_key"], "***");
    }

    #[test]
    fn correlation_events_stay_in_temporal_order() {
        let log = log();
        let owner = UserId::new();
        let correlation = CorrelationId::new();
        for i in 0..5 {
            log.record(
                AuditEntry::action(owner, format!("step_{}", i), "agent_run", "step")
                    .with_correlation(correlation),
            );
        }
        let events = log.query(&AuditQuery {
            correlation_id: Some(correlation),
            ..Default::default()
        });
        assert_eq!(events.len(), 5);
        for window in events.windows(2) {
            assert!(window[0].ts <= window[1].ts);
        }
    }

    #[test]
    fn sweep_removes_only_expired_rows() {
        let mut config = AuditConfig::default();
        config.retention_days = 0;
        let expiring = AuditLog::new(config);
        let owner = UserId::new();
        expiring.record(AuditEntry::action(owner, "a", "r", "d"));
        // retention_days = 0 means expiry is "now"; sleep past it.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(expiring.sweep_expired(), 1);
        assert!(expiring.is_empty());

        let keeping = log();
        keeping.record(AuditEntry::action(owner, "a", "r", "d"));
        assert_eq!(keeping.sweep_expired(), 0);
        assert_eq!(keeping.len(), 1);
    }

    #[test]
    fn minimal_event_survives_degraded_writes() {
        let log = log();
        log.record_minimal("agent_step", "serialization failed");
        let events = log.query(&AuditQuery::default());
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert!(events[0].description.contains("serialization failed"));
    }

    #[test]
    fn query_limit_keeps_most_recent() {
        let log = log();
        let owner = UserId::new();
        for i in 0..10 {
            log.record(AuditEntry::action(owner, format!("a{}", i), "r", "d"));
        }
        let events = log.query(&AuditQuery {
            owner: Some(owner),
            limit: 3,
            ..Default::default()
        });
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].action, "a9");

        let exported = log.export_json(&AuditQuery::default()).unwrap();
        assert!(exported.contains("\"a0\""));
    }
}
