//! Canonical data model shared by the stores, the transport and storage.
//!
//! Every JSON object coming from the server or an import file goes through
//! [`canonicalize_execution`] (or the crew equivalents) before it is
//! deserialized, so legacy camelCase keys never reach the typed structs.

pub mod crew;
pub mod timestamp;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use crew::{Agent, Crew, CrewStatus, Member, Task, Template};

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Flat execution lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
        ExecutionStatus::Paused,
    ];

    /// Terminal statuses carry a `completed_at` stamp.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown execution status '{}'", s))
    }
}

// ---------------------------------------------------------------------------
// Log entries
// ---------------------------------------------------------------------------

/// One line of an execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Older frames call this `type` and use it for `success` markers too.
    #[serde(default = "default_level", alias = "type")]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_source")]
    pub source: String,
}

impl LogEntry {
    /// A fresh entry stamped now, with the default source.
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
            source: default_source(),
        }
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_level() -> String {
    "info".to_string()
}

fn default_source() -> String {
    "system".to_string()
}

// ---------------------------------------------------------------------------
// Execution record
// ---------------------------------------------------------------------------

/// One run of a crew.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    #[serde(default)]
    pub crew_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crew_name: Option<String>,
    #[serde(default)]
    pub status: ExecutionStatus,
    #[serde(default, with = "timestamp::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub api_calls: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// Server fields this client does not model; kept for export.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExecutionRecord {
    /// A client-side record for `crew_id`, started now.
    pub fn new(crew_id: &str, crew_name: Option<&str>, status: ExecutionStatus) -> Self {
        let mut record = Self {
            id: new_id(),
            crew_id: crew_id.to_string(),
            crew_name: crew_name.map(str::to_string),
            status: ExecutionStatus::Pending,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: 0,
            tokens_used: 0,
            api_calls: 0,
            cost: 0.0,
            result: None,
            error: None,
            logs: Vec::new(),
            extra: Map::new(),
        };
        record.transition(status);
        record
    }

    /// Parse a server or import object, canonicalising legacy keys first.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        let mut record: Self = match value {
            Value::Object(mut map) => {
                canonicalize_execution(&mut map);
                serde_json::from_value(Value::Object(map))?
            }
            other => serde_json::from_value(other)?,
        };
        record.transition(record.status);
        Ok(record)
    }

    /// The only way status changes. Keeps `completed_at` set exactly while
    /// the status is terminal.
    pub fn transition(&mut self, status: ExecutionStatus) {
        if status.is_terminal() {
            if self.completed_at.is_none() {
                self.completed_at = Some(Utc::now());
            }
        } else {
            self.completed_at = None;
        }
        self.status = status;
    }

    /// Shallow-merge `patch` into this record, last write wins.
    ///
    /// A `status` key is routed through [`transition`](Self::transition).
    /// On a type mismatch the record is left untouched.
    pub fn merge(&mut self, patch: &Map<String, Value>) -> Result<(), serde_json::Error> {
        let mut patch = patch.clone();
        canonicalize_execution(&mut patch);
        let status = match patch.remove("status") {
            Some(raw) => Some(serde_json::from_value::<ExecutionStatus>(raw)?),
            None => None,
        };
        // id is the merge key, never rewritten by a patch
        patch.remove("id");

        let mut merged: ExecutionRecord = merge_patch(self, &patch)?;
        let status = status.unwrap_or(merged.status);
        merged.transition(status);
        *self = merged;
        Ok(())
    }
}

/// Snapshot of backend host metrics, replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub network: f64,
    #[serde(default)]
    pub disk: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Canonicalisation and merging
// ---------------------------------------------------------------------------

const EXECUTION_ALIASES: &[(&str, &str)] = &[
    ("crewId", "crew_id"),
    ("crewName", "crew_name"),
    ("startedAt", "started_at"),
    ("completedAt", "completed_at"),
    ("duration", "duration_ms"),
    ("durationMs", "duration_ms"),
    ("tokensUsed", "tokens_used"),
    ("apiCalls", "api_calls"),
];

/// Keys whose typed field has no null representation.
const EXECUTION_NON_NULL: &[&str] = &[
    "crew_id",
    "status",
    "duration_ms",
    "tokens_used",
    "api_calls",
    "cost",
    "logs",
];

/// Rename legacy keys to the canonical schema in place.
pub fn canonicalize_execution(map: &mut Map<String, Value>) {
    rename_keys(map, EXECUTION_ALIASES);
    if !map.contains_key("started_at") {
        if let Some(created) = map.remove("created_at") {
            map.insert("started_at".to_string(), created);
        }
    }
    drop_nulls(map, EXECUTION_NON_NULL);
}

pub(crate) fn rename_keys(map: &mut Map<String, Value>, aliases: &[(&str, &str)]) {
    for (from, to) in aliases {
        if let Some(value) = map.remove(*from) {
            map.entry(to.to_string()).or_insert(value);
        }
    }
}

pub(crate) fn drop_nulls(map: &mut Map<String, Value>, keys: &[&str]) {
    for key in keys {
        if map.get(*key).is_some_and(Value::is_null) {
            map.remove(*key);
        }
    }
}

/// Serialize `current`, overlay `patch` key by key, and read it back.
pub fn merge_patch<T>(current: &T, patch: &Map<String, Value>) -> Result<T, serde_json::Error>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(current)?;
    if let Value::Object(obj) = &mut value {
        for (k, v) in patch {
            obj.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for st in ExecutionStatus::ALL {
            assert_eq!(st.as_str().parse::<ExecutionStatus>().unwrap(), st);
        }
        assert!("exploded".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_from_json_accepts_legacy_keys() {
        let rec = ExecutionRecord::from_json(json!({
            "id": "e1",
            "crewId": "c1",
            "crewName": "Research",
            "status": "running",
            "created_at": "2025-01-01T10:00:00",
            "duration": 1500,
            "tokensUsed": 42,
            "apiCalls": null,
            "vendor_field": "kept"
        }))
        .unwrap();
        assert_eq!(rec.crew_id, "c1");
        assert_eq!(rec.crew_name.as_deref(), Some("Research"));
        assert_eq!(rec.duration_ms, 1500);
        assert_eq!(rec.tokens_used, 42);
        assert_eq!(rec.api_calls, 0);
        assert!(rec.started_at.is_some());
        assert_eq!(rec.extra.get("vendor_field"), Some(&json!("kept")));
    }

    #[test]
    fn test_new_terminal_record_is_stamped() {
        let rec = ExecutionRecord::new("c1", None, ExecutionStatus::Failed);
        assert!(rec.completed_at.is_some());
        let rec = ExecutionRecord::new("c1", None, ExecutionStatus::Running);
        assert!(rec.completed_at.is_none());
    }

    #[test]
    fn test_merge_is_shallow_last_write_wins() {
        let mut rec = ExecutionRecord::new("c1", Some("Crew"), ExecutionStatus::Running);
        rec.merge(&obj(json!({"tokens_used": 100, "duration_ms": 10}))).unwrap();
        rec.merge(&obj(json!({"tokens_used": 40}))).unwrap();
        assert_eq!(rec.tokens_used, 40);
        assert_eq!(rec.duration_ms, 10);
        assert_eq!(rec.crew_name.as_deref(), Some("Crew"));
    }

    #[test]
    fn test_merge_status_goes_through_transition() {
        let mut rec = ExecutionRecord::new("c1", None, ExecutionStatus::Running);
        rec.merge(&obj(json!({"status": "cancelled"}))).unwrap();
        assert_eq!(rec.status, ExecutionStatus::Cancelled);
        assert!(rec.completed_at.is_some());

        rec.merge(&obj(json!({"status": "running"}))).unwrap();
        assert!(rec.completed_at.is_none());
    }

    #[test]
    fn test_merge_type_mismatch_leaves_record() {
        let mut rec = ExecutionRecord::new("c1", None, ExecutionStatus::Running);
        let before = rec.clone();
        assert!(rec.merge(&obj(json!({"tokens_used": "lots"}))).is_err());
        assert_eq!(rec, before);
    }

    #[test]
    fn test_merge_never_rewrites_id() {
        let mut rec = ExecutionRecord::new("c1", None, ExecutionStatus::Running);
        let id = rec.id.clone();
        rec.merge(&obj(json!({"id": "other", "result": "ok"}))).unwrap();
        assert_eq!(rec.id, id);
        assert_eq!(rec.result.as_deref(), Some("ok"));
    }

    #[test]
    fn test_log_entry_defaults() {
        let entry: LogEntry = serde_json::from_value(json!({"message": "hi"})).unwrap();
        assert_eq!(entry.level, "info");
        assert_eq!(entry.source, "system");
        assert!(!entry.id.is_empty());

        let legacy: LogEntry =
            serde_json::from_value(json!({"message": "done", "type": "success"})).unwrap();
        assert_eq!(legacy.level, "success");
    }
}
