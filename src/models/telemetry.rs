use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Immutable ingested record. Once persisted, nothing
/// mutates a `TelemetryEvent` in place — the retention sweep deletes whole
/// rows, it never edits one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: String,
    pub satellite_id: String,
    pub event_type: String,
    pub payload: HashMap<String, Value>,
    pub recorded_at: DateTime<Utc>,
    pub source: String,
}
