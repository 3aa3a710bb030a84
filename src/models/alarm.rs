use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    Info,
    Warning,
    Minor,
    Major,
    Critical,
}

impl std::fmt::Display for AlarmSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlarmSeverity::Info => "info",
            AlarmSeverity::Warning => "warning",
            AlarmSeverity::Minor => "minor",
            AlarmSeverity::Major => "major",
            AlarmSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmStatus {
    Active,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub alarm_type: String,
    pub severity: AlarmSeverity,
    pub message: String,
    pub source: String,
    pub details: HashMap<String, Value>,
    pub status: AlarmStatus,
    pub raised_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl Alarm {
    pub fn new(
        id: String,
        alarm_type: impl Into<String>,
        severity: AlarmSeverity,
        message: impl Into<String>,
        source: impl Into<String>,
        details: HashMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            alarm_type: alarm_type.into(),
            severity,
            message: message.into(),
            source: source.into(),
            details,
            status: AlarmStatus::Active,
            raised_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
        }
    }
}

/// The `{summary, active_alarms}` WebSocket join snapshot shape named by
/// named but never given a concrete shape of its own, so it lives here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlarmSummary {
    pub active: usize,
    pub by_severity: HashMap<String, usize>,
}

impl AlarmSummary {
    pub fn compute<'a>(alarms: impl Iterator<Item = &'a Alarm>) -> Self {
        let mut summary = AlarmSummary::default();
        for alarm in alarms {
            if alarm.status == AlarmStatus::Active {
                summary.active += 1;
                *summary
                    .by_severity
                    .entry(alarm.severity.to_string())
                    .or_insert(0) += 1;
            }
        }
        summary
    }
}
