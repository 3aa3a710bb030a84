//! Health monitor.
//!
//! Owns a process-memory table of per-satellite `HealthRecord`s the way the
//! aggregator owns its buffer table ("process-wide tables,
//! owning subsystem writes, lock-free reads" rule) — `dashmap` again, read
//! through [`HealthMonitor::status_of`] and written only by
//! [`HealthMonitor::recheck`].

use crate::aggregator::{TelemetryAggregator, Trend};
use crate::alarms::AlarmRaiser;
use crate::bus::PubSubBus;
use crate::models::{AlarmSeverity, Mode, SatelliteRecord};
use crate::registry::SatelliteRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Healthy,
    Degraded,
    Warning,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SubsystemHealth {
    pub status: Status,
    pub metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthRecord {
    pub satellite_id: String,
    pub overall_status: Status,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub subsystems: HashMap<String, SubsystemHealth>,
    pub issues: Vec<String>,
    pub trends: HashMap<String, Trend>,
}

const SUBSYSTEM_NAMES: [&str; 6] = ["power", "thermal", "attitude", "communication", "payload", "onboard_computer"];

fn score_power(battery: Option<f64>) -> (Status, HashMap<String, f64>) {
    let mut metrics = HashMap::new();
    let Some(battery) = battery else {
        return (Status::Unknown, metrics);
    };
    metrics.insert("battery".to_string(), battery);
    let status = if battery < 5.0 {
        Status::Critical
    } else if battery < 20.0 {
        Status::Warning
    } else if battery < 35.0 {
        Status::Degraded
    } else {
        Status::Healthy
    };
    (status, metrics)
}

fn score_thermal(temperature: Option<f64>) -> (Status, HashMap<String, f64>) {
    let mut metrics = HashMap::new();
    let Some(temperature) = temperature else {
        return (Status::Unknown, metrics);
    };
    metrics.insert("temperature".to_string(), temperature);
    let status = if temperature >= 80.0 || temperature <= -40.0 {
        Status::Critical
    } else if temperature >= 60.0 {
        Status::Warning
    } else if temperature >= 45.0 {
        Status::Degraded
    } else {
        Status::Healthy
    };
    (status, metrics)
}

fn score_onboard_computer(memory_used: Option<f64>) -> (Status, HashMap<String, f64>) {
    let mut metrics = HashMap::new();
    let Some(memory_used) = memory_used else {
        return (Status::Unknown, metrics);
    };
    metrics.insert("memory".to_string(), memory_used);
    let status = if memory_used >= 95.0 {
        Status::Critical
    } else if memory_used >= 90.0 {
        Status::Warning
    } else if memory_used >= 80.0 {
        Status::Degraded
    } else {
        Status::Healthy
    };
    (status, metrics)
}

fn heartbeat_status(last_heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>, timeout_ms: i64) -> Status {
    let Some(last) = last_heartbeat else {
        return Status::Unknown;
    };
    let age_ms = (now - last).num_milliseconds();
    if age_ms > 2 * timeout_ms {
        Status::Critical
    } else if age_ms > timeout_ms {
        Status::Warning
    } else {
        Status::Healthy
    }
}

/// Overall status rule: critical if any subsystem critical; warning if any
/// warning; degraded if any degraded; unknown if more than 3 subsystems are
/// unknown; else healthy.
fn overall_status(statuses: &[Status]) -> Status {
    if statuses.iter().any(|s| *s == Status::Critical) {
        return Status::Critical;
    }
    if statuses.iter().any(|s| *s == Status::Warning) {
        return Status::Warning;
    }
    if statuses.iter().any(|s| *s == Status::Degraded) {
        return Status::Degraded;
    }
    let unknown_count = statuses.iter().filter(|s| **s == Status::Unknown).count();
    if unknown_count > 3 {
        return Status::Unknown;
    }
    Status::Healthy
}

pub struct HealthMonitor {
    records: DashMap<String, HealthRecord>,
    last_seen: DashMap<String, DateTime<Utc>>,
    registry: Arc<SatelliteRegistry>,
    aggregator: Arc<TelemetryAggregator>,
    alarms: AlarmRaiser,
    bus: PubSubBus,
    heartbeat_timeout_ms: i64,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<SatelliteRegistry>,
        aggregator: Arc<TelemetryAggregator>,
        alarms: AlarmRaiser,
        bus: PubSubBus,
        heartbeat_timeout_ms: i64,
    ) -> Self {
        Self {
            records: DashMap::new(),
            last_seen: DashMap::new(),
            registry,
            aggregator,
            alarms,
            bus,
            heartbeat_timeout_ms,
        }
    }

    /// Listens on `telemetry:heartbeats` and tracks last-seen per satellite,
    /// decoupling the monitor from the ingester the way the
    /// circular-reference note prescribes.
    pub async fn run_heartbeat_listener(self: Arc<Self>) {
        let mut sub = self.bus.subscribe("telemetry:heartbeats");
        while let Some(msg) = sub.recv().await {
            let Some(satellite_id) = msg.payload.get("satellite_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(recorded_at) = msg.payload.get("recorded_at").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Ok(ts) = DateTime::parse_from_rfc3339(recorded_at) {
                self.last_seen.insert(satellite_id.to_string(), ts.with_timezone(&Utc));
            }
        }
    }

    pub fn status_of(&self, satellite_id: &str) -> Option<HealthRecord> {
        self.records.get(satellite_id).map(|r| r.clone())
    }

    pub fn all(&self) -> Vec<HealthRecord> {
        self.records.iter().map(|e| e.value().clone()).collect()
    }

    /// Every 30s: recheck every monitored satellite, raising alarms on newly
    /// surfaced warning/critical issues and broadcasting status changes.
    pub async fn recheck_all(&self) {
        for satellite_id in self.registry.list_ids() {
            self.recheck(&satellite_id).await;
        }
    }

    async fn recheck(&self, satellite_id: &str) {
        let Ok(handle) = self.registry.lookup(satellite_id) else {
            return;
        };
        let Ok(state) = handle.get_state().await else {
            return;
        };

        let now = Utc::now();
        let last_heartbeat = self.last_seen.get(satellite_id).map(|e| *e);
        let heartbeat = heartbeat_status(last_heartbeat, now, self.heartbeat_timeout_ms);

        let temperature = self.aggregator.get_stats(satellite_id, "temperature").get("1m").map(|s| s.avg);
        let (power_status, power_metrics) = score_power(Some(state.energy));
        let (thermal_status, thermal_metrics) = score_thermal(temperature);
        let (oc_status, oc_metrics) = score_onboard_computer(Some(state.memory_used));

        let mut subsystems = HashMap::new();
        subsystems.insert("power".to_string(), SubsystemHealth { status: power_status, metrics: power_metrics });
        subsystems.insert("thermal".to_string(), SubsystemHealth { status: thermal_status, metrics: thermal_metrics });
        subsystems.insert(
            "communication".to_string(),
            SubsystemHealth { status: heartbeat, metrics: last_heartbeat.map(|ts| {
                let mut m = HashMap::new();
                m.insert("heartbeat_age_ms".to_string(), (now - ts).num_milliseconds() as f64);
                m
            }).unwrap_or_default() },
        );
        subsystems.insert("onboard_computer".to_string(), SubsystemHealth { status: oc_status, metrics: oc_metrics });
        subsystems.insert("attitude".to_string(), SubsystemHealth { status: Status::Unknown, metrics: HashMap::new() });
        subsystems.insert("payload".to_string(), SubsystemHealth { status: Status::Unknown, metrics: HashMap::new() });

        let mut trends = HashMap::new();
        for metric in ["energy", "memory", "temperature"] {
            trends.insert(metric.to_string(), self.aggregator.get_trend(satellite_id, metric));
        }

        let statuses: Vec<Status> = SUBSYSTEM_NAMES
            .iter()
            .map(|name| subsystems.get(*name).map(|s| s.status).unwrap_or(Status::Unknown))
            .collect();
        let new_overall = overall_status(&statuses);

        let issues: Vec<String> = subsystems
            .iter()
            .filter(|(_, health)| matches!(health.status, Status::Warning | Status::Critical))
            .map(|(name, _)| name.clone())
            .collect();

        let previous = self.records.get(satellite_id).map(|r| r.value().clone());
        let record = HealthRecord {
            satellite_id: satellite_id.to_string(),
            overall_status: new_overall,
            last_heartbeat,
            subsystems,
            issues: issues.clone(),
            trends,
        };

        let status_changed = previous.as_ref().map(|p| p.overall_status) != Some(new_overall);
        if status_changed {
            if matches!(new_overall, Status::Warning | Status::Critical) {
                let previous_issues: Vec<String> = previous.map(|p| p.issues).unwrap_or_default();
                for issue in &issues {
                    if !previous_issues.contains(issue) {
                        let severity = if new_overall == Status::Critical {
                            AlarmSeverity::Critical
                        } else {
                            AlarmSeverity::Warning
                        };
                        self.alarms
                            .raise(
                                "subsystem_health",
                                severity,
                                format!("{issue} subsystem reports {new_overall:?}"),
                                satellite_id,
                                HashMap::new(),
                            )
                            .await;
                    }
                }
            }
            self.bus.publish(
                &format!("satellites:{satellite_id}"),
                serde_json::json!({"event": "health_update", "health": &record}),
            );
        }

        self.records.insert(satellite_id.to_string(), record);
    }
}

/// Convenience used by tests and the reboot/restart path to seed a fresh
/// satellite into the registry without duplicating `SatelliteRecord::new`
/// call sites.
pub fn fresh_record(id: &str, name: &str) -> SatelliteRecord {
    let mut record = SatelliteRecord::new(id, name);
    record.mode = Mode::Nominal;
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn monitor() -> (Arc<HealthMonitor>, Arc<SatelliteRegistry>) {
        let store: crate::store::SharedStore = Arc::new(InMemoryStore::new());
        let bus = PubSubBus::new();
        let alarms = AlarmRaiser::new(store, bus.clone());
        let registry = Arc::new(SatelliteRegistry::new(alarms.clone()));
        let aggregator = Arc::new(TelemetryAggregator::new(bus.clone()));
        let monitor = Arc::new(HealthMonitor::new(registry.clone(), aggregator, alarms, bus, 120_000));
        (monitor, registry)
    }

    #[tokio::test]
    async fn unknown_subsystems_over_three_yield_unknown_overall() {
        let (monitor, registry) = monitor();
        registry.start(fresh_record("SAT-A", "Alpha"));
        monitor.recheck_all().await;
        let record = monitor.status_of("SAT-A").unwrap();
        // power, onboard_computer known (healthy); thermal, communication,
        // attitude, payload unknown (4 > 3) -> unknown overall.
        assert_eq!(record.overall_status, Status::Unknown);
    }

    #[tokio::test]
    async fn low_energy_drives_power_subsystem_critical() {
        let (monitor, registry) = monitor();
        let handle = registry.start(fresh_record("SAT-B", "Beta"));
        handle.update_energy(-98.0).await.unwrap();
        monitor.recheck_all().await;
        let record = monitor.status_of("SAT-B").unwrap();
        assert_eq!(record.subsystems["power"].status, Status::Critical);
        assert_eq!(record.overall_status, Status::Critical);
    }

    #[test]
    fn overall_status_prioritizes_critical_over_warning() {
        let statuses = vec![Status::Warning, Status::Critical, Status::Healthy];
        assert_eq!(overall_status(&statuses), Status::Critical);
    }

    #[test]
    fn heartbeat_status_escalates_with_age() {
        let now = Utc::now();
        assert_eq!(heartbeat_status(Some(now), now, 120_000), Status::Healthy);
        assert_eq!(heartbeat_status(Some(now - chrono::Duration::milliseconds(150_000)), now, 120_000), Status::Warning);
        assert_eq!(heartbeat_status(Some(now - chrono::Duration::milliseconds(300_000)), now, 120_000), Status::Critical);
        assert_eq!(heartbeat_status(None, now, 120_000), Status::Unknown);
    }
}
