//! Telemetry ingester.
//!
//! Validate -> normalize -> persist -> update actor -> detect anomalies ->
//! raise alarms, one event at a time. `ingest_batch` simply runs the
//! pipeline per event; nothing here assumes batches share a satellite.

use crate::alarms::AlarmRaiser;
use crate::aggregator::TelemetryAggregator;
use crate::bus::PubSubBus;
use crate::config::TelemetryThresholds;
use crate::error::StellarError;
use crate::models::{AlarmSeverity, TelemetryEvent};
use crate::registry::SatelliteRegistry;
use crate::store::SharedStore;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub source: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Anomaly {
    pub anomaly_type: String,
    pub message: String,
    pub severity: AlarmSeverity,
}

#[derive(Default)]
pub struct IngestStats {
    pub ingested: AtomicU64,
    pub anomalies_detected: AtomicU64,
    pub rejected: AtomicU64,
}

pub struct TelemetryIngester {
    store: SharedStore,
    registry: Arc<SatelliteRegistry>,
    alarms: AlarmRaiser,
    bus: PubSubBus,
    aggregator: Arc<TelemetryAggregator>,
    thresholds: TelemetryThresholds,
    retention_days: i64,
    stats: IngestStats,
}

impl TelemetryIngester {
    pub fn new(
        store: SharedStore,
        registry: Arc<SatelliteRegistry>,
        alarms: AlarmRaiser,
        bus: PubSubBus,
        aggregator: Arc<TelemetryAggregator>,
        thresholds: TelemetryThresholds,
        retention_days: i64,
    ) -> Self {
        Self {
            store,
            registry,
            alarms,
            bus,
            aggregator,
            thresholds,
            retention_days,
            stats: IngestStats::default(),
        }
    }

    pub async fn ingest(
        &self,
        satellite_id: &str,
        event_type: &str,
        payload: HashMap<String, Value>,
        opts: IngestOptions,
    ) -> Result<TelemetryEvent, StellarError> {
        if satellite_id.trim().is_empty() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(StellarError::validation("satellite id must not be empty"));
        }
        if event_type.trim().is_empty() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(StellarError::validation("event type must not be empty"));
        }

        let normalized = normalize(event_type, payload);

        let event = TelemetryEvent {
            id: Uuid::new_v4().to_string(),
            satellite_id: satellite_id.to_string(),
            event_type: event_type.to_string(),
            payload: normalized.clone(),
            recorded_at: opts.recorded_at.unwrap_or_else(Utc::now),
            source: opts.source.unwrap_or_else(|| "unknown".to_string()),
        };
        let saved = self.store.insert_telemetry_event(event).await?;
        self.stats.ingested.fetch_add(1, Ordering::Relaxed);

        self.update_actor(satellite_id, event_type, &normalized).await;
        self.record_metrics(satellite_id, event_type, &normalized, saved.recorded_at);

        let anomalies = detect_anomalies(event_type, &normalized, &self.thresholds);
        if !anomalies.is_empty() {
            self.stats
                .anomalies_detected
                .fetch_add(anomalies.len() as u64, Ordering::Relaxed);
        }
        for anomaly in anomalies {
            let mut details = HashMap::new();
            details.insert("satellite_id".to_string(), Value::String(satellite_id.to_string()));
            self.alarms
                .raise(&anomaly.anomaly_type, anomaly.severity, anomaly.message, satellite_id, details)
                .await;
        }

        self.bus.publish(
            &format!("satellites:{satellite_id}"),
            serde_json::json!({"event": "telemetry_event", "telemetry": saved}),
        );
        self.bus.publish(
            "telemetry:heartbeats",
            serde_json::json!({"satellite_id": satellite_id, "recorded_at": saved.recorded_at}),
        );

        Ok(saved)
    }

    pub async fn ingest_batch(
        &self,
        events: Vec<(String, String, HashMap<String, Value>, IngestOptions)>,
    ) -> Vec<Result<TelemetryEvent, StellarError>> {
        let mut results = Vec::with_capacity(events.len());
        for (satellite_id, event_type, payload, opts) in events {
            results.push(self.ingest(&satellite_id, &event_type, payload, opts).await);
        }
        results
    }

    async fn update_actor(&self, satellite_id: &str, event_type: &str, payload: &HashMap<String, Value>) {
        let Ok(handle) = self.registry.lookup(satellite_id) else {
            return;
        };
        match event_type {
            "status" => {
                if let Some(energy) = payload.get("energy").and_then(|v| v.as_f64()) {
                    let _ = handle.update_energy(energy - 50.0).await;
                }
                if let Some(memory) = payload.get("memory").and_then(|v| v.as_f64()) {
                    let _ = handle.update_memory(memory - 50.0).await;
                }
                if let Some(mode_str) = payload.get("mode").and_then(|v| v.as_str()) {
                    if let Some(mode) = parse_mode(mode_str) {
                        let _ = handle.set_mode(mode).await;
                    }
                }
            }
            "position" => {
                let x = payload.get("latitude").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let y = payload.get("longitude").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let z = payload.get("altitude").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let _ = handle
                    .update_position(crate::models::Position { x, y, z })
                    .await;
            }
            _ => {}
        }
    }

    /// Feeds numeric fields from a normalized event into the rolling
    /// aggregator buffers, keyed by metric name.
    fn record_metrics(&self, satellite_id: &str, event_type: &str, payload: &HashMap<String, Value>, ts: DateTime<Utc>) {
        let metrics: &[&str] = match event_type {
            "status" => &["energy", "memory", "temperature"],
            "position" => &["latitude", "longitude", "altitude", "velocity"],
            _ => return,
        };
        for metric in metrics {
            if let Some(value) = payload.get(*metric).and_then(|v| v.as_f64()) {
                self.aggregator.record(satellite_id, metric, value, Some(ts));
            }
        }
    }

    pub async fn cleanup_old_telemetry(&self) -> Result<u64, StellarError> {
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days);
        self.store.delete_telemetry_older_than(cutoff).await
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.ingested.load(Ordering::Relaxed),
            self.stats.anomalies_detected.load(Ordering::Relaxed),
            self.stats.rejected.load(Ordering::Relaxed),
        )
    }
}

fn parse_mode(s: &str) -> Option<crate::models::Mode> {
    match s.to_lowercase().as_str() {
        "nominal" => Some(crate::models::Mode::Nominal),
        "safe" => Some(crate::models::Mode::Safe),
        "survival" => Some(crate::models::Mode::Survival),
        _ => None,
    }
}

/// Per-type normalization. `status` events
/// coerce numeric fields, canonicalize `mode` to lowercase, and drop null
/// values; `position` events coerce their numeric fields; everything else
/// passes through untouched.
fn normalize(event_type: &str, payload: HashMap<String, Value>) -> HashMap<String, Value> {
    match event_type {
        "status" => {
            let mut out = HashMap::new();
            for (k, v) in payload {
                if v.is_null() {
                    continue;
                }
                match k.as_str() {
                    "energy" | "memory" | "temperature" => {
                        if let Some(n) = coerce_number(&v) {
                            out.insert(k, Value::from(n));
                        } else {
                            out.insert(k, v);
                        }
                    }
                    "mode" => {
                        if let Some(s) = v.as_str() {
                            out.insert(k, Value::String(canonicalize_mode(s)));
                        } else {
                            out.insert(k, v);
                        }
                    }
                    _ => {
                        out.insert(k, v);
                    }
                }
            }
            out
        }
        "position" => {
            let mut out = HashMap::new();
            for (k, v) in payload {
                match k.as_str() {
                    "latitude" | "longitude" | "altitude" | "velocity" => {
                        if let Some(n) = coerce_number(&v) {
                            out.insert(k, Value::from(n));
                        } else {
                            out.insert(k, v);
                        }
                    }
                    _ => {
                        out.insert(k, v);
                    }
                }
            }
            out
        }
        _ => payload,
    }
}

fn coerce_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn canonicalize_mode(raw: &str) -> String {
    let lower = raw.to_lowercase();
    match lower.as_str() {
        "nominal" | "safe" | "critical" | "standby" => lower,
        _ => lower,
    }
}

/// Anomaly threshold table. Crossing the critical threshold
/// always wins over the softer one for the same metric.
fn detect_anomalies(event_type: &str, payload: &HashMap<String, Value>, t: &TelemetryThresholds) -> Vec<Anomaly> {
    if event_type != "status" {
        return Vec::new();
    }
    let mut anomalies = Vec::new();

    if let Some(energy) = payload.get("energy").and_then(|v| v.as_f64()) {
        if energy <= t.energy_critical {
            anomalies.push(Anomaly {
                anomaly_type: "critical_energy".to_string(),
                message: format!("energy {energy:.1}% at or below critical threshold {}", t.energy_critical),
                severity: AlarmSeverity::Critical,
            });
        } else if energy <= t.energy_low {
            anomalies.push(Anomaly {
                anomaly_type: "low_energy".to_string(),
                message: format!("energy {energy:.1}% at or below warning threshold {}", t.energy_low),
                severity: AlarmSeverity::Warning,
            });
        }
    }

    if let Some(memory) = payload.get("memory").and_then(|v| v.as_f64()) {
        if memory >= t.memory_critical {
            anomalies.push(Anomaly {
                anomaly_type: "critical_memory".to_string(),
                message: format!("memory {memory:.1}% at or above critical threshold {}", t.memory_critical),
                severity: AlarmSeverity::Critical,
            });
        } else if memory >= t.memory_high {
            anomalies.push(Anomaly {
                anomaly_type: "high_memory".to_string(),
                message: format!("memory {memory:.1}% at or above warning threshold {}", t.memory_high),
                severity: AlarmSeverity::Warning,
            });
        }
    }

    if let Some(temp) = payload.get("temperature").and_then(|v| v.as_f64()) {
        if temp >= t.temperature_critical || temp <= t.temperature_low {
            anomalies.push(Anomaly {
                anomaly_type: "critical_temperature".to_string(),
                message: format!("temperature {temp:.1} outside critical bounds"),
                severity: AlarmSeverity::Critical,
            });
        } else if temp >= t.temperature_high {
            anomalies.push(Anomaly {
                anomaly_type: "high_temperature".to_string(),
                message: format!("temperature {temp:.1} at or above warning threshold {}", t.temperature_high),
                severity: AlarmSeverity::Warning,
            });
        }
    }

    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PubSubBus;
    use crate::store::InMemoryStore;

    fn ingester() -> TelemetryIngester {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let bus = PubSubBus::new();
        let registry = Arc::new(SatelliteRegistry::new(AlarmRaiser::new(store.clone(), bus.clone())));
        TelemetryIngester::new(
            store.clone(),
            registry,
            AlarmRaiser::new(store, bus.clone()),
            bus.clone(),
            Arc::new(TelemetryAggregator::new(bus)),
            TelemetryThresholds::default(),
            90,
        )
    }

    #[tokio::test]
    async fn critical_energy_raises_critical_alarm() {
        let ingester = ingester();
        let mut payload = HashMap::new();
        payload.insert("energy".to_string(), Value::from(4.0));
        let event = ingester
            .ingest("SAT-D", "status", payload, IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(event.satellite_id, "SAT-D");
        let (_, anomalies, _) = ingester.stats();
        assert_eq!(anomalies, 1);
    }

    #[tokio::test]
    async fn rejects_empty_satellite_id() {
        let ingester = ingester();
        let err = ingester
            .ingest("", "status", HashMap::new(), IngestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn normalize_drops_nulls_and_coerces_numbers() {
        let mut payload = HashMap::new();
        payload.insert("energy".to_string(), Value::String("42.5".to_string()));
        payload.insert("mode".to_string(), Value::String("NOMINAL".to_string()));
        payload.insert("dead".to_string(), Value::Null);
        let out = normalize("status", payload);
        assert_eq!(out.get("energy").and_then(|v| v.as_f64()), Some(42.5));
        assert_eq!(out.get("mode").and_then(|v| v.as_str()), Some("nominal"));
        assert!(!out.contains_key("dead"));
    }
}
